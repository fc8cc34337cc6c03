use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into the categories the compilation pipeline distinguishes between:
///
/// ## Input Errors
/// - [`Error::Malformed`] - A bytecode file or code item is structurally invalid
/// - [`Error::OutOfBounds`] - An index or offset points outside of its table or buffer
///
/// ## Resolution Errors
///
/// These are *expected* during bulk phases. The driver observes them, logs them at debug level
/// and moves on to the next unit of work.
///
/// - [`Error::ClassNotFound`] - A type descriptor could not be resolved
/// - [`Error::NoSuchField`] - A field reference did not match any field
/// - [`Error::NoSuchMethod`] - A method reference did not match any method
/// - [`Error::IncompatibleClassChange`] - A reference resolved to a member of the wrong kind
/// - [`Error::VerifyError`] - A method failed structural verification
/// - [`Error::InitializationFailed`] - A static initializer threw or could not be interpreted
///
/// ## Output Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::MmapFailed`] - Creating or accessing the output buffer failed
/// - [`Error::FinalizationFailed`] - Flushing or truncating the output failed
/// - [`Error::Compression`] - The payload could not be compressed or decompressed
///
/// ## Policy Errors
/// - [`Error::HardVerifierFailure`] - At least one class failed verification and the driver was
///   configured to treat this as fatal
///
/// # Examples
///
/// ```rust,no_run
/// use oatforge::Error;
///
/// fn report(result: oatforge::Result<()>) {
///     match result {
///         Ok(()) => println!("done"),
///         Err(Error::HardVerifierFailure(count)) => eprintln!("{count} classes failed"),
///         Err(Error::Malformed { message, file, line }) => {
///             eprintln!("Malformed input: {} ({}:{})", message, file, line);
///         }
///         Err(e) => eprintln!("Other error: {}", e),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be processed.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// A type descriptor could not be resolved by the class linker.
    #[error("Class not found - {0}")]
    ClassNotFound(String),

    /// A field reference could not be matched against the resolved class hierarchy.
    #[error("No such field - {0}")]
    NoSuchField(String),

    /// A method reference could not be matched against the resolved class hierarchy.
    #[error("No such method - {0}")]
    NoSuchMethod(String),

    /// A member was found, but it is of an incompatible kind (static vs. instance, interface vs.
    /// class).
    #[error("Incompatible class change - {0}")]
    IncompatibleClassChange(String),

    /// A class or method failed verification.
    #[error("Verification failed - {0}")]
    VerifyError(String),

    /// A class could not be initialized.
    #[error("Initialization failed - {0}")]
    InitializationFailed(String),

    /// The image payload could not be compressed or decompressed.
    #[error("Compression failed - {0}")]
    Compression(String),

    /// Memory-mapped output operation failed.
    ///
    /// This error occurs when memory-mapped file operations fail during image output,
    /// such as when creating or accessing the output buffer.
    #[error("Memory mapping failed: {0}")]
    MmapFailed(String),

    /// Output file finalization failed.
    #[error("Output finalization failed: {0}")]
    FinalizationFailed(String),

    /// Hard verifier failures were recorded and the driver was configured to abort on them.
    ///
    /// Returned only after every phase completed and statistics were collected; any artifact
    /// produced by the run must not be trusted.
    #[error("Aborting compilation: {0} class(es) had hard verifier failures")]
    HardVerifierFailure(usize),
}

impl Error {
    /// Returns `true` if this error is one of the resolution failures that bulk phases absorb.
    #[must_use]
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            Error::ClassNotFound(_)
                | Error::NoSuchField(_)
                | Error::NoSuchMethod(_)
                | Error::IncompatibleClassChange(_)
                | Error::VerifyError(_)
                | Error::InitializationFailed(_)
        )
    }
}

//! Compilation options.
//!
//! [`CompilerOptions`] is a plain configuration struct with a [`Default`] implementation and a
//! few named presets for the common build kinds:
//!
//! ```rust
//! use oatforge::compiler::{CompilerFilter, CompilerOptions, ImageKind};
//!
//! let options = CompilerOptions::boot_image();
//! assert_eq!(options.image_kind, ImageKind::Boot);
//! assert!(options.force_determinism);
//!
//! let verify = CompilerOptions::verify_only();
//! assert!(!verify.compiler_filter.is_compilation_enabled());
//! ```

use std::{collections::BTreeSet, time::Duration};

use strum::{Display, EnumIter, EnumString};

use crate::dex::MethodReference;

/// How much work the compiler does per method.
///
/// Filters are ordered: every filter does at least the work of the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum CompilerFilter {
    /// Trust the input: mark every class verified without running the verifier
    VerifyNone,
    /// Verify, quicken, never generate native code
    InterpretOnly,
    /// Defer verification to runtime
    VerifyAtRuntime,
    /// Compile, favoring output size
    Space,
    /// Compile, balancing size and speed
    Balanced,
    /// Compile, favoring speed
    Speed,
    /// Compile everything that can be compiled
    Everything,
}

impl CompilerFilter {
    /// Returns `true` if the verifier runs under this filter.
    #[must_use]
    pub fn is_verification_enabled(self) -> bool {
        !matches!(self, CompilerFilter::VerifyNone | CompilerFilter::VerifyAtRuntime)
    }

    /// Returns `true` if native code is generated under this filter.
    #[must_use]
    pub fn is_compilation_enabled(self) -> bool {
        self >= CompilerFilter::Space
    }
}

/// The kind of heap image produced alongside the compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter)]
pub enum ImageKind {
    /// No image; compiled code only
    #[default]
    None,
    /// A boot image holding the core classes
    Boot,
    /// An application image layered on a boot image
    App,
}

/// Target instruction set of the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter)]
pub enum InstructionSet {
    /// No native target; only dex-to-dex output is produced
    None,
    /// 32-bit ARM (Thumb-2)
    Arm,
    /// 64-bit ARM
    Arm64,
    /// 32-bit x86
    X86,
    /// 64-bit x86
    #[default]
    X86_64,
}

impl InstructionSet {
    /// Size of a native pointer in bytes.
    #[must_use]
    pub fn pointer_size(self) -> u32 {
        match self {
            InstructionSet::Arm | InstructionSet::X86 => 4,
            InstructionSet::None | InstructionSet::Arm64 | InstructionSet::X86_64 => 8,
        }
    }

    /// Required alignment of the start of a method's code.
    #[must_use]
    pub fn code_alignment(self) -> usize {
        match self {
            InstructionSet::Arm => 8,
            InstructionSet::None
            | InstructionSet::Arm64
            | InstructionSet::X86
            | InstructionSet::X86_64 => 16,
        }
    }

    /// Returns `true` if the runtime ships a generic JNI entry stub for this target, so native
    /// methods work without a compiled stub.
    #[must_use]
    pub fn has_generic_jni_stub(self) -> bool {
        self != InstructionSet::None
    }
}

/// Options of one compiler driver run.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Per-method work level
    pub compiler_filter: CompilerFilter,
    /// Kind of image produced alongside the code
    pub image_kind: ImageKind,
    /// Target of the generated code
    pub instruction_set: InstructionSet,
    /// Total threads, including the orchestrating one
    pub thread_count: usize,
    /// Run resolution and initialization single-threaded for reproducible output
    pub force_determinism: bool,
    /// Generate position-independent code
    pub compile_pic: bool,
    /// Fail the whole run after all phases if any class hard-failed verification
    pub abort_on_hard_verifier_failure: bool,
    /// Methods taking longer than this to compile are reported
    pub slow_method_threshold: Duration,
    /// Log the statistics at the end of the run
    pub dump_stats: bool,
    /// When a direct-call target lives in another file, look for the same method under a
    /// different index of the caller's own file
    pub best_effort_dex_cache_reuse: bool,
    /// Compile native methods to JNI stubs even when a generic stub exists
    pub compile_jni: bool,
    /// Descriptors of the classes that must go into the image; `None` allows every class
    pub image_classes: Option<BTreeSet<String>>,
    /// Descriptors of the classes to compile; `None` compiles every class
    pub classes_to_compile: Option<BTreeSet<String>>,
    /// Pretty names (`Lpkg/Cls;->name`) of the methods to compile; `None` compiles every method
    pub methods_to_compile: Option<BTreeSet<String>>,
    /// Classes whose static initializer is never run at compile time
    pub no_preload_classes: BTreeSet<String>,
    /// Hot methods; when present only these are compiled natively
    pub profile: Option<BTreeSet<MethodReference>>,
    /// Run the second dex-to-dex pass on the worker pool
    pub multi_threaded_dex_to_dex: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            compiler_filter: CompilerFilter::Speed,
            image_kind: ImageKind::None,
            instruction_set: InstructionSet::default(),
            thread_count: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            force_determinism: false,
            compile_pic: false,
            abort_on_hard_verifier_failure: false,
            slow_method_threshold: Duration::from_secs(1),
            dump_stats: false,
            best_effort_dex_cache_reuse: true,
            compile_jni: false,
            image_classes: None,
            classes_to_compile: None,
            methods_to_compile: None,
            no_preload_classes: BTreeSet::new(),
            profile: None,
            multi_threaded_dex_to_dex: false,
        }
    }
}

impl CompilerOptions {
    /// Options for a reproducible boot image build.
    #[must_use]
    pub fn boot_image() -> Self {
        CompilerOptions {
            image_kind: ImageKind::Boot,
            force_determinism: true,
            abort_on_hard_verifier_failure: true,
            ..Self::default()
        }
    }

    /// Options for an application image build.
    #[must_use]
    pub fn app_image() -> Self {
        CompilerOptions {
            image_kind: ImageKind::App,
            compile_pic: true,
            ..Self::default()
        }
    }

    /// Options that verify and quicken but never generate native code.
    #[must_use]
    pub fn verify_only() -> Self {
        CompilerOptions {
            compiler_filter: CompilerFilter::InterpretOnly,
            ..Self::default()
        }
    }

    /// Returns `true` when building a boot image.
    #[must_use]
    pub fn is_boot_image(&self) -> bool {
        self.image_kind == ImageKind::Boot
    }

    /// Returns `true` when building an application image.
    #[must_use]
    pub fn is_app_image(&self) -> bool {
        self.image_kind == ImageKind::App
    }

    /// Returns `true` if `descriptor` is on the initializer black-list, either by name or
    /// through the `$NoPreloadHolder` naming convention.
    #[must_use]
    pub fn is_no_preload(&self, descriptor: &str) -> bool {
        descriptor.ends_with("$NoPreloadHolder;") || self.no_preload_classes.contains(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_filter_order() {
        let filters: Vec<_> = CompilerFilter::iter().collect();
        assert!(filters.windows(2).all(|w| w[0] < w[1]));
        assert!(!CompilerFilter::VerifyNone.is_verification_enabled());
        assert!(CompilerFilter::InterpretOnly.is_verification_enabled());
        assert!(!CompilerFilter::InterpretOnly.is_compilation_enabled());
        assert!(CompilerFilter::Space.is_compilation_enabled());
    }

    #[test]
    fn test_filter_names() {
        assert_eq!(CompilerFilter::VerifyAtRuntime.to_string(), "verify-at-runtime");
        assert_eq!(CompilerFilter::from_str("speed").unwrap(), CompilerFilter::Speed);
    }

    #[test]
    fn test_presets() {
        let boot = CompilerOptions::boot_image();
        assert!(boot.is_boot_image());
        assert!(boot.force_determinism);
        assert!(boot.best_effort_dex_cache_reuse);

        let app = CompilerOptions::app_image();
        assert!(app.is_app_image());
        assert!(app.compile_pic);

        assert_eq!(
            CompilerOptions::verify_only().compiler_filter,
            CompilerFilter::InterpretOnly
        );
        assert!(CompilerOptions::default().thread_count >= 1);
    }

    #[test]
    fn test_no_preload() {
        let mut options = CompilerOptions::default();
        options.no_preload_classes.insert("Lcom/Blocked;".to_string());
        assert!(options.is_no_preload("Lcom/Foo$NoPreloadHolder;"));
        assert!(options.is_no_preload("Lcom/Blocked;"));
        assert!(!options.is_no_preload("Lcom/Foo;"));
    }

    #[test]
    fn test_instruction_set() {
        assert_eq!(InstructionSet::Arm.pointer_size(), 4);
        assert_eq!(InstructionSet::Arm64.pointer_size(), 8);
        assert!(InstructionSet::X86.has_generic_jni_stub());
        assert!(!InstructionSet::None.has_generic_jni_stub());
    }
}

//! Ahead-of-time compilation of bytecode files.
//!
//! The compiler resolves the symbolic references of a batch of bytecode files against a
//! [`crate::runtime::Runtime`], verifies and initializes their classes, and compiles every method
//! either to native code through a [`CodeGenerator`] or, when that is declined, to quickened
//! bytecode through the dex-to-dex optimizer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ CompilerDriver                                                   │
//! │   ├─ ParallelCompilationManager  work cursor over a rayon pool   │
//! │   ├─ registries                  compiled methods and classes,   │
//! │   │                              verification results            │
//! │   └─ per method                                                  │
//! │        ├─ lowering     batched field and method resolution       │
//! │        ├─ sharpening   devirtualization, direct call pointers    │
//! │        ├─ backend      CodeGenerator (native or JNI stub)        │
//! │        └─ dex_to_dex   in-place quickening, second pass          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`CompilerDriver`] - Runs the phases and owns the registries
//! - [`CompilerOptions`] - Filters, image kind, threading and determinism knobs
//! - [`CompiledMethod`] - Code, metadata and linker patches of one method
//! - [`AotCompilationStats`] - Resolution and optimization counters

/// Native code generation interface and the bundled stub generator
pub mod backend;
/// Compiled artifacts
pub mod compiled_method;
/// In-place bytecode quickening
pub mod dex_to_dex;
/// Phase orchestration and artifact registries
pub mod driver;
/// Field and method lowering information
pub mod lowering;
/// Compiler configuration
pub mod options;
/// Parallel iteration over index ranges
pub mod parallel;
/// Invoke sharpening and direct call decisions
pub mod sharpening;
/// Compilation statistics
pub mod stats;
/// The method under compilation
pub mod unit;

pub use backend::{CodeGenerator, MethodCompilationContext, StubCodeGenerator};
pub use compiled_method::{CompiledClass, CompiledMethod, LinkerPatch, PatchTarget};
pub use dex_to_dex::{
    decode_quickening_info, dex_to_dex_compile, encode_quickening_info,
    DexToDexCompilationLevel, QuickenedInfo, QuickeningOracle,
};
pub use driver::{CompilerDriver, DexFileMethodSet};
pub use lowering::{FieldLoweringInfo, InstanceFieldInfo, MethodLoweringInfo, StaticFieldInfo};
pub use options::{CompilerFilter, CompilerOptions, ImageKind, InstructionSet};
pub use parallel::ParallelCompilationManager;
pub use sharpening::{DirectPointer, InvokeInfo, SharpeningContext};
pub use stats::AotCompilationStats;
pub use unit::DexCompilationUnit;

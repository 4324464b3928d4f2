#![allow(
    clippy::must_use_candidate, // accessors on plain data; callers decide
    clippy::missing_errors_doc, // every error is a fatal invariant violation, see `Error`
    clippy::module_name_repetitions
)]

pub mod abi;
pub mod compile;
pub mod context;
pub mod error;
pub mod regs;
pub mod unwind;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use compile::{ArchCompileState, FunctionShape, WindowPartition};
pub use context::{FrameWalker, MachineContext, UnwindCursor, UnwindReg, WalkConfig};
pub use error::{Error, Result};
pub use regs::{IA64_REGISTER_FILE, OperandClass, RegBank, RegMask, RegisterFile};
pub use unwind::{UnwindInfo, UnwindRegistry};

use crate::context::UnwindReg;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unwind cursor failed to access register {reg:?}: {reason}")]
    CursorRegister { reg: UnwindReg, reason: String },

    #[error("unwind cursor failed to step: {0}")]
    CursorStep(String),

    #[error("no parent frame above sp={sp:#x}")]
    NoParentFrame { sp: u64 },

    #[error("return address {0:#x} cannot be mapped back to a call site")]
    InvalidReturnAddress(u64),

    #[error("frame walk exceeded {0} steps")]
    WalkLimitExceeded(usize),

    #[error("branch target L{label} referenced at offset {site:#x} was never bound")]
    UnresolvedBranchTarget { label: u32, site: usize },

    #[error("label L{label} rebound from {old:#x} to {new:#x}")]
    LabelRebound { label: u32, old: usize, new: usize },

    #[error("branch offset {0:#x} is not bundle aligned")]
    MisalignedBranch(usize),

    #[error("register window overflow: {0}")]
    WindowOverflow(String),

    #[error("stack frame too large: {0}")]
    FrameTooLarge(String),

    #[error("code marker out of order: {0}")]
    MarkerOrder(String),

    #[error("epilogue end offset not recorded; unwind info cannot be built")]
    EpilogNotEmitted,

    #[error("unwind regions were already handed off")]
    UnwindAlreadyHandedOff,

    #[error("code range at {start:#x} with length {len:#x} is empty or wraps the address space")]
    InvalidCodeRange { start: u64, len: usize },

    #[error("unwind range {start:#x}..{end:#x} overlaps a registered function")]
    UnwindRangeOverlap { start: u64, end: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Test harness for ia64-arch unit and integration tests.
//!
//! Provides [`FrameChainCursor`], an in-memory [`UnwindCursor`] over a fixed list of
//! frames, so execution contexts can be exercised without a real unwinder.
//!
//! # Example
//!
//! ```rust
//! use ia64_arch::test_harness::*;
//! use ia64_arch::MachineContext;
//!
//! let cursor = FrameChainCursor::new(vec![
//!     SyntheticFrame::new(0x2000, 0x7ffe_0000),
//!     SyntheticFrame::new(0x4010, 0x7fff_0000),
//! ]);
//! let ctx = MachineContext::from_unwound(cursor);
//! assert_eq!(ctx.ip().unwrap(), 0x1fff);
//! assert_eq!(ctx.fp().unwrap(), 0x7fff_0000);
//! ```

#![allow(clippy::must_use_candidate, clippy::missing_panics_doc)]

use std::cell::RefCell;
use std::collections::HashMap;

use crate::context::{UnwindCursor, UnwindReg};
use crate::{Error, Result};

/// One frame of a synthetic stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticFrame {
    pub ip: u64,
    pub sp: u64,
    pub regs: HashMap<UnwindReg, u64>,
}

impl SyntheticFrame {
    pub fn new(ip: u64, sp: u64) -> Self {
        Self {
            ip,
            sp,
            regs: HashMap::new(),
        }
    }

    /// Add another register value visible in this frame.
    #[must_use]
    pub fn with_reg(mut self, reg: UnwindReg, value: u64) -> Self {
        self.regs.insert(reg, value);
        self
    }
}

/// Cursor over a list of frames, innermost first.
///
/// Clones own their frame list, so writes and steps on a clone never reach the
/// original.
#[derive(Debug, Clone)]
pub struct FrameChainCursor {
    frames: Vec<SyntheticFrame>,
    depth: usize,
    /// Step from the outermost frame back to the innermost (a corrupted chain).
    cyclic: bool,
}

impl FrameChainCursor {
    pub fn new(frames: Vec<SyntheticFrame>) -> Self {
        Self {
            frames,
            depth: 0,
            cyclic: false,
        }
    }

    /// A chain whose outermost frame links back to the innermost one.
    pub fn cyclic(frames: Vec<SyntheticFrame>) -> Self {
        Self {
            cyclic: true,
            ..Self::new(frames)
        }
    }

    /// Build a chain from `(ip, sp)` pairs, innermost first.
    pub fn from_pairs(pairs: &[(u64, u64)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|&(ip, sp)| SyntheticFrame::new(ip, sp))
                .collect(),
        )
    }

    /// Index of the frame the cursor currently describes.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn frame(&self) -> Result<&SyntheticFrame> {
        self.frames
            .get(self.depth)
            .ok_or_else(|| Error::CursorStep(format!("cursor exhausted at depth {}", self.depth)))
    }

    fn frame_mut(&mut self) -> Result<&mut SyntheticFrame> {
        let depth = self.depth;
        self.frames
            .get_mut(depth)
            .ok_or_else(|| Error::CursorStep(format!("cursor exhausted at depth {depth}")))
    }
}

thread_local! {
    static CURRENT_CHAIN: RefCell<Option<Vec<SyntheticFrame>>> = const { RefCell::new(None) };
}

/// Install the frames [`FrameChainCursor::snapshot_current`] reports for this thread.
pub fn install_current_chain(frames: Vec<SyntheticFrame>) {
    CURRENT_CHAIN.with(|chain| *chain.borrow_mut() = Some(frames));
}

/// Remove the frames installed by [`install_current_chain`].
pub fn clear_current_chain() {
    CURRENT_CHAIN.with(|chain| *chain.borrow_mut() = None);
}

impl UnwindCursor for FrameChainCursor {
    fn snapshot_current() -> Result<Self> {
        CURRENT_CHAIN
            .with(|chain| chain.borrow().clone())
            .map(Self::new)
            .ok_or_else(|| Error::Internal("no frame chain installed for this thread".to_string()))
    }

    fn step(&mut self) -> Result<bool> {
        if self.depth + 1 < self.frames.len() {
            self.depth += 1;
            Ok(true)
        } else if self.cyclic && !self.frames.is_empty() {
            self.depth = 0;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn read_register(&self, reg: UnwindReg) -> Result<u64> {
        let frame = self.frame()?;
        match reg {
            UnwindReg::Ip => Ok(frame.ip),
            UnwindReg::Sp => Ok(frame.sp),
            other => frame
                .regs
                .get(&other)
                .copied()
                .ok_or_else(|| Error::CursorRegister {
                    reg: other,
                    reason: format!("not recorded in frame {}", self.depth),
                }),
        }
    }

    fn write_register(&mut self, reg: UnwindReg, value: u64) -> Result<()> {
        let frame = self.frame_mut()?;
        match reg {
            UnwindReg::Ip => frame.ip = value,
            UnwindReg::Sp => frame.sp = value,
            other => {
                frame.regs.insert(other, value);
            }
        }
        Ok(())
    }
}

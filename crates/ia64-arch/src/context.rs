//! Execution context backed by an unwind cursor.
//!
//! IA-64 has no fixed in-memory trap frame worth copying: the register stack engine
//! keeps stacked registers in the backing store and the unwinder reconstructs
//! everything else. A context is therefore an unwind cursor plus one bit telling
//! whether the cursor's IP is the faulting instruction itself or a return address.
//!
//! Stepping a cursor is destructive. Anything that needs the parent frame while
//! keeping the current one (the frame pointer, [`MachineContext::parent`]) steps a
//! clone.

use crate::abi::INSTRUCTION_UNIT;
use crate::{Error, Result};

/// Registers the context reads or writes through the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindReg {
    Ip,
    Sp,
    /// Previous function state (`ar.pfs`).
    Pfs,
    Gr(u8),
    Br(u8),
}

/// Stack-walking capability provided by the unwinder.
///
/// `Clone` must duplicate the full cursor state: stepping a clone never affects
/// the original.
pub trait UnwindCursor: Clone {
    /// Capture the state of the calling thread.
    fn snapshot_current() -> Result<Self>;

    /// Move to the parent frame. `Ok(false)` means there is no parent.
    fn step(&mut self) -> Result<bool>;

    fn read_register(&self, reg: UnwindReg) -> Result<u64>;

    fn write_register(&mut self, reg: UnwindReg, value: u64) -> Result<()>;
}

/// Logical machine state of one frame.
#[derive(Debug, Clone)]
pub struct MachineContext<C> {
    cursor: C,
    /// Whenever the IP in `cursor` points at the instruction where the exception
    /// happened. Only true for contexts captured at a signal boundary or from the
    /// current thread; every walked ancestor holds a return address.
    precise_ip: bool,
}

impl<C: UnwindCursor> MachineContext<C> {
    /// Context captured synchronously at a fault; the IP is the faulting instruction.
    pub fn from_signal(cursor: C) -> Self {
        Self {
            cursor,
            precise_ip: true,
        }
    }

    /// Context reconstructed from a saved return address.
    pub fn from_unwound(cursor: C) -> Self {
        Self {
            cursor,
            precise_ip: false,
        }
    }

    /// Snapshot the calling thread.
    pub fn from_current() -> Result<Self> {
        Ok(Self::from_signal(C::snapshot_current()?))
    }

    /// Context for starting a walk at `start_func`.
    ///
    /// The unwinder can only snapshot the calling thread, so the function start is
    /// not used; the walk begins at the current frame.
    pub fn from_function(_start_func: u64) -> Result<Self> {
        Self::from_current()
    }

    pub fn cursor(&self) -> &C {
        &self.cursor
    }

    pub fn into_cursor(self) -> C {
        self.cursor
    }

    pub fn is_precise(&self) -> bool {
        self.precise_ip
    }

    /// Instruction pointer of the logical fault or call site.
    pub fn ip(&self) -> Result<u64> {
        let ip = self.cursor.read_register(UnwindReg::Ip)?;
        if self.precise_ip {
            Ok(ip)
        } else {
            // Return address: back up so the ip points into the call itself.
            ip.checked_sub(INSTRUCTION_UNIT)
                .ok_or(Error::InvalidReturnAddress(ip))
        }
    }

    pub fn sp(&self) -> Result<u64> {
        self.cursor.read_register(UnwindReg::Sp)
    }

    /// The frame pointer is the SP of the parent frame.
    pub fn fp(&self) -> Result<u64> {
        let mut parent = self.cursor.clone();
        if !parent.step()? {
            return Err(Error::NoParentFrame { sp: self.sp()? });
        }
        parent.read_register(UnwindReg::Sp)
    }

    pub fn set_ip(&mut self, ip: u64) -> Result<()> {
        self.cursor.write_register(UnwindReg::Ip, ip)
    }

    pub fn set_sp(&mut self, sp: u64) -> Result<()> {
        self.cursor.write_register(UnwindReg::Sp, sp)
    }

    /// No-op: there is no frame pointer register, it is always derived from the
    /// parent frame.
    pub fn set_fp(&mut self, _fp: u64) {}

    /// Point the context at the entry of the function described by `desc`.
    pub fn set_function(&mut self, desc: &FunctionDescriptor) -> Result<()> {
        self.set_ip(desc.entry)
    }

    /// Context of the caller, or `None` at the outermost frame.
    pub fn parent(&self) -> Result<Option<Self>> {
        let mut cursor = self.cursor.clone();
        if !cursor.step()? {
            return Ok(None);
        }
        tracing::trace!(sp = ?cursor.read_register(UnwindReg::Sp).ok(), "stepped to parent frame");
        Ok(Some(Self::from_unwound(cursor)))
    }

    /// Walk this frame and its ancestors, outermost last.
    pub fn walk(self, config: WalkConfig) -> FrameWalker<C> {
        FrameWalker {
            pending: Some(Ok(self)),
            steps: 0,
            max_steps: config.max_steps,
        }
    }
}

/// IA-64 function descriptor: entry address followed by the callee's global pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub entry: u64,
    /// Not part of the frame state; [`MachineContext::set_function`] only moves the IP.
    /// Carried for callers that switch r1 before resuming at `entry`.
    pub gp: u64,
}

impl FunctionDescriptor {
    pub fn from_words(words: [u64; 2]) -> Self {
        Self {
            entry: words[0],
            gp: words[1],
        }
    }
}

/// Last managed frame record pushed on transitions into native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lmf {
    pub frame: u64,
}

impl Lmf {
    /// Marker entry at the top of a thread's LMF chain.
    pub fn top() -> Self {
        Self { frame: u64::MAX }
    }

    pub fn is_top(&self) -> bool {
        self.frame == u64::MAX
    }
}

/// Bounds for [`FrameWalker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkConfig {
    /// Parent steps after which the walk is considered runaway.
    pub max_steps: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self { max_steps: 1024 }
    }
}

/// Iterator over a context and its ancestors.
///
/// A cyclic or corrupted frame chain ends the walk with
/// [`Error::WalkLimitExceeded`] instead of looping forever.
pub struct FrameWalker<C> {
    pending: Option<Result<MachineContext<C>>>,
    steps: usize,
    max_steps: usize,
}

impl<C: UnwindCursor> Iterator for FrameWalker<C> {
    type Item = Result<MachineContext<C>>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = match self.pending.take()? {
            Ok(ctx) => ctx,
            Err(e) => return Some(Err(e)),
        };

        self.pending = match current.parent() {
            Ok(Some(parent)) => {
                self.steps += 1;
                if self.steps > self.max_steps {
                    tracing::warn!(max_steps = self.max_steps, "frame walk did not terminate");
                    Some(Err(Error::WalkLimitExceeded(self.max_steps)))
                } else {
                    Some(Ok(parent))
                }
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        };

        Some(Ok(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{FrameChainCursor, SyntheticFrame};

    fn two_frames() -> FrameChainCursor {
        FrameChainCursor::new(vec![
            SyntheticFrame::new(0x2000, 0x7ffe_0000),
            SyntheticFrame::new(0x4010, 0x7fff_0000),
        ])
    }

    #[test]
    fn test_precise_ip_is_raw() {
        let ctx = MachineContext::from_signal(two_frames());
        assert!(ctx.is_precise());
        assert_eq!(ctx.ip().unwrap(), 0x2000);
    }

    #[test]
    fn test_imprecise_ip_backs_up_one_unit() {
        let ctx = MachineContext::from_unwound(two_frames());
        assert_eq!(ctx.ip().unwrap(), 0x2000 - INSTRUCTION_UNIT);
    }

    #[test]
    fn test_imprecise_ip_zero_is_rejected() {
        let ctx = MachineContext::from_unwound(FrameChainCursor::new(vec![SyntheticFrame::new(
            0, 0x1000,
        )]));
        assert!(matches!(ctx.ip(), Err(Error::InvalidReturnAddress(0))));
    }

    #[test]
    fn test_fp_is_parent_sp_and_leaves_cursor() {
        let ctx = MachineContext::from_signal(two_frames());
        let sp_before = ctx.sp().unwrap();
        assert_eq!(ctx.fp().unwrap(), 0x7fff_0000);
        assert_eq!(ctx.sp().unwrap(), sp_before);
        assert_eq!(ctx.cursor().depth(), 0);
    }

    #[test]
    fn test_fp_without_parent_fails() {
        let ctx = MachineContext::from_signal(FrameChainCursor::new(vec![SyntheticFrame::new(
            0x2000, 0x1000,
        )]));
        assert!(matches!(ctx.fp(), Err(Error::NoParentFrame { sp: 0x1000 })));
    }

    #[test]
    fn test_setters_write_through() {
        let mut ctx = MachineContext::from_signal(two_frames());
        ctx.set_ip(0x3000).unwrap();
        ctx.set_sp(0x5000).unwrap();
        ctx.set_fp(0xdead);
        assert_eq!(ctx.ip().unwrap(), 0x3000);
        assert_eq!(ctx.sp().unwrap(), 0x5000);
        assert_eq!(ctx.fp().unwrap(), 0x7fff_0000);
    }

    #[test]
    fn test_set_function_uses_entry_word() {
        let mut ctx = MachineContext::from_signal(two_frames());
        let desc = FunctionDescriptor::from_words([0x4000_0000, 0x6000_0000]);
        assert_eq!(desc.gp, 0x6000_0000);
        ctx.set_function(&desc).unwrap();
        assert_eq!(ctx.ip().unwrap(), 0x4000_0000);
        assert_eq!(ctx.cursor().read_register(UnwindReg::Gr(1)).ok(), None);
    }

    #[test]
    fn test_parent_is_imprecise() {
        let ctx = MachineContext::from_signal(two_frames());
        let parent = ctx.parent().unwrap().unwrap();
        assert!(!parent.is_precise());
        assert_eq!(parent.ip().unwrap(), 0x4010 - INSTRUCTION_UNIT);
        assert!(parent.parent().unwrap().is_none());
    }

    #[test]
    fn test_lmf_top_marker() {
        assert!(Lmf::top().is_top());
        assert!(!Lmf { frame: 0x1000 }.is_top());
    }
}

//! Unwind regions for JIT-compiled functions.
//!
//! Each compiled function is described to the stack walker as a short list of
//! regions (prologue, body, epilogue), each carrying the operations that change the
//! frame state and the instruction slot at which they take effect. The regions are
//! built once per function after the epilogue has been emitted and then moved into
//! the [`UnwindRegistry`]; the compiler never touches them again.

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::abi::{BUNDLE_SIZE, SLOTS_PER_BUNDLE};
use crate::{Error, Result};

/// Frame state the unwinder tracks for a JIT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreservedReg {
    /// Previous function state (`ar.pfs`).
    ArPfs,
    /// Return branch register.
    B0,
    /// Previous stack pointer.
    Psp,
    /// Frame pointer register.
    Fp,
}

/// One change to the frame state, effective at instruction slot `when` of its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    /// `reg` is copied into general register `into`.
    SaveReg {
        when: u32,
        reg: PreservedReg,
        into: u8,
    },
    /// `reg` is stored at `sp + offset`.
    SpillSpRel {
        when: u32,
        reg: PreservedReg,
        offset: i32,
    },
    /// The memory stack pointer moves by `delta` bytes.
    AddSp { when: u32, delta: i64 },
    /// Remember the state at the end of the region under `label`.
    LabelState { when: u32, label: u32 },
    /// Restore the state remembered under `label`.
    CopyState { when: u32, label: u32 },
    /// `count` frames are torn down.
    PopFrames { when: u32, count: u32 },
}

impl UnwindOp {
    pub fn when(&self) -> u32 {
        match *self {
            Self::SaveReg { when, .. }
            | Self::SpillSpRel { when, .. }
            | Self::AddSp { when, .. }
            | Self::LabelState { when, .. }
            | Self::CopyState { when, .. }
            | Self::PopFrames { when, .. } => when,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Prologue,
    Body,
    Epilogue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRegion {
    pub kind: RegionKind,
    /// Byte offset of the region's first bundle within the function.
    pub start: usize,
    /// Length in instruction slots.
    pub insn_count: u32,
    pub ops: Vec<UnwindOp>,
}

impl UnwindRegion {
    pub fn end(&self) -> usize {
        self.start + self.insn_count as usize / SLOTS_PER_BUNDLE * BUNDLE_SIZE
    }

    pub fn contains(&self, offset: usize) -> bool {
        (self.start..self.end()).contains(&offset)
    }
}

/// Build the region covering bytes `start..end` of a function's code.
pub fn create_unwind_region(
    kind: RegionKind,
    start: usize,
    end: usize,
    ops: Vec<UnwindOp>,
) -> Result<UnwindRegion> {
    if start % BUNDLE_SIZE != 0 || end % BUNDLE_SIZE != 0 {
        return Err(Error::MarkerOrder(format!(
            "{kind:?} region {start:#x}..{end:#x} is not bundle aligned"
        )));
    }
    if end < start {
        return Err(Error::MarkerOrder(format!(
            "{kind:?} region ends at {end:#x} before it starts at {start:#x}"
        )));
    }
    let insn_count = ((end - start) / BUNDLE_SIZE * SLOTS_PER_BUNDLE) as u32;
    if let Some(op) = ops.iter().find(|op| op.when() >= insn_count.max(1)) {
        return Err(Error::Internal(format!(
            "{kind:?} region op {op:?} lies past its {insn_count} slots"
        )));
    }
    Ok(UnwindRegion {
        kind,
        start,
        insn_count,
        ops,
    })
}

/// Where in its function an offset lies, from the walker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Frame not (fully) established yet.
    Prologue,
    Body,
    /// Frame being torn down.
    Epilogue,
    /// Outside every region of the function.
    Outside,
}

/// Complete unwind description of one compiled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    pub code_len: usize,
    pub regions: Vec<UnwindRegion>,
}

impl UnwindInfo {
    pub fn phase_at(&self, offset: usize) -> FramePhase {
        self.regions
            .iter()
            .find(|region| region.contains(offset))
            .map_or(FramePhase::Outside, |region| match region.kind {
                RegionKind::Prologue => FramePhase::Prologue,
                RegionKind::Body => FramePhase::Body,
                RegionKind::Epilogue => FramePhase::Epilogue,
            })
    }
}

/// A function whose unwind info has been handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFunction {
    pub start: u64,
    pub info: UnwindInfo,
}

impl RegisteredFunction {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.info.code_len as u64)
    }
}

/// Runtime table of unwind info for JIT code, keyed by code start address.
///
/// Shared between compiling threads; registration takes a write lock.
#[derive(Debug, Default)]
pub struct UnwindRegistry {
    table: RwLock<BTreeMap<u64, RegisteredFunction>>,
}

impl UnwindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `info` for the code at `start`.
    ///
    /// The code range must be non-empty and must not overlap any registered function.
    pub fn register(&self, start: u64, info: UnwindInfo) -> Result<()> {
        let len = info.code_len;
        let end = u64::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|&end| end > start)
            .ok_or(Error::InvalidCodeRange { start, len })?;
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);

        let below = table.range(..end).next_back().map(|(_, f)| f.end());
        if below.is_some_and(|prev_end| prev_end > start) {
            return Err(Error::UnwindRangeOverlap { start, end });
        }

        tracing::debug!(
            start,
            len = info.code_len,
            regions = info.regions.len(),
            "registered unwind info"
        );
        table.insert(start, RegisteredFunction { start, info });
        Ok(())
    }

    /// Drop the unwind info of the code at `start`, e.g. after the method is invalidated.
    pub fn unregister(&self, start: u64) -> Option<UnwindInfo> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&start)
            .map(|f| f.info)
    }

    /// Function containing `ip`.
    pub fn lookup(&self, ip: u64) -> Option<RegisteredFunction> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .range(..=ip)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| ip < f.end())
            .cloned()
    }

    /// Frame phase of `ip`, or `None` if no registered function contains it.
    pub fn phase_of(&self, ip: u64) -> Option<FramePhase> {
        self.lookup(ip)
            .map(|f| f.info.phase_at((ip - f.start) as usize))
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Per-function architecture state attached to each compilation.
//!
//! Filled in three phases:
//!   1. layout: window partition, saved registers and stack frame, from the
//!      [`FunctionShape`] before any code exists;
//!   2. emission: prologue/epilogue markers and branch targets, recorded as the
//!      emitter appends to the code buffer;
//!   3. unwind hand-off: exactly once, after the epilogue, the unwind regions are
//!      built and moved into the runtime's [`UnwindRegistry`].
//!
//! The state is owned by the thread compiling the function and never shared.

#![allow(clippy::cast_possible_truncation)]

mod branch;
mod layout;

pub use branch::{BranchTargets, Label, ResolvedBranch};
pub use layout::{
    FrameLayout, FunctionShape, Layout, SavedRegisters, SpillSlots, WindowPartition,
    compute_layout,
};

use crate::abi::{BUNDLE_SIZE, SLOTS_PER_BUNDLE};
use crate::regs::is_global_ireg;
use crate::unwind::{
    PreservedReg, RegionKind, UnwindInfo, UnwindOp, UnwindRegistry, create_unwind_region,
};
use crate::{Error, Result};

/// Label under which the body's frame state is remembered for code past the epilogue.
const BODY_STATE_LABEL: u32 = 1;

#[derive(Debug, Clone)]
pub struct ArchCompileState {
    pub partition: WindowPartition,
    pub saved: SavedRegisters,
    pub frame: FrameLayout,
    pub omit_fp: bool,
    pub branch_targets: BranchTargets,
    prolog_end_offset: Option<usize>,
    epilog_begin_offset: Option<usize>,
    epilog_end_offset: Option<usize>,
    unwind_handed_off: bool,
}

impl ArchCompileState {
    /// Run the layout phase for a function of the given shape.
    pub fn new(shape: &FunctionShape) -> Result<Self> {
        let Layout {
            partition,
            saved,
            frame,
            omit_fp,
        } = compute_layout(shape)?;
        Ok(Self {
            partition,
            saved,
            frame,
            omit_fp,
            branch_targets: BranchTargets::new(),
            prolog_end_offset: None,
            epilog_begin_offset: None,
            epilog_end_offset: None,
            unwind_handed_off: false,
        })
    }

    pub fn stack_alloc_size(&self) -> i32 {
        self.frame.stack_alloc_size
    }

    pub fn localloc_offset(&self) -> i32 {
        self.frame.localloc_offset
    }

    pub fn is_global_ireg(&self, reg: u8) -> bool {
        is_global_ireg(reg, &self.partition)
    }

    pub fn prolog_end_offset(&self) -> Option<usize> {
        self.prolog_end_offset
    }

    pub fn epilog_begin_offset(&self) -> Option<usize> {
        self.epilog_begin_offset
    }

    pub fn epilog_end_offset(&self) -> Option<usize> {
        self.epilog_end_offset
    }

    pub fn unwind_handed_off(&self) -> bool {
        self.unwind_handed_off
    }

    // ── Emission markers ──

    pub fn mark_prolog_end(&mut self, offset: usize) -> Result<()> {
        record_marker(&mut self.prolog_end_offset, "prologue end", Some(0), offset)
    }

    pub fn mark_epilog_begin(&mut self, offset: usize) -> Result<()> {
        let after = require(self.prolog_end_offset, "prologue end")?;
        record_marker(
            &mut self.epilog_begin_offset,
            "epilogue begin",
            Some(after),
            offset,
        )
    }

    pub fn mark_epilog_end(&mut self, offset: usize) -> Result<()> {
        let after = require(self.epilog_begin_offset, "epilogue begin")?;
        record_marker(
            &mut self.epilog_end_offset,
            "epilogue end",
            Some(after),
            offset,
        )
    }

    /// Resolve all branch references once the code buffer is final.
    pub fn finish_emission(&mut self) -> Result<&[ResolvedBranch]> {
        self.branch_targets.resolve()
    }

    // ── Unwind hand-off ──

    /// Build the unwind regions for `code_len` bytes of emitted code.
    pub fn build_unwind_info(&self, code_len: usize) -> Result<UnwindInfo> {
        let epilog_end = self.epilog_end_offset.ok_or(Error::EpilogNotEmitted)?;
        let prolog_end = require(self.prolog_end_offset, "prologue end")?;
        let epilog_begin = require(self.epilog_begin_offset, "epilogue begin")?;
        if code_len < epilog_end {
            return Err(Error::MarkerOrder(format!(
                "code length {code_len:#x} ends before the epilogue at {epilog_end:#x}"
            )));
        }

        let mut regions = Vec::new();

        let prologue_ops = self.prologue_ops(slots(0, prolog_end));
        if prolog_end > 0 {
            regions.push(create_unwind_region(
                RegionKind::Prologue,
                0,
                prolog_end,
                prologue_ops,
            )?);
        } else if !prologue_ops.is_empty() {
            return Err(Error::MarkerOrder(
                "frame state changes but the prologue is empty".to_string(),
            ));
        }

        let body_slots = slots(prolog_end, epilog_begin);
        let epilog_slots = slots(epilog_begin, epilog_end);
        let label_body = body_slots > 0 && epilog_slots > 0;
        if body_slots > 0 {
            let ops = if label_body {
                vec![UnwindOp::LabelState {
                    when: body_slots - 1,
                    label: BODY_STATE_LABEL,
                }]
            } else {
                Vec::new()
            };
            regions.push(create_unwind_region(
                RegionKind::Body,
                prolog_end,
                epilog_begin,
                ops,
            )?);
        }

        if epilog_slots > 0 {
            regions.push(create_unwind_region(
                RegionKind::Epilogue,
                epilog_begin,
                epilog_end,
                vec![UnwindOp::PopFrames {
                    when: epilog_slots - 1,
                    count: 1,
                }],
            )?);
        }

        // Out-of-line code after the epilogue runs with the body's frame.
        if code_len > epilog_end {
            let ops = if label_body {
                vec![UnwindOp::CopyState {
                    when: 0,
                    label: BODY_STATE_LABEL,
                }]
            } else {
                Vec::new()
            };
            regions.push(create_unwind_region(
                RegionKind::Body,
                epilog_end,
                code_len,
                ops,
            )?);
        }

        Ok(UnwindInfo { code_len, regions })
    }

    /// Frame-state changes of the prologue, in emission order.
    fn prologue_ops(&self, prolog_slots: u32) -> Vec<UnwindOp> {
        let last = prolog_slots.saturating_sub(1);
        let mut ops = Vec::new();
        let mut slot = 0u32;
        let saves = [
            (self.saved.ar_pfs, PreservedReg::ArPfs),
            (self.saved.b0, PreservedReg::B0),
            (self.saved.sp, PreservedReg::Psp),
            (self.saved.fp, PreservedReg::Fp),
        ];
        for (reg, preserved) in saves {
            if let Some(into) = reg {
                ops.push(UnwindOp::SaveReg {
                    when: slot.min(last),
                    reg: preserved,
                    into,
                });
                slot += 1;
            }
        }

        if self.frame.stack_alloc_size > 0 {
            ops.push(UnwindOp::AddSp {
                when: last,
                delta: -i64::from(self.frame.stack_alloc_size),
            });
        }

        let spills = [
            (self.saved.spills.ar_pfs, PreservedReg::ArPfs),
            (self.saved.spills.b0, PreservedReg::B0),
            (self.saved.spills.sp, PreservedReg::Psp),
            (self.saved.spills.fp, PreservedReg::Fp),
        ];
        for (offset, reg) in spills {
            if let Some(offset) = offset {
                ops.push(UnwindOp::SpillSpRel {
                    when: last,
                    reg,
                    offset,
                });
            }
        }
        ops
    }

    /// Build the unwind regions and move them into `registry`. Must be called
    /// exactly once per function, after the epilogue has been emitted and every
    /// branch reference has been bound.
    pub fn hand_off_unwind(
        &mut self,
        registry: &UnwindRegistry,
        code_start: u64,
        code_len: usize,
    ) -> Result<()> {
        if self.unwind_handed_off {
            return Err(Error::UnwindAlreadyHandedOff);
        }
        self.branch_targets.resolve()?;
        let info = self.build_unwind_info(code_len)?;
        tracing::debug!(
            code_start,
            code_len,
            regions = info.regions.len(),
            "handing off unwind regions"
        );
        registry.register(code_start, info)?;
        self.unwind_handed_off = true;
        Ok(())
    }
}

fn require(marker: Option<usize>, name: &str) -> Result<usize> {
    marker.ok_or_else(|| Error::MarkerOrder(format!("{name} not recorded yet")))
}

fn record_marker(
    slot: &mut Option<usize>,
    name: &str,
    not_before: Option<usize>,
    offset: usize,
) -> Result<()> {
    if offset % BUNDLE_SIZE != 0 {
        return Err(Error::MarkerOrder(format!(
            "{name} at {offset:#x} is not bundle aligned"
        )));
    }
    if let Some(old) = *slot {
        return Err(Error::MarkerOrder(format!(
            "{name} already recorded at {old:#x}"
        )));
    }
    if let Some(min) = not_before
        && offset < min
    {
        return Err(Error::MarkerOrder(format!(
            "{name} at {offset:#x} precedes {min:#x}"
        )));
    }
    *slot = Some(offset);
    Ok(())
}

/// Instruction slots in bytes `start..end`.
fn slots(start: usize, end: usize) -> u32 {
    ((end - start) / BUNDLE_SIZE * SLOTS_PER_BUNDLE) as u32
}

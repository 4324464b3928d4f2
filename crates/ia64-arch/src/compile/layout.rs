// Frame layout: register window partition, saved-register assignment and stack frame.
//
// Fixed before any instruction is emitted, from the function's shape alone.
//
// Stacked register window (r32 upwards):
//   [reg_in0, reg_local0)   incoming arguments, at most 8
//   [reg_local0, reg_out0)  locals: saved ar.pfs, b0, sp, fp, return value, then
//                           globals handed to the allocator
//   [reg_out0, +n_out_regs) outgoing arguments, at most 8
//
// Leaf functions never execute a call or an `alloc`, so they reserve no locals
// (reg_out0 == reg_local0). Their saved sp, frame pointer and return value live in
// static registers the allocator never hands out.
//
// Memory stack frame (growing up from the post-prologue sp):
//   0                   scratch area (non-leaf only)
//   +16                 outgoing stack arguments beyond the 8th
//   localloc_offset     start of dynamically allocated memory
//   ...                 fixed locals
//   lmf_offset          LMF record, if needed
//   ...                 spill slots for saved registers (exception clauses)

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::struct_excessive_bools
)]

use crate::abi::{
    FIRST_STACKED_REG, FRAME_ALIGNMENT, LEAF_FP_REG, LEAF_SAVED_RETURN_REG, LEAF_SAVED_SP_REG,
    MAX_IREGS, MAX_REG_ARGS, MAX_STACKED_REGS, SCRATCH_AREA_SIZE, SLOT_SIZE, align_up,
};
use crate::{Error, Result};

/// What the front end knows about a function before code generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionShape {
    pub num_params: usize,
    pub has_this: bool,
    /// Values the allocator wants to keep in registers across calls.
    pub num_global_locals: usize,
    /// Largest argument count over all call sites; `None` for leaf functions.
    pub max_out_args: Option<usize>,
    pub uses_localloc: bool,
    pub has_exception_clauses: bool,
    pub saves_return_value: bool,
    pub needs_lmf: bool,
    /// Bytes of fixed stack locals.
    pub locals_size: i32,
}

impl FunctionShape {
    pub fn is_leaf(&self) -> bool {
        self.max_out_args.is_none()
    }

    pub fn num_args(&self) -> usize {
        self.num_params + usize::from(self.has_this)
    }

    /// The frame pointer is needed whenever sp moves dynamically or handlers have to
    /// find the frame.
    pub fn omit_frame_pointer(&self) -> bool {
        !(self.uses_localloc || self.has_exception_clauses)
    }
}

/// Boundaries of the input, local and output parts of the register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPartition {
    pub reg_in0: u8,
    pub reg_local0: u8,
    pub reg_out0: u8,
    pub n_out_regs: u8,
}

impl WindowPartition {
    pub fn n_in_regs(&self) -> u8 {
        self.reg_local0 - self.reg_in0
    }

    pub fn n_local_regs(&self) -> u8 {
        self.reg_out0 - self.reg_local0
    }

    /// Size of locals operand of `alloc` (inputs plus locals).
    pub fn size_of_locals(&self) -> u8 {
        self.reg_out0 - self.reg_in0
    }

    /// Size of frame operand of `alloc`.
    pub fn size_of_frame(&self) -> u8 {
        self.size_of_locals() + self.n_out_regs
    }

    pub fn in_reg(&self, index: u8) -> Option<u8> {
        if index < self.n_in_regs() {
            Some(self.reg_in0 + index)
        } else {
            None
        }
    }

    pub fn out_reg(&self, index: u8) -> Option<u8> {
        if index < self.n_out_regs {
            Some(self.reg_out0 + index)
        } else {
            None
        }
    }

    /// Whether the function executes `alloc` at all.
    pub fn is_empty(&self) -> bool {
        self.size_of_frame() == 0
    }

    fn validate(&self) -> Result<()> {
        if self.reg_in0 < FIRST_STACKED_REG {
            return Err(Error::WindowOverflow(format!(
                "input registers start at r{} below the stacked range",
                self.reg_in0
            )));
        }
        if self.reg_local0 > self.reg_out0 {
            return Err(Error::WindowOverflow(format!(
                "locals start r{} after outputs r{}",
                self.reg_local0, self.reg_out0
            )));
        }
        let end = usize::from(self.reg_out0) + usize::from(self.n_out_regs);
        if end > MAX_IREGS {
            return Err(Error::WindowOverflow(format!(
                "window ends at r{end}, past r{}",
                MAX_IREGS - 1
            )));
        }
        Ok(())
    }
}

/// Registers holding frame-management state: stacked locals for non-leaf functions,
/// static registers for leaf functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedRegisters {
    pub ar_pfs: Option<u8>,
    pub b0: Option<u8>,
    pub sp: Option<u8>,
    pub fp: Option<u8>,
    pub return_val: Option<u8>,
    /// Memory copies of the above, relative to the post-prologue sp.
    pub spills: SpillSlots,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillSlots {
    pub ar_pfs: Option<i32>,
    pub b0: Option<i32>,
    pub sp: Option<i32>,
    pub fp: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub stack_alloc_size: i32,
    pub localloc_offset: i32,
    pub lmf_offset: Option<i32>,
}

/// Result of the layout phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub partition: WindowPartition,
    pub saved: SavedRegisters,
    pub frame: FrameLayout,
    pub omit_fp: bool,
}

pub fn compute_layout(shape: &FunctionShape) -> Result<Layout> {
    let omit_fp = shape.omit_frame_pointer();
    let leaf = shape.is_leaf();

    let n_in = shape.num_args().min(MAX_REG_ARGS);
    let n_out = shape.max_out_args.unwrap_or(0).min(MAX_REG_ARGS);

    let reg_in0 = FIRST_STACKED_REG;
    let reg_local0 = reg_in0 + n_in as u8;

    let mut saved = SavedRegisters::default();
    let mut next = reg_local0;
    if leaf {
        if !omit_fp {
            saved.sp = Some(LEAF_SAVED_SP_REG);
            saved.fp = Some(LEAF_FP_REG);
        }
        if shape.saves_return_value {
            saved.return_val = Some(LEAF_SAVED_RETURN_REG);
        }
    } else {
        // Saved frame state comes first in the locals.
        let mut take = || {
            let reg = next;
            next += 1;
            Some(reg)
        };
        saved.ar_pfs = take();
        saved.b0 = take();
        saved.sp = take();
        if !omit_fp {
            saved.fp = take();
        }
        if shape.saves_return_value {
            saved.return_val = take();
        }
    }
    let n_saved = usize::from(next - reg_local0);

    let budget = MAX_STACKED_REGS
        .checked_sub(n_in + n_saved + n_out)
        .ok_or_else(|| {
            Error::WindowOverflow(format!(
                "{n_in} inputs, {n_saved} saved and {n_out} outputs exceed {MAX_STACKED_REGS} registers"
            ))
        })?;

    let mut n_globals = if leaf { 0 } else { shape.num_global_locals };
    if n_globals > budget {
        tracing::debug!(
            requested = n_globals,
            available = budget,
            "clipping global locals to the register window"
        );
        n_globals = budget;
    }
    // The local region is never smaller than the outgoing argument count.
    let n_locals = (n_saved + n_globals).max(n_out).min(n_saved + budget);

    let partition = WindowPartition {
        reg_in0,
        reg_local0,
        reg_out0: reg_local0 + n_locals as u8,
        n_out_regs: n_out as u8,
    };
    partition.validate()?;

    let frame = compute_frame(shape, &mut saved)?;

    tracing::debug!(
        in0 = partition.reg_in0,
        local0 = partition.reg_local0,
        out0 = partition.reg_out0,
        n_out = partition.n_out_regs,
        stack = frame.stack_alloc_size,
        omit_fp,
        "computed frame layout"
    );

    Ok(Layout {
        partition,
        saved,
        frame,
        omit_fp,
    })
}

fn compute_frame(shape: &FunctionShape, saved: &mut SavedRegisters) -> Result<FrameLayout> {
    let mut offset = FrameOffset::default();
    if !shape.is_leaf() {
        offset.add(SCRATCH_AREA_SIZE)?;
    }
    let stack_args = shape.max_out_args.unwrap_or(0).saturating_sub(MAX_REG_ARGS);
    let stack_args_size = i32::try_from(stack_args)
        .ok()
        .and_then(|n| n.checked_mul(SLOT_SIZE))
        .ok_or_else(|| Error::FrameTooLarge(format!("{stack_args} stack arguments")))?;
    offset.add(stack_args_size)?;

    let localloc_offset = offset.0;
    let locals = align_up(shape.locals_size.max(0), SLOT_SIZE)
        .ok_or_else(|| Error::FrameTooLarge(format!("{} bytes of locals", shape.locals_size)))?;
    offset.add(locals)?;

    let lmf_offset = if shape.needs_lmf {
        Some(offset.slot()?)
    } else {
        None
    };

    // Handlers run in their own register window and reload the frame state from memory.
    if shape.has_exception_clauses {
        let mut spill = |reg: Option<u8>| reg.map(|_| offset.slot()).transpose();
        saved.spills = SpillSlots {
            ar_pfs: spill(saved.ar_pfs)?,
            b0: spill(saved.b0)?,
            sp: spill(saved.sp)?,
            fp: spill(saved.fp)?,
        };
    }

    let stack_alloc_size = align_up(offset.0, FRAME_ALIGNMENT)
        .ok_or_else(|| Error::FrameTooLarge(format!("{} bytes", offset.0)))?;
    Ok(FrameLayout {
        stack_alloc_size,
        localloc_offset,
        lmf_offset,
    })
}

/// Running size of the memory frame.
#[derive(Default)]
struct FrameOffset(i32);

impl FrameOffset {
    fn add(&mut self, bytes: i32) -> Result<()> {
        self.0 = self
            .0
            .checked_add(bytes)
            .ok_or_else(|| Error::FrameTooLarge(format!("{} + {bytes} bytes", self.0)))?;
        Ok(())
    }

    /// Reserve one stack slot and return its offset.
    fn slot(&mut self) -> Result<i32> {
        let at = self.0;
        self.add(SLOT_SIZE)?;
        Ok(at)
    }
}

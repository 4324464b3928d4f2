//! IA-64 ABI constants (register numbering, window limits, frame and code alignment).
//!
//! This module centralizes the numbers the register file descriptor, the execution
//! context and the per-function layout all agree on.

// ── Register Files ──

/// Number of logical integer registers (r0-r127).
pub const MAX_IREGS: usize = 128;

/// Number of logical floating-point registers (f0-f127).
pub const MAX_FREGS: usize = 128;

// ── Register Assignments ──

/// Integer return value register (r8).
/// Also the first of the four scratch return registers r8-r11.
pub const R8: u8 = 8;

/// Memory stack pointer (r12).
pub const SP_REG: u8 = 12;

/// Global pointer (r1).
pub const GP_REG: u8 = 1;

/// Floating-point return value register (f8).
pub const F8: u8 = 8;

/// Return branch register (b0).
pub const B0: u8 = 0;

/// Static register holding the entry sp of a leaf function that keeps a frame pointer.
/// Leaf functions execute no `alloc`, so their frame state lives below r32.
pub const LEAF_SAVED_SP_REG: u8 = 30;

/// Frame pointer of a leaf function.
pub const LEAF_FP_REG: u8 = 31;

/// Saved return value of a leaf function.
pub const LEAF_SAVED_RETURN_REG: u8 = 2;

/// First stacked (windowed) integer register (r32).
/// Registers r32-r127 rotate with each `alloc`; everything below is static.
pub const FIRST_STACKED_REG: u8 = 32;

/// Maximum number of stacked registers a single frame can allocate.
pub const MAX_STACKED_REGS: usize = 96;

/// Arguments beyond this count are passed in memory, both incoming and outgoing.
pub const MAX_REG_ARGS: usize = 8;

/// Whether the return value registers may also be handed out by the allocator.
pub const RETURN_REG_REUSE: bool = true;

// ── Code Layout ──

/// Instructions are grouped into 16-byte bundles.
pub const BUNDLE_SIZE: usize = 16;

/// Each bundle carries three instruction slots.
pub const SLOTS_PER_BUNDLE: usize = 3;

/// Alignment of JIT-emitted function entry points.
pub const CODE_ALIGNMENT: usize = 16;

/// Distance between a return address and the call it returns from.
///
/// IPs reported by the unwinder for caller frames point just past the call;
/// subtracting one lands inside the bundle that made the call.
pub const INSTRUCTION_UNIT: u64 = 1;

// ── Stack Frame Layout ──

/// Stack frames are kept 16-byte aligned.
pub const FRAME_ALIGNMENT: i32 = 16;

/// Scratch area the callee may clobber at the bottom of every caller's frame.
pub const SCRATCH_AREA_SIZE: i32 = 16;

/// Size of one stack slot for spilled registers and outgoing arguments.
pub const SLOT_SIZE: i32 = 8;

/// Round `value` up to the next multiple of `align` (a power of two), or `None` on overflow.
#[must_use]
pub const fn align_up(value: i32, align: i32) -> Option<i32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

//! IA-64 register file descriptor.
//!
//! Static description of the integer and floating-point register files as seen by
//! the register allocator: which registers it may assign freely, which the callee
//! has to preserve, and which operand classes are pinned to a physical register.
//!
//! Allocatable registers:
//!   - r8-r11, r14-r29: static scratch registers, clobbered by calls.
//!   - f6-f15, f34-f63: float scratch and argument registers.
//!
//! Everything else in the integer file (r0-r7, r12, r13, r30, r31 and the whole
//! stacked range r32-r127) is callee-saved from the allocator's point of view. The
//! stacked registers are handed out per function through the register window
//! partition instead (see [`is_global_ireg`]).

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use crate::abi::{F8, MAX_FREGS, MAX_IREGS, R8};
use crate::compile::WindowPartition;

/// Sentinel returned by the tag-keyed lookups when the allocator decides freely.
pub const NO_FIXED_REG: i32 = -1;

/// A set of registers from one register file, one bit per logical register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegMask(u128);

impl RegMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u128::MAX);

    #[must_use]
    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Registers `first..=last`.
    #[must_use]
    pub const fn range(first: u8, last: u8) -> Self {
        assert!(first <= last && (last as usize) < MAX_IREGS);
        let width = (last - first) as u32 + 1;
        let ones = if width == 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        };
        Self(ones << first)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn complement(self) -> Self {
        Self(!self.0)
    }

    #[must_use]
    pub const fn contains(self, reg: u8) -> bool {
        (reg as usize) < MAX_IREGS && self.0 & (1u128 << reg) != 0
    }

    #[must_use]
    pub const fn with(self, reg: u8) -> Self {
        assert!((reg as usize) < MAX_IREGS);
        Self(self.0 | (1u128 << reg))
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Registers in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let reg = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            Some(reg)
        })
    }
}

impl BitAnd for RegMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for RegMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Not for RegMask {
    type Output = Self;

    fn not(self) -> Self {
        self.complement()
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegMask({:#034x})", self.0)
    }
}

/// Which physical register file a value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBank {
    Int,
    Float,
}

/// Register class of an instruction operand, as written in the machine description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandClass {
    /// `'i'`: any integer register.
    Int,
    /// `'r'`: integer value pinned to the return register r8.
    IntResult,
    /// `'f'`: any floating-point register.
    Float,
    /// `'g'`: float value pinned to the return register f8.
    FloatResult,
}

impl OperandClass {
    pub const ALL: [Self; 4] = [Self::Int, Self::IntResult, Self::Float, Self::FloatResult];

    #[must_use]
    pub const fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'i' => Some(Self::Int),
            'r' => Some(Self::IntResult),
            'f' => Some(Self::Float),
            'g' => Some(Self::FloatResult),
            _ => None,
        }
    }

    #[must_use]
    pub const fn tag(self) -> char {
        match self {
            Self::Int => 'i',
            Self::IntResult => 'r',
            Self::Float => 'f',
            Self::FloatResult => 'g',
        }
    }

    #[must_use]
    pub const fn bank(self) -> RegBank {
        match self {
            Self::Int | Self::IntResult => RegBank::Int,
            Self::Float | Self::FloatResult => RegBank::Float,
        }
    }
}

/// Allocator-facing view of both register files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    pub num_int_regs: usize,
    pub num_float_regs: usize,
    pub allocatable_int: RegMask,
    pub allocatable_float: RegMask,
    pub callee_saved_int: RegMask,
    pub callee_saved_float: RegMask,
    pub int_return_reg: u8,
    pub float_return_reg: u8,
}

/// r8-r11, r14-r29.
const CALLEE_REGS: RegMask = RegMask::from_bits(0xf00 | 0x3fff_c000);

/// f6-f15, f34-f63.
// TODO: hand f64-f127 to the allocator once the float spill code handles the upper half.
const CALLEE_FREGS: RegMask = RegMask::from_bits(0xffff_fffc_0000_0000 | (0x3ff << 6));

pub const IA64_REGISTER_FILE: RegisterFile = RegisterFile {
    num_int_regs: MAX_IREGS,
    num_float_regs: MAX_FREGS,
    allocatable_int: CALLEE_REGS,
    allocatable_float: CALLEE_FREGS,
    callee_saved_int: CALLEE_REGS.complement(),
    callee_saved_float: RegMask::EMPTY,
    int_return_reg: R8,
    float_return_reg: F8,
};

impl RegisterFile {
    /// Every logical register of `bank`.
    #[must_use]
    pub fn registers(&self, bank: RegBank) -> RegMask {
        let count = match bank {
            RegBank::Int => self.num_int_regs,
            RegBank::Float => self.num_float_regs,
        };
        if count == 0 {
            RegMask::EMPTY
        } else {
            RegMask::range(0, (count - 1) as u8)
        }
    }

    #[must_use]
    pub const fn allocatable(&self, bank: RegBank) -> RegMask {
        match bank {
            RegBank::Int => self.allocatable_int,
            RegBank::Float => self.allocatable_float,
        }
    }

    #[must_use]
    pub const fn callee_saved(&self, bank: RegBank) -> RegMask {
        match bank {
            RegBank::Int => self.callee_saved_int,
            RegBank::Float => self.callee_saved_float,
        }
    }

    #[must_use]
    pub const fn return_reg(&self, bank: RegBank) -> u8 {
        match bank {
            RegBank::Int => self.int_return_reg,
            RegBank::Float => self.float_return_reg,
        }
    }
}

/// Physical register an operand of `class` is pinned to, if any.
#[must_use]
pub const fn fixed_reg(class: OperandClass) -> Option<u8> {
    match class {
        OperandClass::IntResult => Some(IA64_REGISTER_FILE.int_return_reg),
        OperandClass::FloatResult => Some(IA64_REGISTER_FILE.float_return_reg),
        OperandClass::Int | OperandClass::Float => None,
    }
}

/// Tag-keyed form of [`fixed_reg`]; unknown tags yield [`NO_FIXED_REG`].
#[must_use]
pub fn fixed_reg_for_tag(tag: char) -> i32 {
    OperandClass::from_tag(tag)
        .and_then(fixed_reg)
        .map_or(NO_FIXED_REG, i32::from)
}

#[must_use]
pub const fn is_float(class: OperandClass) -> bool {
    matches!(class.bank(), RegBank::Float)
}

#[must_use]
pub const fn is_float_tag(tag: char) -> bool {
    matches!(tag, 'f' | 'g')
}

/// No value on this architecture spans two physical registers.
#[must_use]
pub const fn is_regpair(_class: OperandClass) -> bool {
    false
}

#[must_use]
pub const fn regpair_reg2(_class: OperandClass, _hreg1: u8) -> Option<u8> {
    None
}

/// Extra constraint on the second source operand; none on IA-64.
#[must_use]
pub const fn sreg2_mask(_class: OperandClass) -> RegMask {
    RegMask::EMPTY
}

/// Whether `reg` is a stacked local of the current frame, usable for values that
/// must survive calls.
#[must_use]
pub fn is_global_ireg(reg: u8, partition: &WindowPartition) -> bool {
    usize::from(reg) < MAX_IREGS && (partition.reg_local0..partition.reg_out0).contains(&reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocatable_int_registers() {
        let regs: Vec<u8> = IA64_REGISTER_FILE.allocatable_int.iter().collect();
        let expected: Vec<u8> = (8..=11).chain(14..=29).collect();
        assert_eq!(regs, expected);
    }

    #[test]
    fn test_allocatable_float_registers() {
        let regs: Vec<u8> = IA64_REGISTER_FILE.allocatable_float.iter().collect();
        let expected: Vec<u8> = (6..=15).chain(34..=63).collect();
        assert_eq!(regs, expected);
    }

    #[test]
    fn test_callee_saved_masks() {
        let rf = IA64_REGISTER_FILE;
        assert!((rf.allocatable_int & rf.callee_saved_int).is_empty());
        assert_eq!(rf.allocatable_int | rf.callee_saved_int, RegMask::ALL);
        assert_eq!(rf.callee_saved_float, RegMask::EMPTY);
        assert!(rf.callee_saved_int.contains(32));
        assert!(rf.callee_saved_int.contains(12));
    }

    #[test]
    fn test_return_registers() {
        let rf = IA64_REGISTER_FILE;
        assert_eq!(rf.return_reg(RegBank::Int), 8);
        assert_eq!(rf.return_reg(RegBank::Float), 8);
        assert!(!rf.callee_saved_int.contains(rf.int_return_reg));
        assert!(rf.allocatable_int.contains(rf.int_return_reg));
    }

    #[test]
    fn test_fixed_reg_by_tag() {
        assert_eq!(fixed_reg_for_tag('r'), 8);
        assert_eq!(fixed_reg_for_tag('g'), 8);
        assert_eq!(fixed_reg_for_tag('i'), NO_FIXED_REG);
        assert_eq!(fixed_reg_for_tag('f'), NO_FIXED_REG);
        assert_eq!(fixed_reg_for_tag('x'), NO_FIXED_REG);
    }

    #[test]
    fn test_float_tags() {
        assert!(is_float_tag('f'));
        assert!(is_float_tag('g'));
        assert!(!is_float_tag('r'));
        assert!(!is_float_tag('i'));
        for class in OperandClass::ALL {
            assert_eq!(is_float(class), is_float_tag(class.tag()));
            assert_eq!(OperandClass::from_tag(class.tag()), Some(class));
        }
    }

    #[test]
    fn test_no_register_pairs() {
        for class in OperandClass::ALL {
            assert!(!is_regpair(class));
            assert_eq!(regpair_reg2(class, 8), None);
            assert!(sreg2_mask(class).is_empty());
        }
    }

    #[test]
    fn test_mask_range() {
        assert_eq!(RegMask::range(8, 11).bits(), 0xf00);
        assert_eq!(RegMask::range(0, 127), RegMask::ALL);
        assert_eq!(RegMask::range(32, 127).count(), 96);
    }

    #[test]
    fn test_registers_cover_file() {
        assert_eq!(IA64_REGISTER_FILE.registers(RegBank::Int).count(), 128);
        assert_eq!(IA64_REGISTER_FILE.registers(RegBank::Float).count(), 128);
    }

    #[test]
    fn test_global_ireg_window() {
        let partition = WindowPartition {
            reg_in0: 32,
            reg_local0: 34,
            reg_out0: 40,
            n_out_regs: 2,
        };
        assert!(!is_global_ireg(33, &partition));
        assert!(is_global_ireg(34, &partition));
        assert!(is_global_ireg(39, &partition));
        assert!(!is_global_ireg(40, &partition));
        assert!(!is_global_ireg(200, &partition));
    }
}

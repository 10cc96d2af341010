//! Target ABI descriptions.
//!
//! Everything the allocator needs to know about a target lives behind
//! `TargetAbi`: which registers exist, the caller/callee-save split, the
//! static allocation order, argument and return registers, whether doubles
//! occupy float-register pairs, and whether an atomic register swap exists
//! for resolution.

use lsra_ir::{PhysReg, RegClass, ValueType};

use crate::regs::{RegMask, RegType};

/// Target description consumed by the allocator.
pub trait TargetAbi {
    fn name(&self) -> &'static str;

    /// Total number of register indices (integer and float combined).
    fn reg_count(&self) -> usize;

    /// All allocatable registers of a register type.
    fn all_regs(&self, rt: RegType) -> RegMask;

    /// Registers preserved across calls.
    fn callee_saved(&self) -> RegMask;

    /// Registers clobbered by calls.
    fn callee_trash(&self) -> RegMask {
        self.all_regs(RegType::Int)
            .union(self.all_regs(RegType::Float))
            .diff(self.callee_saved())
    }

    /// Static allocation order for a register type, best first.
    fn alloc_order(&self, rt: RegType) -> &'static [PhysReg];

    /// Register for argument `index` of the given class, if passed in one.
    fn arg_reg(&self, index: usize, class: RegClass) -> Option<PhysReg>;

    /// Register for double argument `index` on pair targets (must be the
    /// even half of a pair).
    fn double_arg_reg(&self, index: usize) -> Option<PhysReg> {
        self.arg_reg(index, RegClass::Float)
    }

    /// Return-value register for the given class.
    fn ret_reg(&self, class: RegClass) -> PhysReg;

    /// The class of a register index.
    fn reg_class_of(&self, reg: PhysReg) -> RegClass;

    /// Whether the target has an atomic integer register exchange.
    fn supports_atomic_swap(&self) -> bool;

    /// Whether 64-bit integers fit a single register.
    fn supports_long_regs(&self) -> bool {
        true
    }

    /// Whether doubles occupy an adjacent pair of float registers.
    fn has_double_pairs(&self) -> bool {
        false
    }

    /// The other half of a float-register pair.
    fn pair_of(&self, _reg: PhysReg) -> Option<PhysReg> {
        None
    }

    /// The register resource intervals of this value type occupy.
    fn reg_type_for(&self, ty: ValueType) -> RegType {
        match ty.reg_class() {
            RegClass::Int => RegType::Int,
            RegClass::Float => {
                if ty == ValueType::Double && self.has_double_pairs() {
                    RegType::Double
                } else {
                    RegType::Float
                }
            }
        }
    }

    /// Registers clobbered by a call node.
    fn kill_set_for_call(&self) -> RegMask {
        self.callee_trash()
    }
}

fn mask_of(regs: &[u8]) -> RegMask {
    let mut m = RegMask::EMPTY;
    for &r in regs {
        m = m.with(PhysReg(r));
    }
    m
}

fn mask_range(lo: u8, hi: u8) -> RegMask {
    let mut m = RegMask::EMPTY;
    for r in lo..=hi {
        m = m.with(PhysReg(r));
    }
    m
}

// ---------------------------------------------------------------------------
// x64
// ---------------------------------------------------------------------------

/// A 64-bit x86 target: 16 integer registers (rsp/rbp reserved), 16 float
/// registers, all floats caller-save, `xchg` available for resolution.
pub struct X64Target;

const X64_FLOAT_BASE: u8 = 16;

const X64_INT_ORDER: &[PhysReg] = &[
    PhysReg(0),  // rax
    PhysReg(1),  // rcx
    PhysReg(2),  // rdx
    PhysReg(6),  // rsi
    PhysReg(7),  // rdi
    PhysReg(8),
    PhysReg(9),
    PhysReg(10),
    PhysReg(11),
    PhysReg(3), // rbx
    PhysReg(12),
    PhysReg(13),
    PhysReg(14),
    PhysReg(15),
];

const X64_FLOAT_ORDER: &[PhysReg] = &[
    PhysReg(16),
    PhysReg(17),
    PhysReg(18),
    PhysReg(19),
    PhysReg(20),
    PhysReg(21),
    PhysReg(22),
    PhysReg(23),
    PhysReg(24),
    PhysReg(25),
    PhysReg(26),
    PhysReg(27),
    PhysReg(28),
    PhysReg(29),
    PhysReg(30),
    PhysReg(31),
];

impl TargetAbi for X64Target {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn reg_count(&self) -> usize {
        32
    }

    fn all_regs(&self, rt: RegType) -> RegMask {
        match rt {
            // rsp (4) and rbp (5) are never allocatable.
            RegType::Int => mask_range(0, 15)
                .without(PhysReg(4))
                .without(PhysReg(5)),
            RegType::Float | RegType::Double => mask_range(16, 31),
        }
    }

    fn callee_saved(&self) -> RegMask {
        mask_of(&[3, 12, 13, 14, 15])
    }

    fn alloc_order(&self, rt: RegType) -> &'static [PhysReg] {
        match rt {
            RegType::Int => X64_INT_ORDER,
            RegType::Float | RegType::Double => X64_FLOAT_ORDER,
        }
    }

    fn arg_reg(&self, index: usize, class: RegClass) -> Option<PhysReg> {
        match class {
            RegClass::Int => [7u8, 6, 2, 1, 8, 9].get(index).map(|&r| PhysReg(r)),
            RegClass::Float => {
                if index < 8 {
                    Some(PhysReg(X64_FLOAT_BASE + index as u8))
                } else {
                    None
                }
            }
        }
    }

    fn ret_reg(&self, class: RegClass) -> PhysReg {
        match class {
            RegClass::Int => PhysReg(0),
            RegClass::Float => PhysReg(X64_FLOAT_BASE),
        }
    }

    fn reg_class_of(&self, reg: PhysReg) -> RegClass {
        if reg.0 < X64_FLOAT_BASE {
            RegClass::Int
        } else {
            RegClass::Float
        }
    }

    fn supports_atomic_swap(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// 32-bit ARM
// ---------------------------------------------------------------------------

/// A 32-bit ARM target: r0-r12 allocatable, 32 single-precision float
/// registers where a double occupies an adjacent even/odd pair, no atomic
/// register exchange.
pub struct Arm32Target;

const ARM_FLOAT_BASE: u8 = 16;

const ARM_INT_ORDER: &[PhysReg] = &[
    PhysReg(0),
    PhysReg(1),
    PhysReg(2),
    PhysReg(3),
    PhysReg(12),
    PhysReg(4),
    PhysReg(5),
    PhysReg(6),
    PhysReg(7),
    PhysReg(8),
    PhysReg(9),
    PhysReg(10),
    PhysReg(11),
];

const ARM_FLOAT_ORDER: &[PhysReg] = &[
    PhysReg(16),
    PhysReg(17),
    PhysReg(18),
    PhysReg(19),
    PhysReg(20),
    PhysReg(21),
    PhysReg(22),
    PhysReg(23),
    PhysReg(24),
    PhysReg(25),
    PhysReg(26),
    PhysReg(27),
    PhysReg(28),
    PhysReg(29),
    PhysReg(30),
    PhysReg(31),
    PhysReg(32),
    PhysReg(33),
    PhysReg(34),
    PhysReg(35),
    PhysReg(36),
    PhysReg(37),
    PhysReg(38),
    PhysReg(39),
    PhysReg(40),
    PhysReg(41),
    PhysReg(42),
    PhysReg(43),
    PhysReg(44),
    PhysReg(45),
    PhysReg(46),
    PhysReg(47),
];

// Even (low) halves of the double pairs, in allocation order.
const ARM_DOUBLE_ORDER: &[PhysReg] = &[
    PhysReg(16),
    PhysReg(18),
    PhysReg(20),
    PhysReg(22),
    PhysReg(24),
    PhysReg(26),
    PhysReg(28),
    PhysReg(30),
    PhysReg(32),
    PhysReg(34),
    PhysReg(36),
    PhysReg(38),
    PhysReg(40),
    PhysReg(42),
    PhysReg(44),
    PhysReg(46),
];

impl TargetAbi for Arm32Target {
    fn name(&self) -> &'static str {
        "arm32"
    }

    fn reg_count(&self) -> usize {
        48
    }

    fn all_regs(&self, rt: RegType) -> RegMask {
        match rt {
            RegType::Int => mask_range(0, 12),
            RegType::Float => mask_range(ARM_FLOAT_BASE, 47),
            RegType::Double => {
                let mut m = RegMask::EMPTY;
                for &r in ARM_DOUBLE_ORDER {
                    m = m.with(r);
                }
                m
            }
        }
    }

    fn callee_saved(&self) -> RegMask {
        // r4-r11, s16-s31.
        mask_range(4, 11).union(mask_range(32, 47))
    }

    fn alloc_order(&self, rt: RegType) -> &'static [PhysReg] {
        match rt {
            RegType::Int => ARM_INT_ORDER,
            RegType::Float => ARM_FLOAT_ORDER,
            RegType::Double => ARM_DOUBLE_ORDER,
        }
    }

    fn arg_reg(&self, index: usize, class: RegClass) -> Option<PhysReg> {
        match class {
            RegClass::Int => {
                if index < 4 {
                    Some(PhysReg(index as u8))
                } else {
                    None
                }
            }
            RegClass::Float => {
                if index < 8 {
                    Some(PhysReg(ARM_FLOAT_BASE + index as u8))
                } else {
                    None
                }
            }
        }
    }

    fn double_arg_reg(&self, index: usize) -> Option<PhysReg> {
        ARM_DOUBLE_ORDER.get(index).copied().filter(|r| r.0 <= 30)
    }

    fn ret_reg(&self, class: RegClass) -> PhysReg {
        match class {
            RegClass::Int => PhysReg(0),
            RegClass::Float => PhysReg(ARM_FLOAT_BASE),
        }
    }

    fn reg_class_of(&self, reg: PhysReg) -> RegClass {
        if reg.0 < ARM_FLOAT_BASE {
            RegClass::Int
        } else {
            RegClass::Float
        }
    }

    fn supports_atomic_swap(&self) -> bool {
        false
    }

    fn supports_long_regs(&self) -> bool {
        false
    }

    fn has_double_pairs(&self) -> bool {
        true
    }

    fn pair_of(&self, reg: PhysReg) -> Option<PhysReg> {
        if reg.0 < ARM_FLOAT_BASE {
            None
        } else if (reg.0 - ARM_FLOAT_BASE) % 2 == 0 {
            Some(PhysReg(reg.0 + 1))
        } else {
            Some(PhysReg(reg.0 - 1))
        }
    }
}

//! Intervals: the lifetime of one value.

use bitflags::bitflags;
use lsra_ir::{LclId, PhysReg, ValueType};

use crate::{
    refpos::RefPosId,
    regs::{RegMask, RegType},
};

/// Index of an interval in the allocator's interval arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntervalId(pub u32);

impl IntervalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What kind of value an interval represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalKind {
    /// A source local variable.
    LocalVar { lcl: LclId, var_index: u32 },
    /// An anonymous IR temporary (the value flowing between two nodes).
    TreeTemp,
    /// A scratch requirement internal to one instruction.
    Internal,
    /// The upper half of a wide vector split around a call.
    UpperVector { of: IntervalId },
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct IntervalFlags: u16 {
        /// Currently live at the sweep location.
        const ACTIVE = 1 << 0;
        /// Has been spilled at least once; never reset.
        const SPILLED = 1 << 1;
        /// Lives in different registers over its lifetime.
        const SPLIT = 1 << 2;
        /// Every def also stores to the stack home (EH-live vars).
        const WRITE_THRU = 1 << 3;
        /// The value is a materialized constant.
        const CONSTANT = 1 << 4;
        /// Field of a promoted struct.
        const STRUCT_FIELD = 1 << 5;
        /// A `PutArgReg` whose source already sits in the target register.
        const SPECIAL_PUT_ARG = 1 << 6;
        /// Upper-vector interval.
        const UPPER_VECTOR = 1 << 7;
        /// The wide local's upper half is currently saved elsewhere.
        const PARTIALLY_SPILLED = 1 << 8;
        /// Lifetime crosses a call; prefer a callee-saved register.
        const PREFER_CALLEE_SAVE = 1 << 9;
    }
}

/// A constant value held by a constant interval, for register reuse.
///
/// Two constants match when their bit patterns are equal and, for integers,
/// their GC-ness agrees; 64-bit negative integer constants additionally
/// require the exact same type (a sign-extended 32-bit immediate is not the
/// same register contents as a 64-bit constant).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstVal {
    pub bits: u64,
    pub ty: ValueType,
}

impl ConstVal {
    pub fn matches(&self, other: &ConstVal) -> bool {
        if self.bits != other.bits {
            return false;
        }
        match (self.ty.reg_class(), other.ty.reg_class()) {
            (lsra_ir::RegClass::Float, lsra_ir::RegClass::Float) => self.ty == other.ty,
            (lsra_ir::RegClass::Int, lsra_ir::RegClass::Int) => {
                if self.ty.is_gc() != other.ty.is_gc() {
                    return false;
                }
                if (self.bits as i64) < 0 {
                    self.ty == other.ty
                } else {
                    true
                }
            }
            _ => false,
        }
    }
}

/// The lifetime of one value and its current allocation state.
#[derive(Clone, Debug)]
pub struct Interval {
    pub kind: IntervalKind,
    pub reg_type: RegType,
    /// Value type, kept for GC-ness queries at kill positions.
    pub ty: ValueType,
    pub flags: IntervalFlags,

    pub first_ref: Option<RefPosId>,
    pub last_ref: Option<RefPosId>,
    /// Last RefPosition at or before the sweep's current location.
    pub recent_ref: Option<RefPosId>,

    /// Register currently holding the value, when assigned.
    pub phys_reg: Option<PhysReg>,
    /// The register record that last considered this interval its occupant.
    pub assigned_reg: Option<PhysReg>,
    /// Register this interval most recently vacated.
    pub prev_reg: Option<PhysReg>,

    pub preferences: RegMask,
    /// Weak link to a closely-coupled interval, used only for preferencing.
    pub related: Option<IntervalId>,

    pub const_val: Option<ConstVal>,

    /// First register this interval was given; used for the end-of-pass
    /// single-register summary.
    pub home_reg: Option<PhysReg>,
}

impl Interval {
    pub fn new(kind: IntervalKind, reg_type: RegType, ty: ValueType) -> Self {
        Self {
            kind,
            reg_type,
            ty,
            flags: IntervalFlags::empty(),
            first_ref: None,
            last_ref: None,
            recent_ref: None,
            phys_reg: None,
            assigned_reg: None,
            prev_reg: None,
            preferences: RegMask::EMPTY,
            related: None,
            const_val: None,
            home_reg: None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, IntervalKind::LocalVar { .. })
    }

    pub fn local(&self) -> Option<LclId> {
        match self.kind {
            IntervalKind::LocalVar { lcl, .. } => Some(lcl),
            _ => None,
        }
    }

    pub fn var_index(&self) -> Option<u32> {
        match self.kind {
            IntervalKind::LocalVar { var_index, .. } => Some(var_index),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(IntervalFlags::ACTIVE)
    }

    pub fn is_spilled(&self) -> bool {
        self.flags.contains(IntervalFlags::SPILLED)
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(IntervalFlags::CONSTANT)
    }

    pub fn is_write_thru(&self) -> bool {
        self.flags.contains(IntervalFlags::WRITE_THRU)
    }

    pub fn set_active(&mut self, active: bool) {
        self.flags.set(IntervalFlags::ACTIVE, active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_matching() {
        let a = ConstVal {
            bits: 5,
            ty: ValueType::Int,
        };
        let b = ConstVal {
            bits: 5,
            ty: ValueType::Long,
        };
        // Positive integer constants match across int widths.
        assert!(a.matches(&b));

        let neg_int = ConstVal {
            bits: -1i64 as u64,
            ty: ValueType::Int,
        };
        let neg_long = ConstVal {
            bits: -1i64 as u64,
            ty: ValueType::Long,
        };
        // Negative constants require the exact type.
        assert!(!neg_int.matches(&neg_long));
        assert!(neg_int.matches(&neg_int));

        let gc = ConstVal {
            bits: 0,
            ty: ValueType::Ref,
        };
        let raw = ConstVal {
            bits: 0,
            ty: ValueType::Int,
        };
        // GC-ness must agree.
        assert!(!gc.matches(&raw));

        let f = ConstVal {
            bits: 1.5f64.to_bits(),
            ty: ValueType::Double,
        };
        let f2 = ConstVal {
            bits: 1.5f64.to_bits(),
            ty: ValueType::Double,
        };
        assert!(f.matches(&f2));
        // Float vs int never match.
        assert!(!f.matches(&ConstVal {
            bits: 1.5f64.to_bits(),
            ty: ValueType::Long,
        }));
    }

    #[test]
    fn test_spilled_flag_is_sticky() {
        let mut ivl = Interval::new(IntervalKind::TreeTemp, RegType::Int, ValueType::Int);
        assert!(!ivl.is_spilled());
        ivl.flags |= IntervalFlags::SPILLED;
        assert!(ivl.is_spilled());
    }
}

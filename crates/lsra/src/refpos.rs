//! RefPositions: one register-relevant event at one location.

use bitflags::bitflags;
use lsra_ir::{BlockId, NodeId, PhysReg};

use crate::{interval::IntervalId, location::Location, regs::RegMask};

/// Index of a RefPosition in the allocator's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefPosId(pub u32);

impl RefPosId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What kind of event a RefPosition records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefType {
    /// Read of an interval's value.
    Use,
    /// Write of an interval's value.
    Def,
    /// A physical register is pinned briefly by an instruction.
    FixedReg,
    /// A physical register is clobbered (calls).
    Kill,
    /// Every register holding a GC reference is clobbered.
    KillGcRefs,
    /// Block boundary marker.
    BB,
    /// A value is exposed (live out) without an explicit use.
    ExpUse,
    /// Artificial def for a value live-in without a reaching def.
    DummyDef,
    /// Parameter arriving at procedure entry.
    ParamDef,
    /// Local that must be zero-initialized at entry.
    ZeroInit,
    /// Save of a wide vector's upper half around a call.
    UpperVectorSave,
    /// Restore of a wide vector's upper half.
    UpperVectorRestore,
}

impl RefType {
    /// Use-like events that read the interval's current location.
    pub fn is_use(self) -> bool {
        matches!(self, RefType::Use | RefType::ExpUse)
    }

    /// Def-like events that establish a new value.
    pub fn is_def(self) -> bool {
        matches!(
            self,
            RefType::Def | RefType::DummyDef | RefType::ParamDef | RefType::ZeroInit
        )
    }
}

/// What a RefPosition refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Referent {
    Interval(IntervalId),
    Reg(PhysReg),
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RefFlags: u16 {
        /// Final use of the interval (or of this lifetime segment).
        const LAST_USE = 1 << 0;
        /// The value must be loaded from the stack before this ref.
        const RELOAD = 1 << 1;
        /// The value must be stored to the stack after this ref.
        const SPILL_AFTER = 1 << 2;
        /// This ref uses a temporary register; the home is unchanged.
        const COPY_REG = 1 << 3;
        /// This ref permanently moves the interval to a new register.
        const MOVE_REG = 1 << 4;
        /// RMW source: stays live one location past this ref.
        const DELAY_REG_FREE = 1 << 5;
        /// Def that also stores to the stack home.
        const WRITE_THRU = 1 << 6;
        /// `register_assignment` is a required singleton.
        const FIXED_REG_REF = 1 << 7;
        /// The ref may be satisfied from memory instead of a register.
        const REG_OPTIONAL = 1 << 8;
        /// Adjacent RefPositions disagree on register; a move may be needed.
        const OUT_OF_ORDER = 1 << 9;
        /// Def whose only use is immediately at the same node.
        const LOCAL_DEF_USE = 1 << 10;
        /// Constant def satisfied by a register already holding the value.
        const REUSED_CONSTANT = 1 << 11;
    }
}

/// One event that one interval (or one physical register) requires at one
/// location.
#[derive(Clone, Debug)]
pub struct RefPosition {
    pub ref_type: RefType,
    pub location: Location,
    pub block: BlockId,
    pub referent: Option<Referent>,
    /// Acceptable registers; narrowed to a singleton when the allocator
    /// commits, emptied when the ref is satisfied from memory.
    pub register_assignment: RegMask,
    pub node: Option<NodeId>,
    pub multi_reg_idx: u8,
    pub flags: RefFlags,
    /// Next RefPosition of the same interval, or next fixed reference of the
    /// same register.
    pub next: Option<RefPosId>,
}

impl RefPosition {
    pub fn new(ref_type: RefType, location: Location, block: BlockId) -> Self {
        Self {
            ref_type,
            location,
            block,
            referent: None,
            register_assignment: RegMask::EMPTY,
            node: None,
            multi_reg_idx: 0,
            flags: RefFlags::empty(),
            next: None,
        }
    }

    pub fn interval(&self) -> Option<IntervalId> {
        match self.referent {
            Some(Referent::Interval(id)) => Some(id),
            _ => None,
        }
    }

    pub fn reg(&self) -> Option<PhysReg> {
        match self.referent {
            Some(Referent::Reg(r)) => Some(r),
            _ => None,
        }
    }

    /// The committed register, once `register_assignment` is a singleton.
    pub fn assigned_reg(&self) -> Option<PhysReg> {
        self.register_assignment.single_reg()
    }

    pub fn is_last_use(&self) -> bool {
        self.flags.contains(RefFlags::LAST_USE)
    }

    pub fn is_fixed(&self) -> bool {
        self.flags.contains(RefFlags::FIXED_REG_REF)
    }

    pub fn is_reg_optional(&self) -> bool {
        self.flags.contains(RefFlags::REG_OPTIONAL)
    }

    pub fn spill_after(&self) -> bool {
        self.flags.contains(RefFlags::SPILL_AFTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_type_classes() {
        assert!(RefType::Use.is_use());
        assert!(RefType::ExpUse.is_use());
        assert!(!RefType::Use.is_def());
        assert!(RefType::Def.is_def());
        assert!(RefType::ParamDef.is_def());
        assert!(RefType::ZeroInit.is_def());
        assert!(!RefType::BB.is_use());
        assert!(!RefType::Kill.is_def());
    }

    #[test]
    fn test_assigned_reg_requires_singleton() {
        let mut rp = RefPosition::new(RefType::Use, Location(4), BlockId(0));
        rp.register_assignment = RegMask(0b110);
        assert_eq!(rp.assigned_reg(), None);
        rp.register_assignment = RegMask(0b100);
        assert_eq!(rp.assigned_reg(), Some(PhysReg(2)));
        rp.register_assignment = RegMask::EMPTY;
        assert_eq!(rp.assigned_reg(), None);
    }
}

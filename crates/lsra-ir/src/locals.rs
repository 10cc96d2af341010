//! The local-variable table.
//!
//! The allocator reads the descriptive fields and writes the allocation
//! results (`reg_num`, `lv_register`, `on_frame`, `arg_init_reg`).

use alloc::string::String;

use crate::types::{PhysReg, ValueType};

/// Index of a local variable in a procedure's locals table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LclId(pub u32);

impl LclId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry of the local-variable table.
#[derive(Clone, Debug)]
pub struct LclVar {
    pub name: String,
    pub ty: ValueType,

    /// Raw appearance count.
    pub ref_cnt: u32,
    /// Block-weight-scaled appearance count.
    pub ref_cnt_wtd: f64,

    /// Participates in liveness; `var_index` is valid only when set.
    pub tracked: bool,
    /// Dense index into tracked-variable bitsets.
    pub var_index: u32,

    pub is_param: bool,
    /// Parameter passed in a register (vs. on the stack).
    pub is_reg_arg: bool,
    /// The register a register parameter arrives in.
    pub arg_reg: Option<PhysReg>,

    pub addr_exposed: bool,
    pub pinned: bool,
    /// Live into or out of an exception handler.
    pub live_in_out_of_handler: bool,
    /// Field of a promoted struct: the parent local.
    pub promoted_field_of: Option<LclId>,
    /// Permanently barred from a register.
    pub do_not_enregister: bool,

    // Allocation results.
    /// Home register when the variable lives in one register for its whole
    /// lifetime; `None` means the stack home is authoritative.
    pub reg_num: Option<PhysReg>,
    /// Second register of a multi-reg local. Written for the benefit of code
    /// generation only; the allocator never reads it back.
    pub other_reg: Option<PhysReg>,
    /// True when `reg_num` is valid for the entire lifetime.
    pub lv_register: bool,
    /// The variable has a stack home (always true once spilled).
    pub on_frame: bool,
    /// Register a parameter should be moved to at procedure entry.
    pub arg_init_reg: Option<PhysReg>,
}

impl LclVar {
    pub fn new(name: String, ty: ValueType) -> Self {
        Self {
            name,
            ty,
            ref_cnt: 0,
            ref_cnt_wtd: 0.0,
            tracked: false,
            var_index: 0,
            is_param: false,
            is_reg_arg: false,
            arg_reg: None,
            addr_exposed: false,
            pinned: false,
            live_in_out_of_handler: false,
            promoted_field_of: None,
            do_not_enregister: false,
            reg_num: None,
            other_reg: None,
            lv_register: false,
            on_frame: false,
            arg_init_reg: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_new_local_defaults() {
        let lcl = LclVar::new("a".to_string(), ValueType::Int);
        assert_eq!(lcl.ref_cnt, 0);
        assert!(!lcl.tracked);
        assert!(!lcl.lv_register);
        assert!(lcl.reg_num.is_none());
    }
}

//! Instruction set architectures.
//!
//! The encoder sits behind the [`TargetIsa`] trait: the rest of the crate
//! speaks IR plus allocations, and a concrete ISA turns that into bytes.
//! Only x86-64 ships today, but the seam keeps the IR portable.

use crate::binemit::Module;
use crate::ir::Function;
use crate::regalloc::Allocations;
use crate::result::{CodegenError, CodegenResult};
use target_lexicon::{Architecture, Triple};

pub mod x86_64;

/// A physical register number. The integer bank occupies units 0–15 and the
/// XMM bank units 16–31.
pub type RegUnit = u8;

/// Registers an ISA makes available to the allocator.
pub struct RegPools {
    /// Integer registers in allocation preference order.
    pub gpr: &'static [RegUnit],
    /// The subset of `gpr` preserved across calls.
    pub gpr_callee_saved: &'static [RegUnit],
    /// Floating-point registers in allocation preference order.
    pub fpr: &'static [RegUnit],
}

/// Methods that encode IR into machine code for one target.
pub trait TargetIsa {
    /// Short name of this ISA.
    fn name(&self) -> &'static str;

    /// The triple this ISA was built for.
    fn triple(&self) -> &Triple;

    /// Registers available to the allocator.
    fn pools(&self) -> &'static RegPools;

    /// Emit machine code for `func` into `module`, consulting `allocs` for
    /// the location of every virtual register.
    fn emit_function(
        &self,
        func: &Function,
        allocs: &Allocations,
        module: &mut Module,
    ) -> CodegenResult<()>;
}

/// Look up the ISA implementation for `triple`.
pub fn lookup(triple: Triple) -> CodegenResult<Box<dyn TargetIsa>> {
    match triple.architecture {
        Architecture::X86_64 => Ok(Box::new(x86_64::Isa::new(triple))),
        _ => Err(CodegenError::Unsupported(triple.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lookup_x86_64() {
        let isa = lookup(Triple::from_str("x86_64-unknown-linux-gnu").unwrap()).unwrap();
        assert_eq!(isa.name(), "x86_64");
    }

    #[test]
    fn lookup_rejects_other_architectures() {
        let err = lookup(Triple::from_str("aarch64-unknown-linux-gnu").unwrap());
        assert!(matches!(err, Err(CodegenError::Unsupported(_))));
    }
}

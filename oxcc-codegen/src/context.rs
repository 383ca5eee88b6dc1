//! Per-translation-unit compilation context.
//!
//! The `Context` owns all module-level emission state — the code buffer,
//! the label table, the staged data segments — and drives the back-end
//! passes for one function at a time. There is exactly one `Context` per
//! translation unit and it is never shared; ordering of emitted code, data
//! and relocation records is the order of the calls made on it.

use crate::binemit::{Image, Label, Module};
use crate::ir::Function;
use crate::isa::TargetIsa;
use crate::regalloc;
use crate::result::CodegenResult;
use log::debug;

/// The driver object for one translation unit.
pub struct Context {
    /// Module-level emission state.
    pub module: Module,
    isa: Box<dyn TargetIsa>,
}

impl Context {
    /// Create a context emitting code for `isa`, linked at `start_address`.
    pub fn new(isa: Box<dyn TargetIsa>, start_address: u64) -> Self {
        Self { module: Module::new(start_address), isa }
    }

    /// The ISA this context compiles for.
    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    /// Intern a label name in the module's table.
    pub fn label(&mut self, name: &str) -> Label {
        self.module.labels.intern(name)
    }

    /// Allocate a fresh local label.
    pub fn alloc_label(&mut self) -> Label {
        self.module.labels.alloc_local()
    }

    /// Allocate registers for `func` and emit its machine code.
    pub fn compile_function(&mut self, func: &Function) -> CodegenResult<()> {
        debug!("compiling {} ({} insts)", func.name, func.inst_count());
        let allocs = regalloc::run(func, self.isa.pools());
        self.isa.emit_function(func, &allocs, &mut self.module)
    }

    /// Intern a read-only blob (string literals, float constants) and
    /// return its label.
    pub fn define_rodata(&mut self, bytes: Vec<u8>, align: u32) -> Label {
        let label = self.module.labels.alloc_local();
        self.module.add_rodata(label, bytes, align);
        label
    }

    /// Define an initialized global. `ptr_relocs` lists offsets of embedded
    /// pointers to other labels.
    pub fn define_data(
        &mut self,
        label: Label,
        global: bool,
        bytes: Vec<u8>,
        align: u32,
        ptr_relocs: Vec<(u32, Label)>,
    ) {
        self.module.declare_symbol(label, global);
        self.module.add_data(label, bytes, align, ptr_relocs);
    }

    /// Define a zero-initialized global.
    pub fn define_bss(&mut self, label: Label, global: bool, size: u32, align: u32) {
        self.module.declare_symbol(label, global);
        self.module.add_bss(label, size, align);
    }

    /// Seal the unit: lay out data segments, patch all recorded locations
    /// and return the image.
    pub fn finish(self) -> CodegenResult<Image> {
        self.module.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, VRegType};
    use crate::isa;
    use std::str::FromStr;
    use target_lexicon::Triple;

    #[test]
    fn compile_trivial_unit() {
        let isa =
            isa::lookup(Triple::from_str("x86_64-unknown-linux-gnu").unwrap()).unwrap();
        let mut ctx = Context::new(isa, 0x8000);
        let mut func = Function::new(
            "main",
            true,
            Signature { params: Vec::new(), ret: Some(VRegType::I32), vaargs: false },
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let k = b.iconst(0, VRegType::I32);
            b.result(k);
        }
        ctx.compile_function(&func).unwrap();
        let image = ctx.finish().unwrap();
        assert_eq!(image.symbols.len(), 1);
        assert_eq!(image.symbols[0].name, "main");
        assert_eq!(image.symbols[0].address, 0x8000);
        assert!(image.info.file_size() > 0);
    }
}

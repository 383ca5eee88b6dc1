//! x86-64 back end: register descriptions, the System V argument order and
//! the instruction emitter.
//!
//! The emitter walks blocks in layout order. Scratch registers (`rax`,
//! `rcx`, `rdx`, `rsi`, `rdi`, `xmm0`, `xmm1`, `r11` at calls) are never
//! handed to the allocator, so every instruction can load spilled operands
//! and materialize constants without disturbing live values.
//!
//! Invariant kept throughout: an integer value held in a physical register
//! is valid to at least 32 bits (64 for 8-byte values). Loads extend,
//! narrowing casts re-normalize, and arithmetic below 4 bytes is performed
//! at 32 bits, which matches C's integer promotions.

use crate::binemit::{Label, Module};
use crate::ir::{BinOp, CallTarget, Cond, Function, InstData, UnOp, VReg, VRegType};
use crate::isa::{RegPools, RegUnit, TargetIsa};
use crate::regalloc::{Allocation, Allocations};
use crate::result::CodegenResult;
use cranelift_entity::EntityRef;
use smallvec::SmallVec;
use target_lexicon::Triple;

mod encode;

use self::encode::{fits_i32, Alu};

/// `rax`.
pub const RAX: RegUnit = 0;
/// `rcx`.
pub const RCX: RegUnit = 1;
/// `rdx`.
pub const RDX: RegUnit = 2;
/// `rbx`.
pub const RBX: RegUnit = 3;
/// `rsp`.
pub const RSP: RegUnit = 4;
/// `rbp`.
pub const RBP: RegUnit = 5;
/// `rsi`.
pub const RSI: RegUnit = 6;
/// `rdi`.
pub const RDI: RegUnit = 7;
/// `r8`.
pub const R8: RegUnit = 8;
/// `r9`.
pub const R9: RegUnit = 9;
/// `r10`.
pub const R10: RegUnit = 10;
/// `r11`.
pub const R11: RegUnit = 11;
/// `r12`.
pub const R12: RegUnit = 12;
/// `r13`.
pub const R13: RegUnit = 13;
/// `r14`.
pub const R14: RegUnit = 14;
/// `r15`.
pub const R15: RegUnit = 15;
/// `xmm0`; the XMM bank occupies units 16–31.
pub const XMM0: RegUnit = 16;

/// Integer argument registers in the System V AMD64 order.
pub static ARG_GPRS: [RegUnit; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Floating-point argument registers (`xmm0`–`xmm7`).
pub static ARG_FPRS: [RegUnit; 8] = [
    XMM0,
    XMM0 + 1,
    XMM0 + 2,
    XMM0 + 3,
    XMM0 + 4,
    XMM0 + 5,
    XMM0 + 6,
    XMM0 + 7,
];

static GPR_POOL: [RegUnit; 6] = [R10, RBX, R12, R13, R14, R15];
static GPR_CALLEE_SAVED: [RegUnit; 5] = [RBX, R12, R13, R14, R15];
static FPR_POOL: [RegUnit; 8] = [
    XMM0 + 8,
    XMM0 + 9,
    XMM0 + 10,
    XMM0 + 11,
    XMM0 + 12,
    XMM0 + 13,
    XMM0 + 14,
    XMM0 + 15,
];

static POOLS: RegPools = RegPools {
    gpr: &GPR_POOL,
    gpr_callee_saved: &GPR_CALLEE_SAVED,
    fpr: &FPR_POOL,
};

/// The registers this back end lets the allocator hand out.
pub fn reg_pools() -> &'static RegPools {
    &POOLS
}

fn ccval(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xc,
        Cond::Le => 0xe,
        Cond::Ge => 0xd,
        Cond::Gt => 0xf,
        Cond::Ult => 0x2,
        Cond::Ule => 0x6,
        Cond::Uge => 0x3,
        Cond::Ugt => 0x7,
        Cond::Any => unreachable!("unconditional jump has no condition code"),
    }
}

/// The x86-64 implementation of [`TargetIsa`].
pub struct Isa {
    triple: Triple,
}

impl Isa {
    /// Create the x86-64 ISA for `triple`.
    pub fn new(triple: Triple) -> Self {
        Self { triple }
    }
}

impl TargetIsa for Isa {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn pools(&self) -> &'static RegPools {
        &POOLS
    }

    fn emit_function(
        &self,
        func: &Function,
        allocs: &Allocations,
        module: &mut Module,
    ) -> CodegenResult<()> {
        Emitter { func, allocs, module, stack_depth: 0, frames: SmallVec::new() }.run()
    }
}

/// Alignment bookkeeping for one open call sequence.
struct CallFrame {
    pad: u32,
    stack_bytes: u32,
}

struct Emitter<'a> {
    func: &'a Function,
    allocs: &'a Allocations,
    module: &'a mut Module,
    /// Bytes currently on the stack below the 16-byte aligned frame bottom;
    /// drives call-site alignment padding.
    stack_depth: i32,
    frames: SmallVec<[CallFrame; 4]>,
}

impl<'a> Emitter<'a> {
    fn run(mut self) -> CodegenResult<()> {
        let entry = self.module.labels.intern(&self.func.name);
        self.module.bind_here(entry);
        self.module.declare_symbol(entry, self.func.global);

        let block_labels: Vec<Label> =
            (0..self.func.blocks.len()).map(|_| self.module.labels.alloc_local()).collect();

        self.prologue();

        for (i, &bb) in self.func.layout.iter().enumerate() {
            self.module.bind_here(block_labels[bb.index()]);
            let next = self.func.layout.get(i + 1).cloned();
            for inst in &self.func.blocks[bb].insts {
                self.inst(inst, &block_labels, next)?;
            }
        }

        self.epilogue();
        Ok(())
    }

    fn prologue(&mut self) {
        let buf = &mut self.module.code;
        encode::push(buf, RBP);
        encode::mov_rr(buf, 8, RBP, RSP);
        if self.allocs.frame_size > 0 {
            encode::alu_ri(buf, Alu::Sub, 8, RSP, self.allocs.frame_size as i32);
        }
        for &(unit, off) in &self.allocs.save_slots {
            encode::mov_store(buf, 8, unit, RBP, off);
        }

        // Move incoming register arguments to their allocated homes.
        let mut gpr = 0usize;
        let mut fpr = 0usize;
        for (i, &param) in self.func.params.iter().enumerate() {
            let vt = self.func.signature.params[i];
            if vt.flonum {
                if fpr >= ARG_FPRS.len() {
                    continue;
                }
                let arg = ARG_FPRS[fpr] - XMM0;
                fpr += 1;
                match self.allocs.locs[param] {
                    Allocation::Reg(u) => {
                        if u - XMM0 != arg {
                            encode::sse_rr(
                                &mut self.module.code,
                                if vt.size == 8 { 0xf2 } else { 0xf3 },
                                0x10,
                                u - XMM0,
                                arg,
                            );
                        }
                    }
                    Allocation::Stack(off) if off < 0 => {
                        encode::sse_store(&mut self.module.code, vt.size == 8, arg, RBP, off);
                    }
                    _ => {}
                }
            } else if vt.size <= 8 {
                if gpr >= ARG_GPRS.len() {
                    continue;
                }
                let arg = ARG_GPRS[gpr];
                gpr += 1;
                match self.allocs.locs[param] {
                    Allocation::Reg(u) => {
                        if u != arg {
                            encode::mov_rr(&mut self.module.code, 8, u, arg);
                        }
                    }
                    Allocation::Stack(off) if off < 0 => {
                        encode::mov_store(&mut self.module.code, vt.size, arg, RBP, off);
                    }
                    _ => {}
                }
            }
            // Stack-passed parameters are bound to their incoming slots.
        }
    }

    fn epilogue(&mut self) {
        let saves: SmallVec<[(RegUnit, i32); 8]> =
            self.allocs.save_slots.iter().cloned().collect();
        let buf = &mut self.module.code;
        for &(unit, off) in &saves {
            encode::mov_load(buf, 8, unit, RBP, off);
        }
        encode::mov_rr(buf, 8, RSP, RBP);
        encode::pop(buf, RBP);
        encode::ret(buf);
    }

    fn loc(&self, v: VReg) -> Allocation {
        self.allocs.locs[v]
    }

    fn vt(&self, v: VReg) -> VRegType {
        self.func.vregs[v].vtype
    }

    /// Bring an integer value into some register, using `scratch` when it is
    /// not already in one. The returned register must not be modified.
    fn read_int(&mut self, v: VReg, scratch: RegUnit) -> RegUnit {
        let vt = self.vt(v);
        let buf = &mut self.module.code;
        match self.allocs.locs[v] {
            Allocation::Reg(u) => u,
            Allocation::Imm(k) => {
                encode::mov_ri(buf, if vt.size == 8 { 8 } else { 4 }, scratch, k);
                scratch
            }
            Allocation::Stack(off) => {
                encode::load_extend(buf, vt.size, vt.unsigned, vt.size == 8, scratch, RBP, off);
                scratch
            }
            Allocation::None => {
                debug_assert!(false, "read of unallocated {}", v);
                scratch
            }
        }
    }

    /// Bring a float value into some XMM register (bank-local number).
    fn read_xmm(&mut self, v: VReg, scratch: u8) -> u8 {
        let vt = self.vt(v);
        match self.allocs.locs[v] {
            Allocation::Reg(u) => u - XMM0,
            Allocation::Stack(off) => {
                encode::sse_load(&mut self.module.code, vt.size == 8, scratch, RBP, off);
                scratch
            }
            _ => {
                debug_assert!(false, "float {} has no register or slot", v);
                scratch
            }
        }
    }

    /// The register an integer result should be computed into.
    fn int_out(&self, v: VReg) -> RegUnit {
        match self.loc(v) {
            Allocation::Reg(u) => u,
            _ => RAX,
        }
    }

    fn xmm_out(&self, v: VReg) -> u8 {
        match self.loc(v) {
            Allocation::Reg(u) => u - XMM0,
            _ => 0,
        }
    }

    /// Flush a computed integer value to `v`'s home.
    fn write_int(&mut self, v: VReg, src: RegUnit) {
        let vt = self.vt(v);
        let buf = &mut self.module.code;
        match self.allocs.locs[v] {
            Allocation::Reg(u) => {
                if u != src {
                    encode::mov_rr(buf, 8, u, src);
                }
            }
            Allocation::Stack(off) => encode::mov_store(buf, vt.size, src, RBP, off),
            loc => debug_assert!(false, "write of {} to {:?}", v, loc),
        }
    }

    fn write_xmm(&mut self, v: VReg, src: u8) {
        let vt = self.vt(v);
        match self.allocs.locs[v] {
            Allocation::Reg(u) => {
                if u - XMM0 != src {
                    let p = if vt.size == 8 { 0xf2 } else { 0xf3 };
                    encode::sse_rr(&mut self.module.code, p, 0x10, u - XMM0, src);
                }
            }
            Allocation::Stack(off) => {
                encode::sse_store(&mut self.module.code, vt.size == 8, src, RBP, off)
            }
            loc => debug_assert!(false, "write of {} to {:?}", v, loc),
        }
    }

    fn inst(
        &mut self,
        inst: &InstData,
        block_labels: &[Label],
        next: Option<crate::ir::Block>,
    ) -> CodegenResult<()> {
        match *inst {
            InstData::Bofs { dst, base } => {
                let off = match self.loc(base) {
                    Allocation::Stack(off) => off,
                    loc => {
                        debug_assert!(false, "address taken of non-frame {:?}", loc);
                        0
                    }
                };
                let out = self.int_out(dst);
                encode::lea(&mut self.module.code, out, RBP, off);
                self.write_int(dst, out);
            }
            InstData::Iofs { dst, label } => {
                let out = self.int_out(dst);
                encode::lea_rip(&mut self.module.code, out);
                self.module.use_rel32(label);
                self.write_int(dst, out);
            }
            InstData::Sofs { dst, offset } => {
                let out = self.int_out(dst);
                encode::lea(&mut self.module.code, out, RSP, offset);
                self.write_int(dst, out);
            }
            InstData::Load { dst, addr } => {
                let a = self.read_int(addr, RAX);
                let vt = self.vt(dst);
                if vt.flonum {
                    let x = self.xmm_out(dst);
                    encode::sse_load(&mut self.module.code, vt.size == 8, x, a, 0);
                    self.write_xmm(dst, x);
                } else {
                    let out = self.int_out(dst);
                    encode::load_extend(
                        &mut self.module.code,
                        vt.size,
                        vt.unsigned,
                        vt.size == 8,
                        out,
                        a,
                        0,
                    );
                    self.write_int(dst, out);
                }
            }
            InstData::Store { addr, src } => {
                let a = self.read_int(addr, RAX);
                let vt = self.vt(src);
                if vt.flonum {
                    let x = self.read_xmm(src, 0);
                    encode::sse_store(&mut self.module.code, vt.size == 8, x, a, 0);
                } else {
                    let s = self.read_int(src, RCX);
                    encode::mov_store(&mut self.module.code, vt.size, s, a, 0);
                }
            }
            InstData::Memcpy { dst, src, size } => {
                let s = self.read_int(src, RSI);
                if s != RSI {
                    encode::mov_rr(&mut self.module.code, 8, RSI, s);
                }
                let d = self.read_int(dst, RDI);
                if d != RDI {
                    encode::mov_rr(&mut self.module.code, 8, RDI, d);
                }
                encode::mov_ri(&mut self.module.code, 4, RCX, i64::from(size));
                encode::rep_movsb(&mut self.module.code);
            }
            InstData::Bin { op, dst, lhs, rhs } => self.bin(op, dst, lhs, rhs),
            InstData::Un { op, dst, src } => self.un(op, dst, src),
            InstData::Cmp { lhs, rhs } => {
                let vt = self.vt(lhs);
                if vt.flonum {
                    let l = self.read_xmm(lhs, 0);
                    let r = self.read_xmm(rhs, 1);
                    encode::ucomis(&mut self.module.code, vt.size == 8, l, r);
                } else {
                    let size = vt.size.max(4);
                    let l = self.read_int(lhs, RAX);
                    match self.loc(rhs) {
                        Allocation::Imm(k) if fits_i32(k) => {
                            encode::alu_ri(&mut self.module.code, Alu::Cmp, size, l, k as i32);
                        }
                        _ => {
                            let r = self.read_int(rhs, RCX);
                            encode::alu_rr(&mut self.module.code, Alu::Cmp, size, l, r);
                        }
                    }
                }
            }
            InstData::Test { src } => {
                let size = self.vt(src).size.max(4);
                let s = self.read_int(src, RAX);
                encode::test_rr(&mut self.module.code, size, s, s);
            }
            InstData::Cond { dst, cond } => {
                encode::setcc(&mut self.module.code, ccval(cond), RAX);
                encode::extend(&mut self.module.code, false, 1, 4, RAX, RAX);
                self.write_int(dst, RAX);
            }
            InstData::Jmp { cond, dest } => {
                if cond == Cond::Any && next == Some(dest) {
                    return Ok(()); // fallthrough
                }
                let label = block_labels[dest.index()];
                match cond {
                    Cond::Any => encode::jmp_rel32(&mut self.module.code),
                    c => encode::jcc_rel32(&mut self.module.code, ccval(c)),
                }
                self.module.use_rel32(label);
            }
            InstData::Precall { arg_count, stack_bytes } => {
                let below = self.stack_depth as u32 + stack_bytes + 8 * arg_count;
                let pad = (16 - below % 16) % 16;
                if pad > 0 {
                    encode::alu_ri(&mut self.module.code, Alu::Sub, 8, RSP, pad as i32);
                    self.stack_depth += pad as i32;
                }
                self.frames.push(CallFrame { pad, stack_bytes });
            }
            InstData::PushArg { src } => {
                let vt = self.vt(src);
                if vt.flonum {
                    encode::alu_ri(&mut self.module.code, Alu::Sub, 8, RSP, 8);
                    let x = self.read_xmm(src, 0);
                    encode::sse_store(&mut self.module.code, vt.size == 8, x, RSP, 0);
                } else {
                    let s = self.read_int(src, RAX);
                    encode::push(&mut self.module.code, s);
                }
                self.stack_depth += 8;
            }
            InstData::Call { dst, target, reg_args, float_mask } => {
                self.call(dst.expand(), target, reg_args, float_mask);
            }
            InstData::Result { src } => {
                let vt = self.vt(src);
                if vt.flonum {
                    let x = self.read_xmm(src, 0);
                    if x != 0 {
                        let p = if vt.size == 8 { 0xf2 } else { 0xf3 };
                        encode::sse_rr(&mut self.module.code, p, 0x10, 0, x);
                    }
                } else {
                    let s = self.read_int(src, RAX);
                    if s != RAX {
                        encode::mov_rr(&mut self.module.code, 8, RAX, s);
                    }
                }
            }
            InstData::PtrAdd { dst, base, index, scale, disp } => {
                let b = self.read_int(base, RAX);
                let out = self.int_out(dst);
                match index.expand() {
                    Some(idx) => {
                        let i = self.read_int(idx, RCX);
                        if fits_i32(disp) {
                            encode::lea_sib(&mut self.module.code, out, b, i, scale, disp as i32);
                        } else {
                            encode::lea_sib(&mut self.module.code, out, b, i, scale, 0);
                            encode::mov_ri(&mut self.module.code, 8, RDX, disp);
                            encode::alu_rr(&mut self.module.code, Alu::Add, 8, out, RDX);
                        }
                    }
                    None => {
                        if fits_i32(disp) {
                            encode::lea(&mut self.module.code, out, b, disp as i32);
                        } else {
                            encode::mov_ri(&mut self.module.code, 8, RDX, disp);
                            encode::lea_sib(&mut self.module.code, out, b, RDX, 1, 0);
                        }
                    }
                }
                self.write_int(dst, out);
            }
            InstData::Cast { dst, src } => self.cast(dst, src),
            InstData::Mov { dst, src } => {
                if self.loc(dst) == self.loc(src) {
                    return Ok(());
                }
                if self.vt(dst).flonum {
                    let x = self.read_xmm(src, 0);
                    self.write_xmm(dst, x);
                } else {
                    let s = self.read_int(src, RAX);
                    self.write_int(dst, s);
                }
            }
            InstData::Inc { addr, size, value } => {
                let a = self.read_int(addr, RAX);
                if value == 1 {
                    encode::incdec_mem(&mut self.module.code, u32::from(size), true, a, 0);
                } else {
                    debug_assert!(fits_i32(value));
                    encode::addsub_mem_imm(
                        &mut self.module.code,
                        u32::from(size),
                        true,
                        a,
                        0,
                        value as i32,
                    );
                }
            }
            InstData::Dec { addr, size, value } => {
                let a = self.read_int(addr, RAX);
                if value == 1 {
                    encode::incdec_mem(&mut self.module.code, u32::from(size), false, a, 0);
                } else {
                    debug_assert!(fits_i32(value));
                    encode::addsub_mem_imm(
                        &mut self.module.code,
                        u32::from(size),
                        false,
                        a,
                        0,
                        value as i32,
                    );
                }
            }
            InstData::AddSp { bytes } => {
                if bytes < 0 {
                    encode::alu_ri(&mut self.module.code, Alu::Sub, 8, RSP, -bytes);
                } else if bytes > 0 {
                    encode::alu_ri(&mut self.module.code, Alu::Add, 8, RSP, bytes);
                }
                self.stack_depth -= bytes;
            }
        }
        Ok(())
    }

    fn bin(&mut self, op: BinOp, dst: VReg, lhs: VReg, rhs: VReg) {
        let vt = self.vt(dst);
        if vt.flonum {
            let dbl = vt.size == 8;
            let p = if dbl { 0xf2 } else { 0xf3 };
            let l = self.read_xmm(lhs, 0);
            if l != 0 {
                encode::sse_rr(&mut self.module.code, p, 0x10, 0, l);
            }
            let r = self.read_xmm(rhs, 1);
            let opb = match op {
                BinOp::Add => 0x58,
                BinOp::Sub => 0x5c,
                BinOp::Mul => 0x59,
                BinOp::Div | BinOp::DivU => 0x5e,
                _ => unreachable!("bitwise op on float"),
            };
            encode::sse_rr(&mut self.module.code, p, opb, 0, r);
            self.write_xmm(dst, 0);
            return;
        }

        let size = vt.size.max(4);
        let l = self.read_int(lhs, RAX);
        if l != RAX {
            encode::mov_rr(&mut self.module.code, 8, RAX, l);
        }
        match op {
            BinOp::Add | BinOp::Sub | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                let alu = match op {
                    BinOp::Add => Alu::Add,
                    BinOp::Sub => Alu::Sub,
                    BinOp::BitAnd => Alu::And,
                    BinOp::BitOr => Alu::Or,
                    _ => Alu::Xor,
                };
                match self.loc(rhs) {
                    Allocation::Imm(k) if fits_i32(k) => {
                        encode::alu_ri(&mut self.module.code, alu, size, RAX, k as i32);
                    }
                    _ => {
                        let r = self.read_int(rhs, RCX);
                        encode::alu_rr(&mut self.module.code, alu, size, RAX, r);
                    }
                }
            }
            BinOp::Mul => {
                let r = self.read_int(rhs, RCX);
                encode::imul_rr(&mut self.module.code, size, RAX, r);
            }
            BinOp::Div | BinOp::DivU | BinOp::Mod | BinOp::ModU => {
                let signed = matches!(op, BinOp::Div | BinOp::Mod);
                let r = self.read_int(rhs, RCX);
                debug_assert!(r != RDX, "divisor in rdx");
                if signed {
                    encode::cdq_cqo(&mut self.module.code, size);
                } else {
                    encode::alu_rr(&mut self.module.code, Alu::Xor, 4, RDX, RDX);
                }
                encode::divide(&mut self.module.code, size, signed, r);
                if matches!(op, BinOp::Mod | BinOp::ModU) {
                    encode::mov_rr(&mut self.module.code, 8, RAX, RDX);
                }
            }
            BinOp::LShift | BinOp::RShift => {
                let r = self.read_int(rhs, RCX);
                if r != RCX {
                    encode::mov_rr(&mut self.module.code, 8, RCX, r);
                }
                let ext = if op == BinOp::LShift {
                    4
                } else if vt.unsigned {
                    5
                } else {
                    7
                };
                encode::shift_cl(&mut self.module.code, size, ext, RAX);
            }
        }
        self.write_int(dst, RAX);
    }

    fn un(&mut self, op: UnOp, dst: VReg, src: VReg) {
        let vt = self.vt(dst);
        if vt.flonum {
            debug_assert_eq!(op, UnOp::Neg);
            let dbl = vt.size == 8;
            let x = self.read_xmm(src, 0);
            encode::xorps(&mut self.module.code, 1, 1);
            encode::sse_rr(&mut self.module.code, if dbl { 0xf2 } else { 0xf3 }, 0x5c, 1, x);
            self.write_xmm(dst, 1);
            return;
        }
        let size = vt.size.max(4);
        let s = self.read_int(src, RAX);
        if s != RAX {
            encode::mov_rr(&mut self.module.code, 8, RAX, s);
        }
        match op {
            UnOp::Neg => encode::unary_f7(&mut self.module.code, size, 3, RAX),
            UnOp::BitNot => encode::unary_f7(&mut self.module.code, size, 2, RAX),
            UnOp::Not => {
                encode::test_rr(&mut self.module.code, size, RAX, RAX);
                encode::setcc(&mut self.module.code, 0x4, RAX);
                encode::extend(&mut self.module.code, false, 1, 4, RAX, RAX);
            }
        }
        self.write_int(dst, RAX);
    }

    fn cast(&mut self, dst: VReg, src: VReg) {
        let dt = self.vt(dst);
        let st = self.vt(src);
        match (dt.flonum, st.flonum) {
            (false, false) => {
                let s = self.read_int(src, RAX);
                let out = self.int_out(dst);
                if dt.size > st.size {
                    encode::extend(
                        &mut self.module.code,
                        !st.unsigned,
                        st.size,
                        dt.size.max(4),
                        out,
                        s,
                    );
                } else if dt.size < st.size && dt.size < 4 {
                    // Narrowing must re-normalize the register.
                    encode::extend(&mut self.module.code, !dt.unsigned, dt.size, 4, out, s);
                } else if dt.size == 4 && st.size == 8 {
                    encode::mov_rr(&mut self.module.code, 4, out, s);
                } else if out != s {
                    encode::mov_rr(&mut self.module.code, 8, out, s);
                }
                self.write_int(dst, out);
            }
            (true, false) => {
                let s = self.read_int(src, RAX);
                let x = self.xmm_out(dst);
                // 32-bit unsigned sources are zero-extended in the register,
                // so converting them as 64-bit signed is exact.
                let int_size = if st.size == 8 || (st.unsigned && st.size == 4) { 8 } else { 4 };
                encode::cvt_i2f(&mut self.module.code, dt.size == 8, int_size, x, s);
                self.write_xmm(dst, x);
            }
            (false, true) => {
                let x = self.read_xmm(src, 0);
                let out = self.int_out(dst);
                let int_size = if dt.size == 8 { 8 } else { 4 };
                encode::cvt_f2i(&mut self.module.code, st.size == 8, int_size, out, x);
                self.write_int(dst, out);
            }
            (true, true) => {
                let x = self.read_xmm(src, 0);
                let out = self.xmm_out(dst);
                if dt.size != st.size {
                    encode::cvt_f2f(&mut self.module.code, dt.size == 8, out, x);
                    self.write_xmm(dst, out);
                } else {
                    self.write_xmm(dst, x);
                }
            }
        }
    }

    fn call(&mut self, dst: Option<VReg>, target: CallTarget, reg_args: u32, float_mask: u32) {
        let frame = self.frames.pop().expect("call without matching precall");

        // Pop staged arguments into the argument registers, left to right.
        let mut gpr = 0usize;
        let mut fpr = 0usize;
        for k in 0..reg_args {
            if float_mask & (1 << k) != 0 {
                encode::sse_load(&mut self.module.code, true, ARG_FPRS[fpr] - XMM0, RSP, 0);
                encode::alu_ri(&mut self.module.code, Alu::Add, 8, RSP, 8);
                fpr += 1;
            } else {
                encode::pop(&mut self.module.code, ARG_GPRS[gpr]);
                gpr += 1;
            }
        }
        self.stack_depth -= 8 * reg_args as i32;

        // Variadic callees expect the vector-register argument count in al.
        encode::mov_ri(&mut self.module.code, 1, RAX, i64::from(float_mask.count_ones()));

        match target {
            CallTarget::Label(label) => {
                encode::call_rel32(&mut self.module.code);
                self.module.use_rel32(label);
            }
            CallTarget::Reg(r) => {
                let t = self.read_int(r, R11);
                if t != R11 {
                    encode::mov_rr(&mut self.module.code, 8, R11, t);
                }
                encode::call_ind(&mut self.module.code, R11);
            }
        }

        let restore = frame.stack_bytes + frame.pad;
        if restore > 0 {
            encode::alu_ri(&mut self.module.code, Alu::Add, 8, RSP, restore as i32);
            self.stack_depth -= restore as i32;
        }

        if let Some(d) = dst {
            if self.vt(d).flonum {
                self.write_xmm(d, 0);
            } else {
                self.write_int(d, RAX);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature};
    use crate::regalloc;

    fn emit(func: &Function) -> Vec<u8> {
        let mut module = Module::new(0x1000);
        let allocs = regalloc::run(func, reg_pools());
        let isa = Isa::new("x86_64-unknown-linux-gnu".parse().unwrap());
        isa.emit_function(func, &allocs, &mut module).unwrap();
        module.finish().unwrap().bytes
    }

    #[test]
    fn return_constant() {
        let mut func = Function::new(
            "seven",
            true,
            Signature { params: Vec::new(), ret: Some(VRegType::I32), vaargs: false },
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let k = b.iconst(7, VRegType::I32);
            b.result(k);
        }
        let bytes = emit(&func);
        // push rbp; mov rbp, rsp; mov eax, 7; mov rsp, rbp; pop rbp; ret
        assert_eq!(
            bytes,
            vec![0x55, 0x48, 0x8b, 0xec, 0xb8, 7, 0, 0, 0, 0x48, 0x8b, 0xe5, 0x5d, 0xc3]
        );
    }

    #[test]
    fn fallthrough_jump_is_elided() {
        let mut func = Function::new(
            "j",
            false,
            Signature { params: Vec::new(), ret: None, vaargs: false },
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let next = b.split();
            b.jmp(Cond::Any, next);
            b.switch_to_block(next);
        }
        let bytes = emit(&func);
        assert!(!bytes.contains(&0xe9), "jump to the next block should fall through");
    }

    #[test]
    fn call_keeps_stack_aligned() {
        let mut func = Function::new(
            "c",
            false,
            Signature { params: Vec::new(), ret: Some(VRegType::I32), vaargs: false },
        );
        let mut module = Module::new(0);
        let f = module.labels.intern("f");
        {
            let mut b = FunctionBuilder::new(&mut func);
            b.precall(1, 0);
            let k = b.iconst(1, VRegType::I32);
            b.pusharg(k);
            let r = b.call(CallTarget::Label(f), 1, 0, Some(VRegType::I32)).unwrap();
            b.result(r);
        }
        let allocs = regalloc::run(&func, reg_pools());
        let isa = Isa::new("x86_64-unknown-linux-gnu".parse().unwrap());
        isa.emit_function(&func, &allocs, &mut module).unwrap();
        module.bind_here(f);
        module.code.put1(0xc3);
        let bytes = module.finish().unwrap().bytes;
        // One push of an argument plus the 8-byte alignment pad.
        let subs = bytes.windows(4).filter(|w| w == &[0x48, 0x83, 0xec, 0x08]).count();
        assert_eq!(subs, 1, "expected one `sub rsp, 8` alignment pad");
    }
}

//! Low-level x86-64 instruction encoding: prefixes, ModRM/SIB forms and the
//! individual instruction emitters used by the block walker.
//!
//! Register operands are raw register numbers (0–15 per bank); XMM operands
//! take the bank-local number, not the allocator unit. Memory operands are
//! `[base + disp]` or `[base + index*scale + disp]`; displacement width and
//! the SIB quirks of `rsp`/`r12`/`rbp`/`r13` are handled here. Emitters for
//! PC-relative forms leave a zeroed displacement for the caller to record
//! against a label.

use crate::binemit::CodeBuffer;

/// Emit a REX prefix when one is needed.
///
/// `w` selects 64-bit operand size; `reg`, `index` and `rm` are the raw
/// register numbers feeding the ModRM.reg, SIB.index and ModRM.rm fields.
/// `byte_ops` forces a bare REX when an 8-bit operand names `spl`–`dil`.
fn rex(buf: &mut CodeBuffer, w: bool, reg: u8, index: u8, rm: u8, byte_ops: bool) {
    let mut v = 0x40u8;
    if w {
        v |= 0x08;
    }
    if reg & 8 != 0 {
        v |= 0x04;
    }
    if index & 8 != 0 {
        v |= 0x02;
    }
    if rm & 8 != 0 {
        v |= 0x01;
    }
    let low_byte = |r: u8| r >= 4 && r < 8;
    if v != 0x40 || (byte_ops && (low_byte(reg) || low_byte(rm))) {
        buf.put1(v);
    }
}

/// Prefix sequence for an integer operation of `size` bytes.
fn op_prefix(buf: &mut CodeBuffer, size: u32, reg: u8, index: u8, rm: u8) {
    if size == 2 {
        buf.put1(0x66);
    }
    rex(buf, size == 8, reg, index, rm, size == 1);
}

fn modrm(buf: &mut CodeBuffer, mode: u8, reg: u8, rm: u8) {
    buf.put1(mode << 6 | (reg & 7) << 3 | (rm & 7));
}

fn fits_i8(v: i32) -> bool {
    v >= i32::from(i8::min_value()) && v <= i32::from(i8::max_value())
}

/// Whether a 64-bit immediate survives sign-extension from 32 bits.
pub fn fits_i32(v: i64) -> bool {
    v >= i64::from(i32::min_value()) && v <= i64::from(i32::max_value())
}

/// ModRM (+SIB) for `[base + disp]`.
fn mem(buf: &mut CodeBuffer, reg: u8, base: u8, disp: i32) {
    let b = base & 7;
    let need_sib = b == 4; // rsp/r12
    let need_disp = disp != 0 || b == 5; // rbp/r13 have no disp-less form
    let (mode, wide) = if !need_disp {
        (0u8, false)
    } else if fits_i8(disp) {
        (1, false)
    } else {
        (2, true)
    };
    modrm(buf, mode, reg, if need_sib { 4 } else { base });
    if need_sib {
        buf.put1(0x24); // index=none, base=rsp-class
    }
    if mode == 1 {
        buf.put1(disp as u8);
    } else if wide {
        buf.put4(disp as u32);
    }
}

/// ModRM+SIB for `[base + index*scale + disp]`. `index` must not be `rsp`.
fn mem_sib(buf: &mut CodeBuffer, reg: u8, base: u8, index: u8, scale: u8, disp: i32) {
    debug_assert!(index != 4, "rsp cannot be an index register");
    let ss = match scale {
        1 => 0u8,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!("bad scale"),
    };
    let need_disp = disp != 0 || base & 7 == 5;
    let (mode, wide) = if !need_disp {
        (0u8, false)
    } else if fits_i8(disp) {
        (1, false)
    } else {
        (2, true)
    };
    modrm(buf, mode, reg, 4);
    buf.put1(ss << 6 | (index & 7) << 3 | (base & 7));
    if mode == 1 {
        buf.put1(disp as u8);
    } else if wide {
        buf.put4(disp as u32);
    }
}

/// Register-to-register move.
pub fn mov_rr(buf: &mut CodeBuffer, size: u32, dst: u8, src: u8) {
    op_prefix(buf, size, dst, 0, src);
    buf.put1(if size == 1 { 0x8a } else { 0x8b });
    modrm(buf, 3, dst, src);
}

/// Load `dst` from `[base + disp]`.
pub fn mov_load(buf: &mut CodeBuffer, size: u32, dst: u8, base: u8, disp: i32) {
    op_prefix(buf, size, dst, 0, base);
    buf.put1(if size == 1 { 0x8a } else { 0x8b });
    mem(buf, dst, base, disp);
}

/// Store `src` to `[base + disp]`.
pub fn mov_store(buf: &mut CodeBuffer, size: u32, src: u8, base: u8, disp: i32) {
    op_prefix(buf, size, src, 0, base);
    buf.put1(if size == 1 { 0x88 } else { 0x89 });
    mem(buf, src, base, disp);
}

/// Move an immediate into a register using the smallest encoding whose
/// sign-extension reproduces the full value.
pub fn mov_ri(buf: &mut CodeBuffer, size: u32, dst: u8, imm: i64) {
    match size {
        1 => {
            rex(buf, false, 0, 0, dst, true);
            buf.put1(0xb0 | (dst & 7));
            buf.put1(imm as u8);
        }
        2 => {
            buf.put1(0x66);
            rex(buf, false, 0, 0, dst, false);
            buf.put1(0xb8 | (dst & 7));
            buf.put2(imm as u16);
        }
        4 => {
            rex(buf, false, 0, 0, dst, false);
            buf.put1(0xb8 | (dst & 7));
            buf.put4(imm as u32);
        }
        _ => {
            if fits_i32(imm) {
                rex(buf, true, 0, 0, dst, false);
                buf.put1(0xc7);
                modrm(buf, 3, 0, dst);
                buf.put4(imm as u32);
            } else {
                rex(buf, true, 0, 0, dst, false);
                buf.put1(0xb8 | (dst & 7));
                buf.put8(imm as u64);
            }
        }
    }
}

/// ALU opcode bases for the `op r/m, r` form.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alu {
    /// Integer addition.
    Add = 0x00,
    /// Bitwise or.
    Or = 0x08,
    /// Bitwise and.
    And = 0x20,
    /// Integer subtraction.
    Sub = 0x28,
    /// Bitwise exclusive or.
    Xor = 0x30,
    /// Compare (subtract, flags only).
    Cmp = 0x38,
}

/// `op dst, src` on registers.
pub fn alu_rr(buf: &mut CodeBuffer, op: Alu, size: u32, dst: u8, src: u8) {
    op_prefix(buf, size, dst, 0, src);
    buf.put1(op as u8 | if size == 1 { 0x02 } else { 0x03 });
    modrm(buf, 3, dst, src);
}

/// `op dst, imm` with an 8- or 32-bit immediate.
pub fn alu_ri(buf: &mut CodeBuffer, op: Alu, size: u32, dst: u8, imm: i32) {
    let ext = (op as u8) >> 3; // /digit for the 0x81 group
    op_prefix(buf, size, 0, 0, dst);
    if size == 1 {
        buf.put1(0x80);
        modrm(buf, 3, ext, dst);
        buf.put1(imm as u8);
    } else if fits_i8(imm) {
        buf.put1(0x83);
        modrm(buf, 3, ext, dst);
        buf.put1(imm as u8);
    } else {
        buf.put1(0x81);
        modrm(buf, 3, ext, dst);
        buf.put4(imm as u32);
    }
}

/// `test a, b`.
pub fn test_rr(buf: &mut CodeBuffer, size: u32, a: u8, b: u8) {
    op_prefix(buf, size, b, 0, a);
    buf.put1(if size == 1 { 0x84 } else { 0x85 });
    modrm(buf, 3, b, a);
}

/// `imul dst, src` (signed; also used for unsigned low halves).
pub fn imul_rr(buf: &mut CodeBuffer, size: u32, dst: u8, src: u8) {
    debug_assert!(size >= 2);
    op_prefix(buf, size, dst, 0, src);
    buf.put1(0x0f);
    buf.put1(0xaf);
    modrm(buf, 3, dst, src);
}

/// Sign-extend `rax` into `rdx:rax` (`cdq`/`cqo`).
pub fn cdq_cqo(buf: &mut CodeBuffer, size: u32) {
    if size == 8 {
        buf.put1(0x48);
    }
    buf.put1(0x99);
}

/// Signed or unsigned division of `rdx:rax` by `rm`.
pub fn divide(buf: &mut CodeBuffer, size: u32, signed: bool, rm: u8) {
    op_prefix(buf, size, 0, 0, rm);
    buf.put1(if size == 1 { 0xf6 } else { 0xf7 });
    modrm(buf, 3, if signed { 7 } else { 6 }, rm);
}

/// `neg` (`ext` 3) or `not` (`ext` 2) on a register.
pub fn unary_f7(buf: &mut CodeBuffer, size: u32, ext: u8, rm: u8) {
    op_prefix(buf, size, 0, 0, rm);
    buf.put1(if size == 1 { 0xf6 } else { 0xf7 });
    modrm(buf, 3, ext, rm);
}

/// Shift `rm` by `cl`: `ext` 4 = shl, 5 = shr, 7 = sar.
pub fn shift_cl(buf: &mut CodeBuffer, size: u32, ext: u8, rm: u8) {
    op_prefix(buf, size, 0, 0, rm);
    buf.put1(if size == 1 { 0xd2 } else { 0xd3 });
    modrm(buf, 3, ext, rm);
}

/// `movsx`/`movzx` from `from` bytes to `to` bytes.
pub fn extend(buf: &mut CodeBuffer, signed: bool, from: u32, to: u32, dst: u8, src: u8) {
    debug_assert!(from < to);
    match (from, signed) {
        (4, true) => {
            // movsxd
            rex(buf, true, dst, 0, src, false);
            buf.put1(0x63);
            modrm(buf, 3, dst, src);
        }
        (4, false) => {
            // A 32-bit move zero-extends implicitly.
            mov_rr(buf, 4, dst, src);
        }
        (w, _) => {
            op_prefix(buf, to, dst, 0, src);
            buf.put1(0x0f);
            buf.put1(match (w, signed) {
                (1, true) => 0xbe,
                (1, false) => 0xb6,
                (2, true) => 0xbf,
                _ => 0xb7,
            });
            modrm(buf, 3, dst, src);
        }
    }
}

/// Sized load with extension to at least 32 bits.
pub fn load_extend(
    buf: &mut CodeBuffer,
    size: u32,
    unsigned: bool,
    to64: bool,
    dst: u8,
    base: u8,
    disp: i32,
) {
    let to = if to64 { 8 } else { 4 };
    match size {
        1 | 2 => {
            op_prefix(buf, to, dst, 0, base);
            buf.put1(0x0f);
            buf.put1(match (size, unsigned) {
                (1, false) => 0xbe,
                (1, true) => 0xb6,
                (2, false) => 0xbf,
                _ => 0xb7,
            });
            mem(buf, dst, base, disp);
        }
        4 if !to64 || unsigned => mov_load(buf, 4, dst, base, disp),
        4 => {
            rex(buf, true, dst, 0, base, false);
            buf.put1(0x63);
            mem(buf, dst, base, disp);
        }
        _ => mov_load(buf, 8, dst, base, disp),
    }
}

/// `lea dst, [base + disp]`.
pub fn lea(buf: &mut CodeBuffer, dst: u8, base: u8, disp: i32) {
    rex(buf, true, dst, 0, base, false);
    buf.put1(0x8d);
    mem(buf, dst, base, disp);
}

/// `lea dst, [base + index*scale + disp]`.
pub fn lea_sib(buf: &mut CodeBuffer, dst: u8, base: u8, index: u8, scale: u8, disp: i32) {
    rex(buf, true, dst, index, base, false);
    buf.put1(0x8d);
    mem_sib(buf, dst, base, index, scale, disp);
}

/// `lea dst, [rip + disp32]` with a zero placeholder displacement.
pub fn lea_rip(buf: &mut CodeBuffer, dst: u8) {
    rex(buf, true, dst, 0, 0, false);
    buf.put1(0x8d);
    modrm(buf, 0, dst, 5);
    buf.put4(0);
}

/// `setcc dst` for the low byte of `dst`.
pub fn setcc(buf: &mut CodeBuffer, cc: u8, dst: u8) {
    rex(buf, false, 0, 0, dst, true);
    buf.put1(0x0f);
    buf.put1(0x90 | cc);
    modrm(buf, 3, 0, dst);
}

/// `jcc` with a 32-bit placeholder displacement.
pub fn jcc_rel32(buf: &mut CodeBuffer, cc: u8) {
    buf.put1(0x0f);
    buf.put1(0x80 | cc);
    buf.put4(0);
}

/// `jmp` with a 32-bit placeholder displacement.
pub fn jmp_rel32(buf: &mut CodeBuffer) {
    buf.put1(0xe9);
    buf.put4(0);
}

/// `call` with a 32-bit placeholder displacement.
pub fn call_rel32(buf: &mut CodeBuffer) {
    buf.put1(0xe8);
    buf.put4(0);
}

/// Indirect `call` through a register.
pub fn call_ind(buf: &mut CodeBuffer, rm: u8) {
    rex(buf, false, 0, 0, rm, false);
    buf.put1(0xff);
    modrm(buf, 3, 2, rm);
}

/// `push` a 64-bit register.
pub fn push(buf: &mut CodeBuffer, r: u8) {
    rex(buf, false, 0, 0, r, false);
    buf.put1(0x50 | (r & 7));
}

/// `pop` into a 64-bit register.
pub fn pop(buf: &mut CodeBuffer, r: u8) {
    rex(buf, false, 0, 0, r, false);
    buf.put1(0x58 | (r & 7));
}

/// `ret`.
pub fn ret(buf: &mut CodeBuffer) {
    buf.put1(0xc3);
}

/// `rep movsb`: copy `rcx` bytes from `[rsi]` to `[rdi]`.
pub fn rep_movsb(buf: &mut CodeBuffer) {
    buf.put1(0xf3);
    buf.put1(0xa4);
}

/// In-memory increment/decrement by one.
pub fn incdec_mem(buf: &mut CodeBuffer, size: u32, inc: bool, base: u8, disp: i32) {
    op_prefix(buf, size, 0, 0, base);
    buf.put1(if size == 1 { 0xfe } else { 0xff });
    mem(buf, if inc { 0 } else { 1 }, base, disp);
}

/// In-memory add/sub of an immediate.
pub fn addsub_mem_imm(buf: &mut CodeBuffer, size: u32, add: bool, base: u8, disp: i32, imm: i32) {
    let ext = if add { 0 } else { 5 };
    op_prefix(buf, size, 0, 0, base);
    if size == 1 {
        buf.put1(0x80);
        mem(buf, ext, base, disp);
        buf.put1(imm as u8);
    } else if fits_i8(imm) {
        buf.put1(0x83);
        mem(buf, ext, base, disp);
        buf.put1(imm as u8);
    } else {
        buf.put1(0x81);
        mem(buf, ext, base, disp);
        buf.put4(imm as u32);
    }
}

// --- SSE scalar forms ---------------------------------------------------

fn sse_prefix(buf: &mut CodeBuffer, prefix: u8, w: bool, reg: u8, rm: u8) {
    if prefix != 0 {
        buf.put1(prefix);
    }
    rex(buf, w, reg, 0, rm, false);
    buf.put1(0x0f);
}

/// Scalar SSE op between XMM registers: `op xmm_dst, xmm_src`.
pub fn sse_rr(buf: &mut CodeBuffer, prefix: u8, op: u8, dst: u8, src: u8) {
    sse_prefix(buf, prefix, false, dst, src);
    buf.put1(op);
    modrm(buf, 3, dst, src);
}

/// Scalar SSE load: `movss/movsd xmm, [base + disp]`.
pub fn sse_load(buf: &mut CodeBuffer, dbl: bool, dst: u8, base: u8, disp: i32) {
    if dbl {
        buf.put1(0xf2);
    } else {
        buf.put1(0xf3);
    }
    rex(buf, false, dst, 0, base, false);
    buf.put1(0x0f);
    buf.put1(0x10);
    mem(buf, dst, base, disp);
}

/// Scalar SSE store: `movss/movsd [base + disp], xmm`.
pub fn sse_store(buf: &mut CodeBuffer, dbl: bool, src: u8, base: u8, disp: i32) {
    if dbl {
        buf.put1(0xf2);
    } else {
        buf.put1(0xf3);
    }
    rex(buf, false, src, 0, base, false);
    buf.put1(0x0f);
    buf.put1(0x11);
    mem(buf, src, base, disp);
}

/// `cvtsi2ss/sd xmm, gpr` from a 32- or 64-bit integer.
pub fn cvt_i2f(buf: &mut CodeBuffer, dbl: bool, int_size: u32, dst: u8, src: u8) {
    buf.put1(if dbl { 0xf2 } else { 0xf3 });
    rex(buf, int_size == 8, dst, 0, src, false);
    buf.put1(0x0f);
    buf.put1(0x2a);
    modrm(buf, 3, dst, src);
}

/// `cvttss/sd2si gpr, xmm` truncating to a 32- or 64-bit integer.
pub fn cvt_f2i(buf: &mut CodeBuffer, dbl: bool, int_size: u32, dst: u8, src: u8) {
    buf.put1(if dbl { 0xf2 } else { 0xf3 });
    rex(buf, int_size == 8, dst, 0, src, false);
    buf.put1(0x0f);
    buf.put1(0x2c);
    modrm(buf, 3, dst, src);
}

/// `cvtss2sd`/`cvtsd2ss`.
pub fn cvt_f2f(buf: &mut CodeBuffer, to_dbl: bool, dst: u8, src: u8) {
    sse_rr(buf, if to_dbl { 0xf3 } else { 0xf2 }, 0x5a, dst, src);
}

/// `ucomiss/sd a, b`: unordered scalar compare setting integer flags.
pub fn ucomis(buf: &mut CodeBuffer, dbl: bool, a: u8, b: u8) {
    sse_rr(buf, if dbl { 0x66 } else { 0 }, 0x2e, a, b);
}

/// `xorps dst, src`; zeroing idiom.
pub fn xorps(buf: &mut CodeBuffer, dst: u8, src: u8) {
    sse_rr(buf, 0, 0x57, dst, src);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes<F: FnOnce(&mut CodeBuffer)>(f: F) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut buf);
        buf.bytes().to_vec()
    }

    #[test]
    fn mov_imm_width_selection() {
        // 32-bit value keeps the short form with sign extension.
        assert_eq!(bytes(|b| mov_ri(b, 8, 0, 7)), vec![0x48, 0xc7, 0xc0, 7, 0, 0, 0]);
        // Too big for sign-extended imm32: full 64-bit immediate.
        assert_eq!(
            bytes(|b| mov_ri(b, 8, 0, 0x1_0000_0000)),
            vec![0x48, 0xb8, 0, 0, 0, 0, 1, 0, 0, 0]
        );
        // Negative values fit the sign-extended form.
        assert_eq!(bytes(|b| mov_ri(b, 8, 0, -1)), vec![0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn rbp_relative_addressing() {
        // mov eax, [rbp-8]: rbp base forces a displacement byte.
        assert_eq!(bytes(|b| mov_load(b, 4, 0, 5, -8)), vec![0x8b, 0x45, 0xf8]);
        // mov rax, [rsp]: rsp base forces a SIB byte.
        assert_eq!(bytes(|b| mov_load(b, 8, 0, 4, 0)), vec![0x48, 0x8b, 0x04, 0x24]);
    }

    #[test]
    fn extended_registers_get_rex() {
        // mov r10, r8
        assert_eq!(bytes(|b| mov_rr(b, 8, 10, 8)), vec![0x4d, 0x8b, 0xd0]);
        // add eax, r9d
        assert_eq!(bytes(|b| alu_rr(b, Alu::Add, 4, 0, 9)), vec![0x41, 0x03, 0xc1]);
    }

    #[test]
    fn byte_ops_on_sil_dil_need_rex() {
        // mov dil, al would silently become bh without REX.
        assert_eq!(bytes(|b| mov_rr(b, 1, 7, 0)), vec![0x40, 0x8a, 0xf8]);
    }

    #[test]
    fn sib_scaling() {
        // lea rax, [rcx + rdx*8 + 4]
        assert_eq!(bytes(|b| lea_sib(b, 0, 1, 2, 8, 4)), vec![0x48, 0x8d, 0x44, 0xd1, 0x04]);
    }
}

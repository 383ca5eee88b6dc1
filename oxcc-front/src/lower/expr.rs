//! Expression lowering: typed AST nodes into IR instructions.
//!
//! Scalars become virtual registers; arrays, structs and functions are
//! handled as addresses throughout. Short-circuit operators lower to
//! conditional jumps (never to materialized compares followed by logical
//! arithmetic), and the same `gen_cond_jmp` path serves control-flow
//! statements, so `if (a && b)` jumps directly off the flags.

use crate::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use crate::lower::Lowerer;
use crate::scope::Storage;
use crate::types::TypeRef;
use oxcc_codegen::binemit::Label;
use oxcc_codegen::ir::{BinOp, Block, CallTarget, Cond, UnOp, VReg, VRegType};
use smallvec::SmallVec;

fn is_const(e: &Expr) -> bool {
    matches!(e.kind, ExprKind::IntLit(_))
}

fn compare_cond(op: BinaryOp) -> Cond {
    match op {
        BinaryOp::Eq => Cond::Eq,
        BinaryOp::Ne => Cond::Ne,
        BinaryOp::Lt => Cond::Lt,
        BinaryOp::Le => Cond::Le,
        BinaryOp::Gt => Cond::Gt,
        BinaryOp::Ge => Cond::Ge,
        _ => unreachable!("not a comparison"),
    }
}

impl<'a, 'f> Lowerer<'a, 'f> {
    /// Lower `e` to a value register. `None` means the expression has no
    /// value (a void call) or lowering already reported an error.
    pub(crate) fn gen_expr(&mut self, e: &Expr) -> Option<VReg> {
        match &e.kind {
            ExprKind::IntLit(v) => {
                let vt = self.types.to_vtype(e.ty);
                Some(self.b.iconst(*v, vt))
            }
            ExprKind::FloLit(v) => Some(self.flonum_reg(*v, e.ty)),
            ExprKind::StrLit(bytes) => {
                let label = self.intern_string(bytes);
                Some(self.b.iofs(label))
            }
            ExprKind::Var { .. } => self.gen_variable(e),
            ExprKind::Ref(sub) => self.gen_lval(sub),
            ExprKind::Deref(sub) => {
                let reg = self.gen_expr(sub)?;
                if self.is_scalar_value(e.ty) {
                    let vt = self.types.to_vtype(e.ty);
                    Some(self.b.load(reg, vt))
                } else {
                    // Arrays, structs and functions stay as addresses.
                    Some(reg)
                }
            }
            ExprKind::Member { .. } => {
                let reg = self.gen_lval(e)?;
                if self.is_scalar_value(e.ty) {
                    let vt = self.types.to_vtype(e.ty);
                    Some(self.b.load(reg, vt))
                } else {
                    Some(reg)
                }
            }
            ExprKind::Cast(sub) => {
                if self.types.is_void(e.ty) {
                    self.gen_expr(sub);
                    return None;
                }
                let reg = self.gen_expr(sub)?;
                Some(self.gen_cast_reg(reg, e.ty))
            }
            ExprKind::Ternary { cond, then, els } => self.gen_ternary(e.ty, cond, then, els),
            ExprKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs),
            ExprKind::AssignWith { op, lhs, rhs } => self.gen_assign_with(*op, lhs, rhs),
            ExprKind::IncDec { pre, inc, sub } => self.gen_incdec(*pre, *inc, sub),
            ExprKind::Call { func, args } => self.gen_funcall(e.ty, func, args),
            ExprKind::CompLit { var, inits } => {
                for stmt in inits {
                    self.gen_stmt(stmt);
                }
                self.gen_expr(var)
            }
            ExprKind::Un { op, sub } => self.gen_unary(*op, e.ty, sub),
            ExprKind::Bin { op, lhs, rhs } => self.gen_binary(*op, e.ty, lhs, rhs),
        }
    }

    fn is_scalar_value(&self, ty: TypeRef) -> bool {
        self.types.is_number(ty) || self.types.is_ptr(ty)
    }

    /// Lower `e` to the address of its storage.
    pub(crate) fn gen_lval(&mut self, e: &Expr) -> Option<VReg> {
        match &e.kind {
            ExprKind::Var { name, scope } => {
                let var = self.scopes.find_here(*scope, name)?;
                let info = &self.scopes.vars[var];
                if self.scopes.is_global(*scope) {
                    let label = self.ctx.label(name);
                    return Some(self.b.iofs(label));
                }
                match info.storage.clone() {
                    Storage::StaticLocal { label } => {
                        let label = self.ctx.label(&label);
                        Some(self.b.iofs(label))
                    }
                    Storage::Global => {
                        // Block-scope extern declaration.
                        let label = self.ctx.label(name);
                        Some(self.b.iofs(label))
                    }
                    Storage::Local { vreg } => {
                        let vreg = vreg?;
                        self.b.func.set_reffed(vreg);
                        Some(self.b.bofs(vreg))
                    }
                    _ => None,
                }
            }
            ExprKind::Deref(sub) => self.gen_expr(sub),
            ExprKind::Member { base, index, .. } => {
                let info = self.struct_info_of(base.ty)?;
                self.types.compute_layout(info);
                let offset = self.types.struct_info(info).members[*index].offset;
                let base_reg = if self.types.is_ptr(base.ty) {
                    self.gen_expr(base)?
                } else {
                    self.gen_lval(base)?
                };
                if offset == 0 {
                    Some(base_reg)
                } else {
                    Some(self.b.ptradd(base_reg, None, 1, i64::from(offset), VRegType::PTR))
                }
            }
            ExprKind::StrLit(bytes) => {
                let label = self.intern_string(bytes);
                Some(self.b.iofs(label))
            }
            ExprKind::CompLit { var, inits } => {
                for stmt in inits {
                    self.gen_stmt(stmt);
                }
                self.gen_lval(var)
            }
            _ => {
                self.diags.error(e.pos, "expression is not an lvalue");
                None
            }
        }
    }

    fn struct_info_of(&self, ty: TypeRef) -> Option<crate::types::StructRef> {
        let ty = if self.types.ptr_or_array(ty) { self.types.elem_of(ty) } else { ty };
        match *self.types.get(ty) {
            crate::types::Type::Struct { info } => Some(info),
            _ => None,
        }
    }

    fn gen_variable(&mut self, e: &Expr) -> Option<VReg> {
        if self.is_scalar_value(e.ty) {
            if let Some(vreg) = self.local_scalar_vreg(e) {
                return Some(vreg);
            }
            let addr = self.gen_lval(e)?;
            let vt = self.types.to_vtype(e.ty);
            return Some(self.b.load(addr, vt));
        }
        // Arrays, structs and functions evaluate to their address.
        self.gen_lval(e)
    }

    /// The backing register of a plain (non-static, non-extern, not
    /// address-taken-yet) scalar local.
    fn local_scalar_vreg(&self, e: &Expr) -> Option<VReg> {
        match &e.kind {
            ExprKind::Var { name, scope } if !self.scopes.is_global(*scope) => {
                let var = self.scopes.find_here(*scope, name)?;
                let info = &self.scopes.vars[var];
                match info.storage {
                    Storage::Local { vreg } => vreg,
                    _ => None,
                }
            }
            _ => None,
        }
    }

    // --- literals and constants ----------------------------------------

    fn intern_string(&mut self, bytes: &[u8]) -> Label {
        let mut data = bytes.to_vec();
        data.push(0);
        self.ctx.define_rodata(data, 1)
    }

    fn flonum_reg(&mut self, value: f64, ty: TypeRef) -> VReg {
        let vt = self.types.to_vtype(ty);
        let bytes = if vt.size == 8 {
            value.to_bits().to_le_bytes().to_vec()
        } else {
            (value as f32).to_bits().to_le_bytes().to_vec()
        };
        let label = self.ctx.define_rodata(bytes, vt.align);
        let addr = self.b.iofs(label);
        self.b.load(addr, vt)
    }

    // --- casts ----------------------------------------------------------

    /// Convert a register to another C type, folding constants.
    pub(crate) fn gen_cast_reg(&mut self, reg: VReg, to: TypeRef) -> VReg {
        let to_vt = self.types.to_vtype(to);
        let data = self.b.func.vregs[reg].clone();
        if let Some(value) = data.konst {
            if !to_vt.flonum {
                let wrapped = wrap_const(value, to_vt);
                return self.b.iconst(wrapped, to_vt);
            }
        }
        let from = data.vtype;
        if from.size == to_vt.size && from.unsigned == to_vt.unsigned && from.flonum == to_vt.flonum
        {
            return reg;
        }
        self.b.cast(reg, to_vt)
    }

    // --- unary and binary operators -------------------------------------

    fn gen_unary(&mut self, op: UnaryOp, ty: TypeRef, sub: &Expr) -> Option<VReg> {
        match op {
            UnaryOp::Neg if self.types.is_flonum(ty) => {
                let zero = self.flonum_reg(0.0, ty);
                let reg = self.gen_expr(sub)?;
                let vt = self.types.to_vtype(ty);
                Some(self.b.binop(BinOp::Sub, zero, reg, vt))
            }
            UnaryOp::Neg => {
                let reg = self.gen_expr(sub)?;
                let vt = self.types.to_vtype(ty);
                Some(self.b.unop(UnOp::Neg, reg, vt))
            }
            UnaryOp::BitNot => {
                let reg = self.gen_expr(sub)?;
                let vt = self.types.to_vtype(ty);
                Some(self.b.unop(UnOp::BitNot, reg, vt))
            }
            UnaryOp::Not if self.types.is_flonum(sub.ty) => {
                let zero = Expr { kind: ExprKind::FloLit(0.0), ty: sub.ty, pos: sub.pos };
                let cond = self.gen_compare(BinaryOp::Eq, sub, &zero)?;
                Some(self.b.cond(cond))
            }
            UnaryOp::Not => {
                let reg = self.gen_expr(sub)?;
                let vt = self.types.to_vtype(ty);
                Some(self.b.unop(UnOp::Not, reg, vt))
            }
        }
    }

    fn gen_binary(&mut self, op: BinaryOp, ty: TypeRef, lhs: &Expr, rhs: &Expr) -> Option<VReg> {
        match op {
            BinaryOp::Comma => {
                self.gen_expr(lhs);
                self.gen_expr(rhs)
            }
            BinaryOp::LogAnd => Some(self.gen_logical(true, lhs, rhs)),
            BinaryOp::LogOr => Some(self.gen_logical(false, lhs, rhs)),
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                let cond = self.gen_compare(op, lhs, rhs)?;
                Some(self.b.cond(cond))
            }
            BinaryOp::PtrAdd | BinaryOp::PtrSub => {
                let lreg = self.gen_expr(lhs)?;
                self.gen_ptradd(op == BinaryOp::PtrSub, ty, lreg, rhs)
            }
            BinaryOp::PtrDiff => self.gen_ptrdiff(lhs, rhs),
            _ => {
                let l = self.gen_expr(lhs)?;
                let r = self.gen_expr(rhs)?;
                Some(self.gen_arith(op, ty, l, r))
            }
        }
    }

    fn ir_binop(&self, op: BinaryOp, ty: TypeRef) -> BinOp {
        let unsigned = self.types.is_unsigned(ty);
        match op {
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::Div => {
                if unsigned {
                    BinOp::DivU
                } else {
                    BinOp::Div
                }
            }
            BinaryOp::Mod => {
                if unsigned {
                    BinOp::ModU
                } else {
                    BinOp::Mod
                }
            }
            BinaryOp::BitAnd => BinOp::BitAnd,
            BinaryOp::BitOr => BinOp::BitOr,
            BinaryOp::BitXor => BinOp::BitXor,
            BinaryOp::LShift => BinOp::LShift,
            BinaryOp::RShift => BinOp::RShift,
            _ => unreachable!("not an arithmetic operator"),
        }
    }

    fn gen_arith(&mut self, op: BinaryOp, ty: TypeRef, lhs: VReg, rhs: VReg) -> VReg {
        let vt = self.types.to_vtype(ty);
        let op = self.ir_binop(op, ty);
        self.b.binop(op, lhs, rhs, vt)
    }

    /// Pointer ± integer with the pointee scale folded into the
    /// instruction when it is 1, 2, 4 or 8.
    fn gen_ptradd(&mut self, sub: bool, ty: TypeRef, lreg: VReg, rhs: &Expr) -> Option<VReg> {
        let pointee = self.types.elem_of(ty);
        let scale = i64::from(self.types.size_of(pointee).max(1));
        let vt = self.types.to_vtype(ty);

        // Peel casts to see a constant index.
        let mut raw = rhs;
        while let ExprKind::Cast(inner) = &raw.kind {
            raw = inner;
        }
        if let ExprKind::IntLit(v) = raw.kind {
            let disp = if sub { -v * scale } else { v * scale };
            return Some(self.b.ptradd(lreg, None, 1, disp, vt));
        }

        let mut rreg = self.gen_expr(rhs)?;
        if sub {
            let rvt = self.b.func.vtype(rreg);
            rreg = self.b.unop(UnOp::Neg, rreg, rvt);
        } else {
            // Copy into a fresh register so two spilled operands never meet
            // in one addressing mode.
            let rvt = self.b.func.vtype(rreg);
            let tmp = self.b.new_reg(rvt);
            self.b.mov(tmp, rreg);
            rreg = tmp;
        }
        let (index_scale, rreg) = if scale.count_ones() == 1 && scale <= 8 {
            (scale as u8, rreg)
        } else {
            let rvt = self.b.func.vtype(rreg);
            let k = self.b.iconst(scale, rvt);
            (1u8, self.b.binop(BinOp::Mul, rreg, k, rvt))
        };
        let rreg = {
            let long = self.types.long_;
            self.gen_cast_reg(rreg, long)
        };
        Some(self.b.ptradd(lreg, Some(rreg), index_scale, 0, vt))
    }

    fn gen_ptrdiff(&mut self, lhs: &Expr, rhs: &Expr) -> Option<VReg> {
        let l = self.gen_expr(lhs)?;
        let r = self.gen_expr(rhs)?;
        let diff = self.b.binop(BinOp::Sub, l, r, VRegType::I64);
        let pointee = self.types.elem_of(lhs.ty);
        let scale = i64::from(self.types.size_of(pointee).max(1));
        if scale == 1 {
            return Some(diff);
        }
        // The difference is exact, so an arithmetic shift and a signed
        // division agree for power-of-two strides.
        if scale.count_ones() == 1 {
            let shift = self.b.iconst(i64::from(scale.trailing_zeros()), VRegType::I64);
            return Some(self.b.binop(BinOp::RShift, diff, shift, VRegType::I64));
        }
        let k = self.b.iconst(scale, VRegType::I64);
        Some(self.b.binop(BinOp::Div, diff, k, VRegType::I64))
    }

    // --- comparisons and conditions -------------------------------------

    /// Emit the compare for `lhs op rhs` and return the condition a
    /// consumer should branch or set on.
    fn gen_compare(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<Cond> {
        let mut cond = compare_cond(op);
        let (lhs, rhs) = if is_const(lhs) && !is_const(rhs) {
            cond = cond.swap();
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };

        let unsigned = self.types.is_unsigned(lhs.ty)
            || self.types.is_flonum(lhs.ty)
            || self.types.ptr_or_array(lhs.ty);
        if unsigned {
            cond = cond.unsigned();
        }

        let lhs_reg = self.gen_expr(lhs)?;
        match rhs.kind {
            ExprKind::IntLit(0) if matches!(cond, Cond::Eq | Cond::Ne) => {
                self.b.test(lhs_reg);
            }
            ExprKind::IntLit(v) => {
                let vt = self.types.to_vtype(rhs.ty);
                let k = self.b.iconst(v, vt);
                self.b.cmp(lhs_reg, k);
            }
            _ => {
                let rhs_reg = self.gen_expr(rhs)?;
                // Copy the left side so two spilled operands never meet.
                let vt = self.b.func.vtype(lhs_reg);
                let tmp = self.b.new_reg(vt);
                self.b.mov(tmp, lhs_reg);
                self.b.cmp(tmp, rhs_reg);
            }
        }
        Some(cond)
    }

    /// Branch to `bb` when `cond` evaluates to `tf`. Comparison and
    /// logical expressions jump directly off the flags.
    pub(crate) fn gen_cond_jmp(&mut self, cond: &Expr, tf: bool, bb: Block) {
        match &cond.kind {
            ExprKind::IntLit(v) => {
                if (*v != 0) == tf {
                    self.b.jmp(Cond::Any, bb);
                }
                return;
            }
            ExprKind::FloLit(v) => {
                if (*v != 0.0) == tf {
                    self.b.jmp(Cond::Any, bb);
                }
                return;
            }
            ExprKind::Un { op: UnaryOp::Not, sub } => {
                self.gen_cond_jmp(sub, !tf, bb);
                return;
            }
            ExprKind::Bin { op, lhs, rhs } if op.is_compare() => {
                if let Some(mut c) = self.gen_compare(*op, lhs, rhs) {
                    if !tf {
                        c = c.invert();
                    }
                    self.b.jmp(c, bb);
                }
                return;
            }
            ExprKind::Bin { op: BinaryOp::LogAnd, lhs, rhs } => {
                if !tf {
                    let bb1 = self.b.split();
                    let bb2 = self.b.split_after(bb1);
                    self.gen_cond_jmp(lhs, false, bb);
                    self.b.switch_to_block(bb1);
                    self.gen_cond_jmp(rhs, false, bb);
                    self.b.switch_to_block(bb2);
                } else {
                    let bb1 = self.b.split();
                    let bb2 = self.b.split_after(bb1);
                    self.gen_cond_jmp(lhs, false, bb2);
                    self.b.switch_to_block(bb1);
                    self.gen_cond_jmp(rhs, true, bb);
                    self.b.switch_to_block(bb2);
                }
                return;
            }
            ExprKind::Bin { op: BinaryOp::LogOr, lhs, rhs } => {
                if tf {
                    let bb1 = self.b.split();
                    let bb2 = self.b.split_after(bb1);
                    self.gen_cond_jmp(lhs, true, bb);
                    self.b.switch_to_block(bb1);
                    self.gen_cond_jmp(rhs, true, bb);
                    self.b.switch_to_block(bb2);
                } else {
                    let bb1 = self.b.split();
                    let bb2 = self.b.split_after(bb1);
                    self.gen_cond_jmp(lhs, true, bb2);
                    self.b.switch_to_block(bb1);
                    self.gen_cond_jmp(rhs, false, bb);
                    self.b.switch_to_block(bb2);
                }
                return;
            }
            _ => {}
        }

        if self.types.is_flonum(cond.ty) {
            let zero = Expr { kind: ExprKind::FloLit(0.0), ty: cond.ty, pos: cond.pos };
            let c = self.gen_compare(BinaryOp::Ne, cond, &zero);
            if let Some(mut c) = c {
                if !tf {
                    c = c.invert();
                }
                self.b.jmp(c, bb);
            }
            return;
        }
        if let Some(reg) = self.gen_expr(cond) {
            self.b.test(reg);
            self.b.jmp(if tf { Cond::Ne } else { Cond::Eq }, bb);
        }
    }

    fn gen_logical(&mut self, is_and: bool, lhs: &Expr, rhs: &Expr) -> VReg {
        let bb1 = self.b.split();
        let bb2 = self.b.split_after(bb1);
        let miss_bb = self.b.split_after(bb2);
        let next_bb = self.b.split_after(miss_bb);

        // `miss_bb` is the short-circuit target: false for &&, true for ||.
        self.gen_cond_jmp(lhs, !is_and, miss_bb);
        self.b.switch_to_block(bb1);
        self.gen_cond_jmp(rhs, !is_and, miss_bb);
        self.b.switch_to_block(bb2);

        let result = self.b.new_reg(VRegType::I32);
        let hit = self.b.iconst(if is_and { 1 } else { 0 }, VRegType::I32);
        self.b.mov(result, hit);
        self.b.jmp(Cond::Any, next_bb);
        self.b.switch_to_block(miss_bb);
        let miss = self.b.iconst(if is_and { 0 } else { 1 }, VRegType::I32);
        self.b.mov(result, miss);
        self.b.switch_to_block(next_bb);
        result
    }

    fn gen_ternary(&mut self, ty: TypeRef, cond: &Expr, then: &Expr, els: &Expr) -> Option<VReg> {
        let tbb = self.b.split();
        let fbb = self.b.split_after(tbb);
        let nbb = self.b.split_after(fbb);
        let no_value = self.types.is_void(ty);
        let result = if no_value {
            None
        } else {
            let vt = self.types.to_vtype(ty);
            Some(self.b.new_reg(vt))
        };

        self.gen_cond_jmp(cond, false, fbb);
        self.b.switch_to_block(tbb);
        let tval = self.gen_expr(then);
        if let (Some(result), Some(tval)) = (result, tval) {
            self.b.mov(result, tval);
        }
        self.b.jmp(Cond::Any, nbb);
        self.b.switch_to_block(fbb);
        let fval = self.gen_expr(els);
        if let (Some(result), Some(fval)) = (result, fval) {
            self.b.mov(result, fval);
        }
        self.b.switch_to_block(nbb);
        result
    }

    // --- assignment, increments -----------------------------------------

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr) -> Option<VReg> {
        let src = self.gen_expr(rhs)?;
        if self.types.is_struct(lhs.ty) {
            let size = self.types.size_of(lhs.ty);
            let dst = self.gen_lval(lhs)?;
            let tmp = self.b.new_reg(VRegType::PTR);
            self.b.mov(tmp, src);
            self.b.memcpy(dst, tmp, size);
            return Some(src);
        }
        if let Some(vreg) = self.local_scalar_vreg(lhs) {
            self.b.mov(vreg, src);
            return Some(src);
        }
        let dst = self.gen_lval(lhs)?;
        // Copy through a fresh register so a spilled source and a spilled
        // address never meet in the store.
        let vt = self.types.to_vtype(lhs.ty);
        let tmp = self.b.new_reg(vt);
        self.b.mov(tmp, src);
        self.b.store(dst, tmp);
        Some(src)
    }

    fn gen_assign_with(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<VReg> {
        if matches!(op, BinaryOp::PtrAdd | BinaryOp::PtrSub) {
            if let Some(vreg) = self.local_scalar_vreg(lhs) {
                let result = self.gen_ptradd(op == BinaryOp::PtrSub, lhs.ty, vreg, rhs)?;
                self.b.mov(vreg, result);
                return Some(result);
            }
            let lval = self.gen_lval(lhs)?;
            let vt = self.types.to_vtype(lhs.ty);
            let cur = self.b.load(lval, vt);
            let result = self.gen_ptradd(op == BinaryOp::PtrSub, lhs.ty, cur, rhs)?;
            let tmp = self.b.new_reg(vt);
            self.b.mov(tmp, result);
            self.b.store(lval, tmp);
            return Some(result);
        }

        if let Some(vreg) = self.local_scalar_vreg(lhs) {
            let r = self.gen_expr(rhs)?;
            let result = self.gen_arith(op, lhs.ty, vreg, r);
            self.b.mov(vreg, result);
            return Some(result);
        }
        let lval = self.gen_lval(lhs)?;
        let r = self.gen_expr(rhs)?;
        let vt = self.types.to_vtype(lhs.ty);
        let cur = self.b.load(lval, vt);
        let result = self.gen_arith(op, lhs.ty, cur, r);
        let tmp = self.b.new_reg(vt);
        self.b.mov(tmp, result);
        self.b.store(lval, tmp);
        Some(result)
    }

    fn gen_incdec(&mut self, pre: bool, inc: bool, sub: &Expr) -> Option<VReg> {
        let stride = if self.types.is_ptr(sub.ty) {
            let pointee = self.types.elem_of(sub.ty);
            i64::from(self.types.size_of(pointee).max(1))
        } else {
            1
        };
        let vt = self.types.to_vtype(sub.ty);

        if let Some(vreg) = self.local_scalar_vreg(sub) {
            let num = self.b.iconst(stride, vt);
            let op = if inc { BinOp::Add } else { BinOp::Sub };
            if pre {
                let result = self.b.binop(op, vreg, num, vt);
                self.b.mov(vreg, result);
                return Some(result);
            }
            let org = self.b.new_reg(vt);
            self.b.mov(org, vreg);
            let result = self.b.binop(op, vreg, num, vt);
            self.b.mov(vreg, result);
            return Some(org);
        }

        let lval = self.gen_lval(sub)?;
        let size = vt.size.min(8) as u8;
        if pre {
            if inc {
                self.b.inc(lval, size, stride);
            } else {
                self.b.dec(lval, size, stride);
            }
            Some(self.b.load(lval, vt))
        } else {
            let result = self.b.load(lval, vt);
            if inc {
                self.b.inc(lval, size, stride);
            } else {
                self.b.dec(lval, size, stride);
            }
            Some(result)
        }
    }

    // --- calls -----------------------------------------------------------

    fn gen_funcall(&mut self, ret_ty: TypeRef, func: &Expr, args: &[Expr]) -> Option<VReg> {
        const MAX_REG_ARGS: usize = 6;
        const MAX_FREG_ARGS: usize = 8;

        let vaargs = {
            let fty = if self.types.is_func(func.ty) {
                func.ty
            } else if self.types.is_ptr(func.ty) {
                self.types.elem_of(func.ty)
            } else {
                func.ty
            };
            match self.types.get(fty) {
                crate::types::Type::Func { vaargs, .. } => *vaargs,
                _ => false,
            }
        };

        // Assign each argument a register ordinal or a stack offset.
        struct ArgInfo {
            offset: Option<i32>,
            flonum: bool,
        }
        let mut infos: SmallVec<[ArgInfo; 8]> = SmallVec::new();
        let mut greg = 0usize;
        let mut freg = 0usize;
        let mut stack_bytes = 0i32;
        let mut float_mask = 0u32;
        let mut reg_ord = 0u32;
        for arg in args {
            if self.types.is_struct(arg.ty) {
                self.diags
                    .error(arg.pos, "passing a struct by value is not supported; pass a pointer");
                return None;
            }
            let flonum = self.types.is_flonum(arg.ty);
            let in_reg =
                if flonum { freg < MAX_FREG_ARGS } else { greg < MAX_REG_ARGS };
            if in_reg {
                if flonum {
                    freg += 1;
                    float_mask |= 1 << reg_ord;
                } else {
                    greg += 1;
                }
                reg_ord += 1;
                infos.push(ArgInfo { offset: None, flonum });
            } else {
                if vaargs {
                    self.diags.error(
                        arg.pos,
                        format!("argument count exceeds {} in a variadic call", MAX_REG_ARGS),
                    );
                }
                infos.push(ArgInfo { offset: Some(stack_bytes), flonum });
                stack_bytes += 8;
            }
        }
        let reg_args = reg_ord;

        self.b.precall(reg_args, stack_bytes as u32);
        if stack_bytes > 0 {
            self.b.addsp(-stack_bytes);
        }

        // Evaluate right to left; register arguments are staged with
        // pushes, stack arguments stored at their final offsets.
        let mut pushed = 0i32;
        for (arg, info) in args.iter().zip(infos.iter()).rev() {
            let reg = match self.gen_expr(arg) {
                Some(reg) => reg,
                None => {
                    let vt = self.types.to_vtype(arg.ty);
                    self.b.iconst(0, vt)
                }
            };
            match info.offset {
                None => {
                    self.b.pusharg(reg);
                    pushed += 1;
                }
                Some(offset) => {
                    let dst = self.b.sofs(offset + pushed * 8);
                    let vt = self.b.func.vtype(reg);
                    let tmp = self.b.new_reg(vt);
                    self.b.mov(tmp, reg);
                    self.b.store(dst, tmp);
                }
            }
        }

        let target = match (&func.kind, self.types.is_func(func.ty)) {
            (ExprKind::Var { name, .. }, true) => CallTarget::Label(self.ctx.label(name)),
            _ => {
                let reg = self.gen_expr(func)?;
                CallTarget::Reg(reg)
            }
        };

        let ret = if self.types.is_void(ret_ty) {
            None
        } else {
            Some(self.types.to_vtype(ret_ty))
        };
        self.b.call(target, reg_args, float_mask, ret)
    }
}

fn wrap_const(v: i64, vt: VRegType) -> i64 {
    let bits = u32::from(vt.size.min(8)) * 8;
    if bits >= 64 {
        return v;
    }
    let mask = (1i64 << bits) - 1;
    let t = v & mask;
    if !vt.unsigned && (t & (1i64 << (bits - 1))) != 0 {
        t | !mask
    } else {
        t
    }
}

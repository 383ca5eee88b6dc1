//! Expression parsing, the usual arithmetic conversions, and parse-time
//! constant folding.
//!
//! Every constructor here returns a fully typed node. Arithmetic on two
//! integer (or two floating) literals folds immediately, with wrap-around
//! at the result type's width, so array sizes, case labels, enum values
//! and static initializers are plain constants by the time anything
//! downstream looks at them. Pointer +/- integer is rewritten into the
//! dedicated `PtrAdd`/`PtrSub` forms and pointer-pointer subtraction into
//! `PtrDiff`; integer `Add`/`Sub` never sees a pointer operand.

use crate::ast::{BinaryOp, Expr, ExprKind, Stmt, UnaryOp};
use crate::diag::Pos;
use crate::lexer::TokenKind;
use crate::parser::Parser;
use crate::scope::{Storage, VarFlags, VarInfo};
use crate::types::{FixnumKind, Type, TypeRef};

impl<'a> Parser<'a> {
    /// Full expression (including the comma operator).
    pub(crate) fn expr(&mut self) -> Expr {
        let mut e = self.assign_expr();
        while self.eat(TokenKind::Comma) {
            let rhs = self.assign_expr();
            let ty = rhs.ty;
            let pos = e.pos;
            e = Expr {
                kind: ExprKind::Bin { op: BinaryOp::Comma, lhs: Box::new(e), rhs: Box::new(rhs) },
                ty,
                pos,
            };
        }
        e
    }

    /// Assignment expression.
    pub(crate) fn assign_expr(&mut self) -> Expr {
        let lhs = self.conditional();
        let tok = self.next();
        let pos = tok.pos;
        let op = match tok.kind {
            TokenKind::Assign => {
                let rhs = self.assign_expr();
                return self.make_assign(lhs, rhs, pos);
            }
            TokenKind::PlusAssign => BinaryOp::Add,
            TokenKind::MinusAssign => BinaryOp::Sub,
            TokenKind::StarAssign => BinaryOp::Mul,
            TokenKind::SlashAssign => BinaryOp::Div,
            TokenKind::PercentAssign => BinaryOp::Mod,
            TokenKind::AmpAssign => BinaryOp::BitAnd,
            TokenKind::PipeAssign => BinaryOp::BitOr,
            TokenKind::CaretAssign => BinaryOp::BitXor,
            TokenKind::LShiftAssign => BinaryOp::LShift,
            TokenKind::RShiftAssign => BinaryOp::RShift,
            _ => {
                self.lexer.unget(tok);
                return lhs;
            }
        };
        let rhs = self.assign_expr();
        self.make_assign_with(op, lhs, rhs, pos)
    }

    /// A constant integer expression; non-constants are diagnosed.
    pub(crate) fn const_expr(&mut self) -> i64 {
        let e = self.conditional();
        match e.kind {
            ExprKind::IntLit(v) => v,
            _ => {
                self.diags.error(e.pos, "constant expression expected");
                0
            }
        }
    }

    fn conditional(&mut self) -> Expr {
        let cond = self.log_or();
        if !self.eat(TokenKind::Question) {
            return cond;
        }
        let pos = cond.pos;
        if !self.types.is_scalar(cond.ty) {
            self.diags.error(cond.pos, "condition must be scalar");
        }
        let then = self.expr();
        self.expect(TokenKind::Colon, "`:` in conditional expression");
        let els = self.conditional();
        self.make_ternary(cond, then, els, pos)
    }

    fn make_ternary(&mut self, cond: Expr, then: Expr, els: Expr, pos: Pos) -> Expr {
        let then = self.decay(then);
        let els = self.decay(els);
        let ty = if self.types.is_number(then.ty) && self.types.is_number(els.ty) {
            let (then, els, ty) = self.usual_arith(then, els);
            return Expr {
                kind: ExprKind::Ternary {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    els: Box::new(els),
                },
                ty,
                pos,
            };
        } else if self.types.is_ptr(then.ty) && self.is_null_const(&els) {
            then.ty
        } else if self.types.is_ptr(els.ty) && self.is_null_const(&then) {
            els.ty
        } else if self.types.same(then.ty, els.ty) {
            then.ty
        } else {
            self.diags.error(pos, "mismatched branches of `?:`");
            then.ty
        };
        Expr {
            kind: ExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
            ty,
            pos,
        }
    }

    fn log_or(&mut self) -> Expr {
        let mut e = self.log_and();
        while self.eat(TokenKind::PipePipe) {
            let rhs = self.log_and();
            e = self.make_bop(BinaryOp::LogOr, e, rhs);
        }
        e
    }

    fn log_and(&mut self) -> Expr {
        let mut e = self.bit_or();
        while self.eat(TokenKind::AmpAmp) {
            let rhs = self.bit_or();
            e = self.make_bop(BinaryOp::LogAnd, e, rhs);
        }
        e
    }

    fn bit_or(&mut self) -> Expr {
        let mut e = self.bit_xor();
        while self.eat(TokenKind::Pipe) {
            let rhs = self.bit_xor();
            e = self.make_bop(BinaryOp::BitOr, e, rhs);
        }
        e
    }

    fn bit_xor(&mut self) -> Expr {
        let mut e = self.bit_and();
        while self.eat(TokenKind::Caret) {
            let rhs = self.bit_and();
            e = self.make_bop(BinaryOp::BitXor, e, rhs);
        }
        e
    }

    fn bit_and(&mut self) -> Expr {
        let mut e = self.equality();
        while self.eat(TokenKind::Amp) {
            let rhs = self.equality();
            e = self.make_bop(BinaryOp::BitAnd, e, rhs);
        }
        e
    }

    fn equality(&mut self) -> Expr {
        let mut e = self.relational();
        loop {
            let op = if self.eat(TokenKind::EqEq) {
                BinaryOp::Eq
            } else if self.eat(TokenKind::NotEq) {
                BinaryOp::Ne
            } else {
                return e;
            };
            let rhs = self.relational();
            e = self.make_bop(op, e, rhs);
        }
    }

    fn relational(&mut self) -> Expr {
        let mut e = self.shift();
        loop {
            let op = if self.eat(TokenKind::Lt) {
                BinaryOp::Lt
            } else if self.eat(TokenKind::LtEq) {
                BinaryOp::Le
            } else if self.eat(TokenKind::Gt) {
                BinaryOp::Gt
            } else if self.eat(TokenKind::GtEq) {
                BinaryOp::Ge
            } else {
                return e;
            };
            let rhs = self.shift();
            e = self.make_bop(op, e, rhs);
        }
    }

    fn shift(&mut self) -> Expr {
        let mut e = self.additive();
        loop {
            let op = if self.eat(TokenKind::LShift) {
                BinaryOp::LShift
            } else if self.eat(TokenKind::RShift) {
                BinaryOp::RShift
            } else {
                return e;
            };
            let rhs = self.additive();
            e = self.make_bop(op, e, rhs);
        }
    }

    fn additive(&mut self) -> Expr {
        let mut e = self.multiplicative();
        loop {
            let op = if self.eat(TokenKind::Plus) {
                BinaryOp::Add
            } else if self.eat(TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                return e;
            };
            let rhs = self.multiplicative();
            e = self.make_bop(op, e, rhs);
        }
    }

    fn multiplicative(&mut self) -> Expr {
        let mut e = self.cast_expr();
        loop {
            let op = if self.eat(TokenKind::Star) {
                BinaryOp::Mul
            } else if self.eat(TokenKind::Slash) {
                BinaryOp::Div
            } else if self.eat(TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                return e;
            };
            let rhs = self.cast_expr();
            e = self.make_bop(op, e, rhs);
        }
    }

    fn cast_expr(&mut self) -> Expr {
        let tok = self.next();
        if tok.kind == TokenKind::LParen {
            let probe = self.peek();
            if self.is_type_start(&probe) {
                let ty = self.type_name();
                self.expect(TokenKind::RParen, "`)` after type name");
                if self.peek().kind == TokenKind::LBrace {
                    return self.compound_literal(ty, tok.pos);
                }
                let sub = self.cast_expr();
                return self.make_cast(ty, sub, tok.pos);
            }
        }
        self.lexer.unget(tok);
        self.unary()
    }

    fn unary(&mut self) -> Expr {
        let tok = self.next();
        let pos = tok.pos;
        match tok.kind {
            TokenKind::Plus => {
                let sub = self.cast_expr();
                let sub = self.decay(sub);
                if !self.types.is_number(sub.ty) {
                    self.diags.error(pos, "`+` needs an arithmetic operand");
                }
                self.promote(sub)
            }
            TokenKind::Minus => {
                let sub = self.cast_expr();
                let sub = self.decay(sub);
                if !self.types.is_number(sub.ty) {
                    self.diags.error(pos, "`-` needs an arithmetic operand");
                }
                let sub = self.promote(sub);
                match sub.kind {
                    ExprKind::IntLit(v) => {
                        let ty = sub.ty;
                        self.int_lit(self.wrap_to(ty, v.wrapping_neg()), ty, pos)
                    }
                    ExprKind::FloLit(v) => {
                        Expr { kind: ExprKind::FloLit(-v), ty: sub.ty, pos }
                    }
                    _ => {
                        let ty = sub.ty;
                        Expr { kind: ExprKind::Un { op: UnaryOp::Neg, sub: Box::new(sub) }, ty, pos }
                    }
                }
            }
            TokenKind::Tilde => {
                let sub = self.cast_expr();
                let sub = self.decay(sub);
                if !self.types.is_fixnum(sub.ty) {
                    self.diags.error(pos, "`~` needs an integer operand");
                }
                let sub = self.promote(sub);
                match sub.kind {
                    ExprKind::IntLit(v) => {
                        let ty = sub.ty;
                        self.int_lit(self.wrap_to(ty, !v), ty, pos)
                    }
                    _ => {
                        let ty = sub.ty;
                        Expr {
                            kind: ExprKind::Un { op: UnaryOp::BitNot, sub: Box::new(sub) },
                            ty,
                            pos,
                        }
                    }
                }
            }
            TokenKind::Bang => {
                let sub = self.cast_expr();
                let sub = self.decay(sub);
                if !self.types.is_scalar(sub.ty) {
                    self.diags.error(pos, "`!` needs a scalar operand");
                }
                match sub.kind {
                    ExprKind::IntLit(v) => {
                        let int_ = self.types.int_;
                        self.int_lit((v == 0) as i64, int_, pos)
                    }
                    _ => Expr {
                        kind: ExprKind::Un { op: UnaryOp::Not, sub: Box::new(sub) },
                        ty: self.types.int_,
                        pos,
                    },
                }
            }
            TokenKind::Star => {
                let sub = self.cast_expr();
                let sub = self.decay(sub);
                self.make_deref(sub, pos)
            }
            TokenKind::Amp => {
                let sub = self.cast_expr();
                self.make_ref(sub, pos)
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let inc = tok.kind == TokenKind::PlusPlus;
                let sub = self.unary();
                self.make_incdec(true, inc, sub, pos)
            }
            TokenKind::KwSizeof => {
                let ty = {
                    let open = self.next();
                    if open.kind == TokenKind::LParen {
                        let probe = self.peek();
                        if self.is_type_start(&probe) {
                            let ty = self.type_name();
                            self.expect(TokenKind::RParen, "`)` after type name");
                            ty
                        } else {
                            self.lexer.unget(open);
                            let e = self.unary();
                            e.ty
                        }
                    } else {
                        self.lexer.unget(open);
                        let e = self.unary();
                        e.ty
                    }
                };
                let size = self.types.size_of(ty);
                let ulong = self.types.ulong;
                self.int_lit(i64::from(size), ulong, pos)
            }
            _ => {
                self.lexer.unget(tok);
                self.postfix()
            }
        }
    }

    fn postfix(&mut self) -> Expr {
        let mut e = self.primary();
        loop {
            let tok = self.next();
            let pos = tok.pos;
            match tok.kind {
                TokenKind::LParen => {
                    e = self.make_call(e, pos);
                }
                TokenKind::LBracket => {
                    let index = self.expr();
                    self.expect(TokenKind::RBracket, "`]` after subscript");
                    let base = self.decay(e);
                    let sum = self.make_bop(BinaryOp::Add, base, index);
                    e = self.make_deref(sum, pos);
                }
                TokenKind::Dot => {
                    e = self.make_member(e, false, pos);
                }
                TokenKind::Arrow => {
                    e = self.make_member(e, true, pos);
                }
                TokenKind::PlusPlus => {
                    e = self.make_incdec(false, true, e, pos);
                }
                TokenKind::MinusMinus => {
                    e = self.make_incdec(false, false, e, pos);
                }
                _ => {
                    self.lexer.unget(tok);
                    return e;
                }
            }
        }
    }

    fn primary(&mut self) -> Expr {
        let tok = self.next();
        let pos = tok.pos;
        match tok.kind {
            TokenKind::IntLit { value, long, unsigned } => {
                let kind = if long { FixnumKind::Long } else { FixnumKind::Int };
                let ty = self.types.fixnum(kind, unsigned);
                self.int_lit(value, ty, pos)
            }
            TokenKind::CharLit(value) => {
                let int_ = self.types.int_;
                self.int_lit(value, int_, pos)
            }
            TokenKind::FloLit { value, single } => {
                let ty = if single { self.types.float_ } else { self.types.double_ };
                Expr { kind: ExprKind::FloLit(value), ty, pos }
            }
            TokenKind::StrLit(bytes) => self.string_literal(bytes, pos),
            TokenKind::Ident(name) => {
                match self.scopes.find(self.cur_scope, &name) {
                    Some((var, scope)) => {
                        let info = &self.scopes.vars[var];
                        if let Storage::EnumConst { value } = info.storage {
                            let ty = info.ty;
                            return self.int_lit(value, ty, pos);
                        }
                        let ty = info.ty;
                        Expr { kind: ExprKind::Var { name, scope }, ty, pos }
                    }
                    None => {
                        if self.peek().kind == TokenKind::LParen {
                            // Implicit function declaration.
                            self.diags.warn(
                                pos,
                                format!("implicit declaration of function `{}`", name),
                            );
                            let int_ = self.types.int_;
                            let fty = self.types.func_of(int_, Vec::new(), true);
                            let info = VarInfo {
                                name: name.clone(),
                                ty: fty,
                                flags: VarFlags { is_extern: true, ..VarFlags::default() },
                                storage: Storage::Global,
                                init: None,
                            };
                            let global = self.scopes.global();
                            let _ = self.scopes.add(global, info);
                            Expr { kind: ExprKind::Var { name, scope: global }, ty: fty, pos }
                        } else {
                            self.diags.error(pos, format!("`{}` is not declared", name));
                            let int_ = self.types.int_;
                            self.int_lit(0, int_, pos)
                        }
                    }
                }
            }
            TokenKind::LParen => {
                let e = self.expr();
                self.expect(TokenKind::RParen, "`)`");
                e
            }
            _ => {
                self.diags.error(pos, "expression expected");
                self.lexer.unget(tok);
                let int_ = self.types.int_;
                self.int_lit(0, int_, pos)
            }
        }
    }

    fn string_literal(&mut self, mut bytes: Vec<u8>, pos: Pos) -> Expr {
        // Adjacent string literals concatenate.
        loop {
            let tok = self.next();
            match tok.kind {
                TokenKind::StrLit(more) => bytes.extend_from_slice(&more),
                _ => {
                    self.lexer.unget(tok);
                    break;
                }
            }
        }
        let char_ = self.types.char_;
        let ty = self.types.array_of(char_, Some(bytes.len() as u32 + 1));
        Expr { kind: ExprKind::StrLit(bytes), ty, pos }
    }

    fn compound_literal(&mut self, mut ty: TypeRef, pos: Pos) -> Expr {
        let raw = self.parse_initializer();
        let flat = self.flatten_initializer(&mut ty, raw, pos);
        if self.scopes.is_global(self.cur_scope) {
            self.diags.error(pos, "compound literal at file scope is not supported");
            let int_ = self.types.int_;
            return self.int_lit(0, int_, pos);
        }
        let name = format!(".cl.{}", self.complit_no());
        let info = VarInfo {
            name: name.clone(),
            ty,
            flags: VarFlags::default(),
            storage: Storage::Local { vreg: None },
            init: None,
        };
        if let Err(msg) = self.scopes.add(self.cur_scope, info) {
            self.diags.error(pos, msg);
        }
        let var = self.var_expr(&name, pos);
        let mut inits: Vec<Stmt> = Vec::new();
        self.init_assign_stmts(var.clone(), ty, &flat, &mut inits);
        Expr { kind: ExprKind::CompLit { var: Box::new(var), inits }, ty, pos }
    }

    fn complit_no(&mut self) -> u32 {
        let n = self.complit_count;
        self.complit_count += 1;
        n
    }

    // --- typed constructors ---------------------------------------------

    pub(crate) fn int_lit(&self, value: i64, ty: TypeRef, pos: Pos) -> Expr {
        Expr { kind: ExprKind::IntLit(value), ty, pos }
    }

    /// Array-to-pointer and function-to-pointer decay.
    pub(crate) fn decay(&mut self, e: Expr) -> Expr {
        if self.types.is_array(e.ty) {
            let inner = self.types.elem_of(e.ty);
            let ty = self.types.ptr_to(inner);
            // The value is already the array's address; only the type decays.
            return Expr { ty, ..e };
        }
        if self.types.is_func(e.ty) {
            let ty = self.types.ptr_to(e.ty);
            return Expr { ty, ..e };
        }
        e
    }

    /// Integer promotion: anything narrower than `int` widens to `int`.
    fn promote(&mut self, e: Expr) -> Expr {
        if let Some((kind, _)) = self.types.fixnum_of(e.ty) {
            if kind < FixnumKind::Int {
                let int_ = self.types.int_;
                let pos = e.pos;
                return self.make_cast(int_, e, pos);
            }
            if matches!(self.types.get(e.ty), Type::Enum) {
                let int_ = self.types.int_;
                return Expr { ty: int_, ..e };
            }
        }
        e
    }

    /// The usual arithmetic conversions: returns both operands converted
    /// plus the common type.
    fn usual_arith(&mut self, lhs: Expr, rhs: Expr) -> (Expr, Expr, TypeRef) {
        if self.types.is_flonum(lhs.ty) || self.types.is_flonum(rhs.ty) {
            let dbl = (self.types.is_flonum(lhs.ty) && self.types.size_of(lhs.ty) == 8)
                || (self.types.is_flonum(rhs.ty) && self.types.size_of(rhs.ty) == 8);
            let ty = if dbl { self.types.double_ } else { self.types.float_ };
            let (lpos, rpos) = (lhs.pos, rhs.pos);
            let lhs = self.make_cast(ty, lhs, lpos);
            let rhs = self.make_cast(ty, rhs, rpos);
            return (lhs, rhs, ty);
        }
        let lhs = self.promote(lhs);
        let rhs = self.promote(rhs);
        let (lk, lu) = self.types.fixnum_of(lhs.ty).unwrap_or((FixnumKind::Int, false));
        let (rk, ru) = self.types.fixnum_of(rhs.ty).unwrap_or((FixnumKind::Int, false));
        let kind = lk.max(rk);
        let unsigned = if lk == rk { lu || ru } else if lk > rk { lu } else { ru };
        let ty = self.types.fixnum(kind, unsigned);
        let (lpos, rpos) = (lhs.pos, rhs.pos);
        let lhs = self.make_cast(ty, lhs, lpos);
        let rhs = self.make_cast(ty, rhs, rpos);
        (lhs, rhs, ty)
    }

    fn is_null_const(&self, e: &Expr) -> bool {
        matches!(e.kind, ExprKind::IntLit(0))
    }

    /// Wrap `v` to the width and signedness of `ty` (two's complement).
    pub(crate) fn wrap_to(&self, ty: TypeRef, v: i64) -> i64 {
        let (kind, unsigned) = match self.types.fixnum_of(ty) {
            Some(ku) => ku,
            None => return v,
        };
        let bits = kind.size() * 8;
        if bits >= 64 {
            return v;
        }
        let mask = (1i64 << bits) - 1;
        let t = v & mask;
        if !unsigned && (t & (1i64 << (bits - 1))) != 0 {
            t | !mask
        } else {
            t
        }
    }

    /// Build a cast, folding constant operands.
    pub(crate) fn make_cast(&mut self, ty: TypeRef, sub: Expr, pos: Pos) -> Expr {
        if self.types.same(ty, sub.ty) {
            return sub;
        }
        match sub.kind {
            ExprKind::IntLit(v) => {
                if self.types.is_fixnum(ty) || self.types.is_ptr(ty) {
                    return self.int_lit(self.wrap_to(ty, v), ty, pos);
                }
                if self.types.is_flonum(ty) {
                    return Expr { kind: ExprKind::FloLit(v as f64), ty, pos };
                }
            }
            ExprKind::FloLit(v) => {
                if self.types.is_fixnum(ty) {
                    return self.int_lit(self.wrap_to(ty, v as i64), ty, pos);
                }
                if self.types.is_flonum(ty) {
                    return Expr { kind: ExprKind::FloLit(v), ty, pos };
                }
            }
            _ => {}
        }
        Expr { kind: ExprKind::Cast(Box::new(sub)), ty, pos }
    }

    fn make_deref(&mut self, sub: Expr, pos: Pos) -> Expr {
        let sub = self.decay(sub);
        if !self.types.is_ptr(sub.ty) {
            self.diags.error(pos, "cannot dereference a non-pointer");
            let int_ = self.types.int_;
            return self.int_lit(0, int_, pos);
        }
        let ty = self.types.elem_of(sub.ty);
        Expr { kind: ExprKind::Deref(Box::new(sub)), ty, pos }
    }

    fn make_ref(&mut self, sub: Expr, pos: Pos) -> Expr {
        if !self.is_lvalue(&sub) {
            self.diags.error(pos, "cannot take the address of this expression");
        }
        let ty = self.types.ptr_to(sub.ty);
        Expr { kind: ExprKind::Ref(Box::new(sub)), ty, pos }
    }

    fn is_lvalue(&self, e: &Expr) -> bool {
        matches!(
            e.kind,
            ExprKind::Var { .. }
                | ExprKind::Deref(_)
                | ExprKind::Member { .. }
                | ExprKind::StrLit(_)
                | ExprKind::CompLit { .. }
        )
    }

    fn make_member(&mut self, base: Expr, arrow: bool, pos: Pos) -> Expr {
        let name = {
            let tok = self.next();
            match tok.kind {
                TokenKind::Ident(name) => name,
                _ => {
                    self.diags.error(tok.pos, "member name expected");
                    String::new()
                }
            }
        };
        let struct_ty = if arrow {
            if !self.types.ptr_or_array(base.ty) {
                self.diags.error(pos, "`->` needs a pointer to a struct");
                let int_ = self.types.int_;
                return self.int_lit(0, int_, pos);
            }
            self.types.elem_of(base.ty)
        } else {
            base.ty
        };
        let info = match self.struct_ref_of(struct_ty) {
            Some(info) => info,
            None => {
                self.diags.error(pos, "member access on a non-struct");
                let int_ = self.types.int_;
                return self.int_lit(0, int_, pos);
            }
        };
        let found = self
            .types
            .struct_info(info)
            .members
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name)
            .map(|(i, m)| (i, m.ty));
        match found {
            Some((index, ty)) => Expr {
                kind: ExprKind::Member { base: Box::new(base), name, index },
                ty,
                pos,
            },
            None => {
                self.diags.error(pos, format!("no member named `{}`", name));
                let int_ = self.types.int_;
                self.int_lit(0, int_, pos)
            }
        }
    }

    fn make_incdec(&mut self, pre: bool, inc: bool, sub: Expr, pos: Pos) -> Expr {
        if !self.is_lvalue(&sub) {
            self.diags.error(pos, "increment target must be an lvalue");
        }
        let ty = sub.ty;
        if !self.types.is_fixnum(ty) && !self.types.is_ptr(ty) {
            self.diags.error(pos, "increment needs an integer or pointer");
        }
        Expr { kind: ExprKind::IncDec { pre, inc, sub: Box::new(sub) }, ty, pos }
    }

    pub(crate) fn make_assign(&mut self, lhs: Expr, rhs: Expr, pos: Pos) -> Expr {
        if !self.is_lvalue(&lhs) {
            self.diags.error(pos, "assignment target must be an lvalue");
        }
        let rhs = self.assign_convert(lhs.ty, rhs, pos);
        let ty = lhs.ty;
        Expr { kind: ExprKind::Assign { lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty, pos }
    }

    fn make_assign_with(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr, pos: Pos) -> Expr {
        if !self.is_lvalue(&lhs) {
            self.diags.error(pos, "assignment target must be an lvalue");
        }
        let ty = lhs.ty;
        let (op, rhs) = if self.types.is_ptr(ty) && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let op = if op == BinaryOp::Add { BinaryOp::PtrAdd } else { BinaryOp::PtrSub };
            let rhs = self.decay(rhs);
            if !self.types.is_fixnum(rhs.ty) {
                self.diags.error(pos, "pointer adjustment needs an integer");
            }
            (op, rhs)
        } else {
            if !self.types.is_number(ty) {
                self.diags.error(pos, "compound assignment needs arithmetic operands");
            }
            if self.types.is_flonum(ty)
                && !matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
            {
                self.diags.error(pos, "operator needs integer operands");
            }
            let rhs = self.decay(rhs);
            let rhs = self.assign_convert(ty, rhs, pos);
            (op, rhs)
        };
        Expr { kind: ExprKind::AssignWith { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty, pos }
    }

    /// Convert `rhs` for assignment into `to`; diagnoses incompatible
    /// combinations.
    pub(crate) fn assign_convert(&mut self, to: TypeRef, rhs: Expr, pos: Pos) -> Expr {
        let rhs = self.decay(rhs);
        if self.types.same(to, rhs.ty) {
            return rhs;
        }
        if self.types.is_number(to) && self.types.is_number(rhs.ty) {
            return self.make_cast(to, rhs, pos);
        }
        if self.types.is_ptr(to) {
            if self.is_null_const(&rhs) {
                return self.make_cast(to, rhs, pos);
            }
            if self.types.is_ptr(rhs.ty) {
                let to_inner = self.types.elem_of(to);
                let from_inner = self.types.elem_of(rhs.ty);
                if !self.types.is_void(to_inner)
                    && !self.types.is_void(from_inner)
                    && !self.types.same(to_inner, from_inner)
                {
                    self.diags.warn(pos, "assignment between incompatible pointer types");
                }
                return self.make_cast(to, rhs, pos);
            }
            if self.types.is_fixnum(rhs.ty) {
                self.diags.warn(pos, "assigning an integer to a pointer without a cast");
                return self.make_cast(to, rhs, pos);
            }
        }
        if self.types.is_fixnum(to) && self.types.is_ptr(rhs.ty) {
            self.diags.warn(pos, "assigning a pointer to an integer without a cast");
            return self.make_cast(to, rhs, pos);
        }
        if self.types.is_struct(to) && self.types.same(to, rhs.ty) {
            return rhs;
        }
        if !self.types.is_struct(to) || !self.types.same(to, rhs.ty) {
            let want = self.types.display(to);
            let got = self.types.display(rhs.ty);
            self.diags.error(pos, format!("cannot assign `{}` to `{}`", got, want));
        }
        rhs
    }

    fn make_call(&mut self, func: Expr, pos: Pos) -> Expr {
        let mut args = Vec::new();
        if !self.eat(TokenKind::RParen) {
            loop {
                args.push(self.assign_expr());
                if self.eat(TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen, "`)` after arguments");
                break;
            }
        }

        let fty = if self.types.is_func(func.ty) {
            func.ty
        } else if self.types.is_ptr(func.ty) && {
            let inner = self.types.elem_of(func.ty);
            self.types.is_func(inner)
        } {
            self.types.elem_of(func.ty)
        } else {
            self.diags.error(pos, "called object is not a function");
            let int_ = self.types.int_;
            return self.int_lit(0, int_, pos);
        };
        let (ret, params, vaargs) = match self.types.get(fty).clone() {
            Type::Func { ret, params, vaargs } => (ret, params, vaargs),
            _ => unreachable!(),
        };

        if args.len() < params.len() {
            self.diags.error(pos, "too few arguments in call");
        } else if args.len() > params.len() && !vaargs {
            self.diags.error(pos, "too many arguments in call");
        }

        let mut converted = Vec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            let arg = if let Some(&pty) = params.get(i) {
                self.assign_convert(pty, arg, pos)
            } else {
                // Default argument promotions for the variadic tail.
                let arg = self.decay(arg);
                if self.types.is_flonum(arg.ty) && self.types.size_of(arg.ty) == 4 {
                    let dbl = self.types.double_;
                    self.make_cast(dbl, arg, pos)
                } else {
                    self.promote(arg)
                }
            };
            converted.push(arg);
        }

        Expr {
            kind: ExprKind::Call { func: Box::new(func), args: converted },
            ty: ret,
            pos,
        }
    }

    /// Binary operator constructor: conversions, pointer rewrites, and
    /// constant folding.
    pub(crate) fn make_bop(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        let pos = lhs.pos;
        let lhs = self.decay(lhs);
        let rhs = self.decay(rhs);

        match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let lptr = self.types.is_ptr(lhs.ty);
                let rptr = self.types.is_ptr(rhs.ty);
                if lptr && rptr {
                    if op == BinaryOp::Add {
                        self.diags.error(pos, "cannot add two pointers");
                        return lhs;
                    }
                    if !self.types.same(lhs.ty, rhs.ty) {
                        self.diags.error(pos, "pointer difference needs matching types");
                    }
                    let long_ = self.types.long_;
                    return Expr {
                        kind: ExprKind::Bin {
                            op: BinaryOp::PtrDiff,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        ty: long_,
                        pos,
                    };
                }
                if lptr || rptr {
                    let (ptr, int) = if lptr { (lhs, rhs) } else { (rhs, lhs) };
                    if rptr && op == BinaryOp::Sub {
                        self.diags.error(pos, "cannot subtract a pointer from an integer");
                    }
                    if !self.types.is_fixnum(int.ty) {
                        self.diags.error(pos, "pointer adjustment needs an integer");
                    }
                    let pop = if op == BinaryOp::Add { BinaryOp::PtrAdd } else { BinaryOp::PtrSub };
                    let ty = ptr.ty;
                    return Expr {
                        kind: ExprKind::Bin { op: pop, lhs: Box::new(ptr), rhs: Box::new(int) },
                        ty,
                        pos,
                    };
                }
            }
            _ => {}
        }

        match op {
            BinaryOp::LogAnd | BinaryOp::LogOr => {
                if !self.types.is_scalar(lhs.ty) || !self.types.is_scalar(rhs.ty) {
                    self.diags.error(pos, "logical operator needs scalar operands");
                }
                if let (&ExprKind::IntLit(a), &ExprKind::IntLit(b)) = (&lhs.kind, &rhs.kind) {
                    let v = if op == BinaryOp::LogAnd {
                        (a != 0 && b != 0) as i64
                    } else {
                        (a != 0 || b != 0) as i64
                    };
                    let int_ = self.types.int_;
                    return self.int_lit(v, int_, pos);
                }
                return Expr {
                    kind: ExprKind::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                    ty: self.types.int_,
                    pos,
                };
            }
            BinaryOp::LShift | BinaryOp::RShift => {
                if !self.types.is_fixnum(lhs.ty) || !self.types.is_fixnum(rhs.ty) {
                    self.diags.error(pos, "shift needs integer operands");
                }
                let lhs = self.promote(lhs);
                let int_ = self.types.int_;
                let rhs = self.make_cast(int_, rhs, pos);
                let ty = lhs.ty;
                if let (&ExprKind::IntLit(a), &ExprKind::IntLit(b)) = (&lhs.kind, &rhs.kind) {
                    if let Some(v) = self.fold_shift(op, ty, a, b) {
                        return self.int_lit(v, ty, pos);
                    }
                }
                return Expr {
                    kind: ExprKind::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                    ty,
                    pos,
                };
            }
            _ => {}
        }

        if op.is_compare() {
            // Pointer comparison keeps its operands; arithmetic comparison
            // converts them.
            let (lhs, rhs) = if self.types.ptr_or_array(lhs.ty) || self.types.ptr_or_array(rhs.ty)
            {
                (lhs, rhs)
            } else if self.types.is_number(lhs.ty) && self.types.is_number(rhs.ty) {
                let (l, r, _) = self.usual_arith(lhs, rhs);
                (l, r)
            } else {
                self.diags.error(pos, "invalid comparison operands");
                (lhs, rhs)
            };
            if let (&ExprKind::IntLit(a), &ExprKind::IntLit(b)) = (&lhs.kind, &rhs.kind) {
                let unsigned = self.types.is_unsigned(lhs.ty);
                let v = fold_compare(op, a, b, unsigned);
                let int_ = self.types.int_;
                return self.int_lit(v, int_, pos);
            }
            return Expr {
                kind: ExprKind::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                ty: self.types.int_,
                pos,
            };
        }

        if op == BinaryOp::Comma {
            let ty = rhs.ty;
            return Expr {
                kind: ExprKind::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                ty,
                pos,
            };
        }

        // Plain arithmetic and bitwise operators.
        if !self.types.is_number(lhs.ty) || !self.types.is_number(rhs.ty) {
            self.diags.error(pos, "arithmetic needs numeric operands");
            let int_ = self.types.int_;
            return self.int_lit(0, int_, pos);
        }
        if matches!(op, BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Mod)
            && (self.types.is_flonum(lhs.ty) || self.types.is_flonum(rhs.ty))
        {
            self.diags.error(pos, "operator needs integer operands");
        }
        let (lhs, rhs, ty) = self.usual_arith(lhs, rhs);
        if let (&ExprKind::IntLit(a), &ExprKind::IntLit(b)) = (&lhs.kind, &rhs.kind) {
            if let Some(v) = self.fold_int(op, ty, a, b) {
                return self.int_lit(v, ty, pos);
            }
        }
        if let (&ExprKind::FloLit(a), &ExprKind::FloLit(b)) = (&lhs.kind, &rhs.kind) {
            if let Some(v) = fold_float(op, a, b) {
                return Expr { kind: ExprKind::FloLit(v), ty, pos };
            }
        }
        Expr { kind: ExprKind::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty, pos }
    }

    fn fold_int(&self, op: BinaryOp, ty: TypeRef, a: i64, b: i64) -> Option<i64> {
        let unsigned = self.types.is_unsigned(ty);
        let v = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return None;
                }
                if unsigned {
                    ((a as u64) / (b as u64)) as i64
                } else {
                    a.wrapping_div(b)
                }
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return None;
                }
                if unsigned {
                    ((a as u64) % (b as u64)) as i64
                } else {
                    a.wrapping_rem(b)
                }
            }
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            _ => return None,
        };
        Some(self.wrap_to(ty, v))
    }

    fn fold_shift(&self, op: BinaryOp, ty: TypeRef, a: i64, b: i64) -> Option<i64> {
        if b < 0 || b >= 64 {
            return None;
        }
        let unsigned = self.types.is_unsigned(ty);
        let v = match op {
            BinaryOp::LShift => a.wrapping_shl(b as u32),
            BinaryOp::RShift => {
                if unsigned {
                    let (kind, _) = self.types.fixnum_of(ty)?;
                    let bits = kind.size() * 8;
                    let mask = if bits >= 64 { !0u64 } else { (1u64 << bits) - 1 };
                    (((a as u64) & mask) >> b as u32) as i64
                } else {
                    a.wrapping_shr(b as u32)
                }
            }
            _ => return None,
        };
        Some(self.wrap_to(ty, v))
    }
}

fn fold_compare(op: BinaryOp, a: i64, b: i64, unsigned: bool) -> i64 {
    let r = if unsigned {
        let (a, b) = (a as u64, b as u64);
        match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!(),
        }
    } else {
        match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!(),
        }
    };
    r as i64
}

fn fold_float(op: BinaryOp, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => return None,
    })
}

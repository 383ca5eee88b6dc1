//! Initializer parsing and flattening.
//!
//! The raw grammar allows positional elements, designated elements
//! (`.name = x`, `[i] = x`), nested braces and brace elision. Flattening
//! rewrites all of that into the canonical form: a `Multi` whose positions
//! correspond one-to-one with array elements or struct members, `None`
//! marking zero-initialized holes, and every scalar leaf already converted
//! to its target type. Flattening a canonical initializer again is a
//! no-op, which keeps re-entrant uses (compound literals inside
//! initializers) simple.

use crate::ast::{BinaryOp, Expr, ExprKind, Initializer, Stmt, StmtKind};
use crate::diag::Pos;
use crate::lexer::TokenKind;
use crate::parser::Parser;
use crate::types::{Type, TypeRef};
use std::collections::VecDeque;

impl<'a> Parser<'a> {
    /// Parse a raw initializer (after `=` or inside braces).
    pub(crate) fn parse_initializer(&mut self) -> Initializer {
        if !self.eat(TokenKind::LBrace) {
            return Initializer::Single(Box::new(self.assign_expr()));
        }
        let mut elems: Vec<Option<Initializer>> = Vec::new();
        loop {
            if self.eat(TokenKind::RBrace) {
                break;
            }
            let elem = if self.eat(TokenKind::Dot) {
                let tok = self.next();
                let name = match tok.kind {
                    TokenKind::Ident(name) => name,
                    _ => {
                        self.diags.error(tok.pos, "member name expected after `.`");
                        String::new()
                    }
                };
                self.expect(TokenKind::Assign, "`=` after designator");
                Initializer::Dot(name, Box::new(self.parse_initializer()))
            } else if self.eat(TokenKind::LBracket) {
                let index = self.const_expr();
                self.expect(TokenKind::RBracket, "`]` after designator index");
                self.expect(TokenKind::Assign, "`=` after designator");
                Initializer::Arr(index, Box::new(self.parse_initializer()))
            } else {
                self.parse_initializer()
            };
            elems.push(Some(elem));
            if self.eat(TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RBrace, "`}` after initializer");
            break;
        }
        Initializer::Multi(elems)
    }

    /// Number of scalar slots `ty` holds, for brace elision.
    fn scalar_slots(&mut self, ty: TypeRef) -> usize {
        match self.types.get(ty).clone() {
            Type::Array { inner, len } => {
                self.scalar_slots(inner) * len.unwrap_or(0) as usize
            }
            Type::Struct { info } => {
                let members: Vec<TypeRef> =
                    self.types.struct_info(info).members.iter().map(|m| m.ty).collect();
                if self.types.struct_info(info).is_union {
                    members.first().map_or(0, |&m| self.scalar_slots(m))
                } else {
                    members.into_iter().map(|m| self.scalar_slots(m)).sum()
                }
            }
            _ => 1,
        }
    }

    fn is_aggregate(&self, ty: TypeRef) -> bool {
        self.types.is_array(ty) || self.types.is_struct(ty)
    }

    /// Flatten `init` against `ty`. An unsized array type is completed in
    /// place (hence `&mut TypeRef` — the handle itself is unchanged, its
    /// length is filled in).
    pub(crate) fn flatten_initializer(
        &mut self,
        ty: &mut TypeRef,
        init: Initializer,
        pos: Pos,
    ) -> Initializer {
        match self.types.get(*ty).clone() {
            Type::Array { inner, len } => self.flatten_array(*ty, inner, len, init, pos),
            Type::Struct { info } => {
                let members: Vec<(String, TypeRef)> = self
                    .types
                    .struct_info(info)
                    .members
                    .iter()
                    .map(|m| (m.name.clone(), m.ty))
                    .collect();
                let is_union = self.types.struct_info(info).is_union;
                self.flatten_struct(*ty, &members, is_union, init, pos)
            }
            _ => self.flatten_scalar(*ty, init, pos),
        }
    }

    fn flatten_scalar(&mut self, ty: TypeRef, init: Initializer, pos: Pos) -> Initializer {
        match init {
            Initializer::Single(e) => {
                let e = self.assign_convert(ty, *e, pos);
                Initializer::Single(Box::new(e))
            }
            Initializer::Multi(mut elems) => {
                if elems.len() != 1 {
                    self.diags.error(pos, "too many initializers for a scalar");
                }
                match elems.pop().flatten() {
                    Some(inner) => self.flatten_scalar(ty, inner, pos),
                    None => Initializer::Single(Box::new(self.int_lit(0, ty, pos))),
                }
            }
            Initializer::Dot(..) | Initializer::Arr(..) => {
                self.diags.error(pos, "designator on a scalar initializer");
                Initializer::Single(Box::new(self.int_lit(0, ty, pos)))
            }
        }
    }

    fn string_elements(&mut self, bytes: &[u8], pos: Pos) -> Vec<Option<Initializer>> {
        let char_ = self.types.char_;
        bytes
            .iter()
            .cloned()
            .chain(std::iter::once(0))
            .map(|b| {
                Some(Initializer::Single(Box::new(self.int_lit(i64::from(b as i8), char_, pos))))
            })
            .collect()
    }

    fn flatten_array(
        &mut self,
        ty: TypeRef,
        inner: TypeRef,
        len: Option<u32>,
        init: Initializer,
        pos: Pos,
    ) -> Initializer {
        let elems = match init {
            // A string literal initializes an array of char element-wise.
            Initializer::Single(e) => match e.kind {
                ExprKind::StrLit(ref bytes) if self.types.same(inner, self.types.char_) => {
                    self.string_elements(bytes, pos)
                }
                _ => {
                    self.diags.error(pos, "invalid initializer for an array");
                    Vec::new()
                }
            },
            Initializer::Multi(elems) => elems,
            Initializer::Dot(..) | Initializer::Arr(..) => {
                self.diags.error(pos, "misplaced designator");
                Vec::new()
            }
        };

        let mut queue: VecDeque<Option<Initializer>> = elems.into();
        let mut out: Vec<Option<Initializer>> = Vec::new();
        let mut dst = 0usize;
        while let Some(item) = queue.pop_front() {
            match item {
                None => dst += 1,
                Some(Initializer::Arr(index, sub)) => {
                    if index < 0 {
                        self.diags.error(pos, "negative array designator");
                        continue;
                    }
                    dst = index as usize;
                    let flat = {
                        let mut ity = inner;
                        self.flatten_initializer(&mut ity, *sub, pos)
                    };
                    put(&mut out, dst, flat);
                    dst += 1;
                }
                Some(Initializer::Dot(..)) => {
                    self.diags.error(pos, "member designator in an array initializer");
                }
                Some(item) => {
                    let flat = self.flatten_element(inner, item, &mut queue, pos);
                    put(&mut out, dst, flat);
                    dst += 1;
                }
            }
        }

        match len {
            Some(len) => {
                if out.len() > len as usize {
                    self.diags.error(pos, "excess elements in array initializer");
                    out.truncate(len as usize);
                }
                out.resize_with(len as usize, || None);
            }
            None => {
                let inferred = out.len() as u32;
                self.types.set_array_len(ty, inferred);
            }
        }
        Initializer::Multi(out)
    }

    fn flatten_struct(
        &mut self,
        _ty: TypeRef,
        members: &[(String, TypeRef)],
        is_union: bool,
        init: Initializer,
        pos: Pos,
    ) -> Initializer {
        let elems = match init {
            Initializer::Single(e) => {
                // Whole-struct copy from a same-typed expression.
                return Initializer::Single(e);
            }
            Initializer::Multi(elems) => elems,
            Initializer::Dot(..) | Initializer::Arr(..) => {
                self.diags.error(pos, "misplaced designator");
                Vec::new()
            }
        };

        let mut queue: VecDeque<Option<Initializer>> = elems.into();
        let mut out: Vec<Option<Initializer>> = vec![];
        out.resize_with(members.len(), || None);
        let mut dst = 0usize;
        while let Some(item) = queue.pop_front() {
            match item {
                None => dst += 1,
                Some(Initializer::Dot(name, sub)) => {
                    match members.iter().position(|(n, _)| *n == name) {
                        Some(index) => {
                            dst = index;
                            let flat = {
                                let mut mty = members[index].1;
                                self.flatten_initializer(&mut mty, *sub, pos)
                            };
                            put(&mut out, dst, flat);
                            dst += 1;
                        }
                        None => {
                            self.diags
                                .error(pos, format!("`{}` is not a member of the struct", name));
                        }
                    }
                }
                Some(Initializer::Arr(..)) => {
                    self.diags.error(pos, "array designator in a struct initializer");
                }
                Some(item) => {
                    if dst >= members.len() {
                        self.diags.error(pos, "excess elements in struct initializer");
                        break;
                    }
                    let mty = members[dst].1;
                    let flat = self.flatten_element(mty, item, &mut queue, pos);
                    put(&mut out, dst, flat);
                    dst += 1;
                    if is_union {
                        // Only one member of a union is initialized.
                        break;
                    }
                }
            }
        }
        out.resize_with(members.len(), || None);
        Initializer::Multi(out)
    }

    /// Flatten one element, applying brace elision: a bare scalar filling
    /// an aggregate slot pulls in following scalars until the slot's shape
    /// is full.
    fn flatten_element(
        &mut self,
        ty: TypeRef,
        item: Initializer,
        queue: &mut VecDeque<Option<Initializer>>,
        pos: Pos,
    ) -> Initializer {
        let braced_or_scalar = match &item {
            Initializer::Multi(_) => true,
            Initializer::Single(e) => {
                // A string or same-typed expression fills an aggregate slot
                // by itself.
                !self.is_aggregate(ty)
                    || matches!(e.kind, ExprKind::StrLit(_))
                    || self.types.same(ty, e.ty)
            }
            _ => true,
        };
        if braced_or_scalar {
            let mut t = ty;
            return self.flatten_initializer(&mut t, item, pos);
        }

        // Brace elision: gather scalars for every slot of the aggregate.
        let want = self.scalar_slots(ty);
        let mut gathered: Vec<Option<Initializer>> = vec![Some(item)];
        while gathered.len() < want {
            match queue.front() {
                Some(Some(Initializer::Single(_))) | Some(None) => {
                    gathered.push(queue.pop_front().unwrap());
                }
                _ => break,
            }
        }
        let mut t = ty;
        self.flatten_initializer(&mut t, Initializer::Multi(gathered), pos)
    }

    // --- local initialization statements --------------------------------

    /// Emit the assignments that initialize `target` (a local lvalue of
    /// type `ty`) from a flattened initializer.
    pub(crate) fn init_assign_stmts(
        &mut self,
        target: Expr,
        ty: TypeRef,
        init: &Initializer,
        out: &mut Vec<Stmt>,
    ) {
        let pos = target.pos;
        match self.types.get(ty).clone() {
            Type::Array { inner, len } => match init {
                Initializer::Multi(elems) => {
                    let n = len.unwrap_or(elems.len() as u32);
                    for i in 0..n as usize {
                        let elem = self.element_lvalue(target.clone(), inner, i as i64, pos);
                        match elems.get(i).map(Option::as_ref).flatten() {
                            Some(sub) => self.init_assign_stmts(elem, inner, sub, out),
                            None => self.zero_init_stmts(elem, inner, out),
                        }
                    }
                }
                _ => self.diags.error(pos, "invalid array initializer"),
            },
            Type::Struct { info } => match init {
                Initializer::Single(e) => {
                    // Struct copy.
                    let assign = self.make_assign(target, (**e).clone(), pos);
                    out.push(Stmt { kind: StmtKind::Expr(assign), pos });
                }
                Initializer::Multi(elems) => {
                    let members: Vec<(String, TypeRef)> = self
                        .types
                        .struct_info(info)
                        .members
                        .iter()
                        .map(|m| (m.name.clone(), m.ty))
                        .collect();
                    let is_union = self.types.struct_info(info).is_union;
                    for (i, (name, mty)) in members.iter().enumerate() {
                        let member = Expr {
                            kind: ExprKind::Member {
                                base: Box::new(target.clone()),
                                name: name.clone(),
                                index: i,
                            },
                            ty: *mty,
                            pos,
                        };
                        match elems.get(i).map(Option::as_ref).flatten() {
                            Some(sub) => self.init_assign_stmts(member, *mty, sub, out),
                            None if !is_union => self.zero_init_stmts(member, *mty, out),
                            None => {}
                        }
                    }
                }
                _ => self.diags.error(pos, "invalid struct initializer"),
            },
            _ => match init {
                Initializer::Single(e) => {
                    let assign = self.make_assign(target, (**e).clone(), pos);
                    out.push(Stmt { kind: StmtKind::Expr(assign), pos });
                }
                _ => self.diags.error(pos, "invalid scalar initializer"),
            },
        }
    }

    fn element_lvalue(&mut self, target: Expr, inner: TypeRef, index: i64, pos: Pos) -> Expr {
        let base = self.decay(target);
        let ty = base.ty;
        let idx = {
            let int_ = self.types.int_;
            self.int_lit(index, int_, pos)
        };
        let sum = Expr {
            kind: ExprKind::Bin {
                op: BinaryOp::PtrAdd,
                lhs: Box::new(base),
                rhs: Box::new(idx),
            },
            ty,
            pos,
        };
        Expr { kind: ExprKind::Deref(Box::new(sum)), ty: inner, pos }
    }

    fn zero_init_stmts(&mut self, target: Expr, ty: TypeRef, out: &mut Vec<Stmt>) {
        let pos = target.pos;
        match self.types.get(ty).clone() {
            Type::Array { inner, len } => {
                for i in 0..len.unwrap_or(0) as usize {
                    let elem = self.element_lvalue(target.clone(), inner, i as i64, pos);
                    self.zero_init_stmts(elem, inner, out);
                }
            }
            Type::Struct { info } => {
                let members: Vec<(String, TypeRef)> = self
                    .types
                    .struct_info(info)
                    .members
                    .iter()
                    .map(|m| (m.name.clone(), m.ty))
                    .collect();
                let is_union = self.types.struct_info(info).is_union;
                for (i, (name, mty)) in members.iter().enumerate() {
                    if is_union && i > 0 {
                        break;
                    }
                    let member = Expr {
                        kind: ExprKind::Member {
                            base: Box::new(target.clone()),
                            name: name.clone(),
                            index: i,
                        },
                        ty: *mty,
                        pos,
                    };
                    self.zero_init_stmts(member, *mty, out);
                }
            }
            _ => {
                let zero = {
                    let int_ = self.types.int_;
                    self.int_lit(0, int_, pos)
                };
                let assign = self.make_assign(target, zero, pos);
                out.push(Stmt { kind: StmtKind::Expr(assign), pos });
            }
        }
    }
}

fn put(out: &mut Vec<Option<Initializer>>, index: usize, value: Initializer) {
    if out.len() <= index {
        out.resize_with(index + 1, || None);
    }
    out[index] = Some(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::scope::Scopes;
    use crate::types::Types;

    struct Fixture {
        types: Types,
        scopes: Scopes,
        diags: Diagnostics,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                types: Types::new(),
                scopes: Scopes::new(),
                diags: Diagnostics::new("test.c"),
            }
        }

        fn flatten(&mut self, decl: &str) -> (Initializer, TypeRef) {
            // Parse `T name = init;`-shaped source and return the flattened
            // initializer stored for the global.
            let mut parser = Parser::new(
                decl,
                &mut self.types,
                &mut self.scopes,
                &mut self.diags,
                false,
            );
            let decls = parser.parse();
            assert!(self.diags.is_ok(), "diagnostics:\n{}", self.diags);
            match decls.last().expect("no declaration") {
                crate::ast::Declaration::Global(var) => {
                    let info = &self.scopes.vars[*var];
                    (info.init.clone().expect("no initializer"), info.ty)
                }
                _ => panic!("expected a global"),
            }
        }
    }

    fn literal(init: &Option<Initializer>) -> i64 {
        match init {
            Some(Initializer::Single(e)) => match e.kind {
                ExprKind::IntLit(v) => v,
                _ => panic!("not an integer literal: {:?}", e.kind),
            },
            other => panic!("not a single: {:?}", other),
        }
    }

    #[test]
    fn designated_initializers_land_on_their_indices() {
        let mut fx = Fixture::new();
        let (init, _) = fx.flatten("int a[5] = {[4] = 9, [1] = 2};");
        match init {
            Initializer::Multi(elems) => {
                assert_eq!(elems.len(), 5);
                assert!(elems[0].is_none());
                assert_eq!(literal(&elems[1]), 2);
                assert!(elems[2].is_none());
                assert!(elems[3].is_none());
                assert_eq!(literal(&elems[4]), 9);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn designator_resumes_positionally() {
        let mut fx = Fixture::new();
        let (init, _) = fx.flatten("int a[4] = {[1] = 5, 6};");
        match init {
            Initializer::Multi(elems) => {
                assert_eq!(literal(&elems[1]), 5);
                assert_eq!(literal(&elems[2]), 6);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn unsized_array_length_is_inferred() {
        let mut fx = Fixture::new();
        let (_, ty) = fx.flatten("int a[] = {1, 2, 3};");
        assert_eq!(fx.types.size_of(ty), 12);
    }

    #[test]
    fn string_fills_a_char_array_with_nul() {
        let mut fx = Fixture::new();
        let (init, ty) = fx.flatten("char s[] = \"ab\";");
        assert_eq!(fx.types.size_of(ty), 3);
        match init {
            Initializer::Multi(elems) => {
                assert_eq!(literal(&elems[0]), i64::from(b'a'));
                assert_eq!(literal(&elems[1]), i64::from(b'b'));
                assert_eq!(literal(&elems[2]), 0);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn dotted_designators_pick_members() {
        let mut fx = Fixture::new();
        let (init, _) =
            fx.flatten("struct P { int x; int y; }; struct P p = {.y = 4, .x = 3};");
        match init {
            Initializer::Multi(elems) => {
                assert_eq!(literal(&elems[0]), 3);
                assert_eq!(literal(&elems[1]), 4);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn brace_elision_fills_nested_aggregates() {
        let mut fx = Fixture::new();
        let (init, _) = fx.flatten("int m[2][2] = {1, 2, 3, 4};");
        match init {
            Initializer::Multi(rows) => {
                assert_eq!(rows.len(), 2);
                for (r, want) in rows.iter().zip(&[[1i64, 2], [3, 4]]) {
                    match r {
                        Some(Initializer::Multi(cols)) => {
                            assert_eq!(literal(&cols[0]), want[0]);
                            assert_eq!(literal(&cols[1]), want[1]);
                        }
                        other => panic!("{:?}", other),
                    }
                }
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn flattening_is_idempotent() {
        let mut fx = Fixture::new();
        let (flat, mut ty) =
            fx.flatten("int a[5] = {[4] = 9, [1] = 2};");
        let mut parser = Parser::new(
            "",
            &mut fx.types,
            &mut fx.scopes,
            &mut fx.diags,
            false,
        );
        let again = parser.flatten_initializer(
            &mut ty,
            flat.clone(),
            crate::diag::Pos::new(1, 1),
        );
        assert_eq!(format!("{:?}", flat), format!("{:?}", again));
        assert!(fx.diags.is_ok());
    }
}

//! Recursive-descent parser for the supported C subset.
//!
//! Declarations, statements and the declarator machinery live here; the
//! expression grammar (with type coercion and constant folding) is in
//! `expr`, and initializer flattening in `init`.
//!
//! Error recovery: every diagnostic is pushed into the shared sink, then
//! the parser resynchronizes at the next `;` or `}` at brace depth zero,
//! so a single run reports every problem it can find.

use crate::ast::{Declaration, Defun, Expr, ExprKind, Stmt, StmtKind};
use crate::diag::{Diagnostics, Pos};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::scope::{ScopeRef, Scopes, Storage, VarFlags, VarInfo, VarRef};
use crate::types::{FixnumKind, StructRef, Type, TypeRef, Types};

mod expr;
mod init;

/// Per-`switch` parse state: labels in source order (`None` = default).
struct SwitchCtx {
    cases: Vec<Option<i64>>,
}

/// The parser.
pub struct Parser<'a> {
    pub(crate) lexer: Lexer,
    pub(crate) types: &'a mut Types,
    pub(crate) scopes: &'a mut Scopes,
    pub(crate) diags: &'a mut Diagnostics,
    pub(crate) cur_scope: ScopeRef,
    cur_fn_scopes: Vec<ScopeRef>,
    switch_stack: Vec<SwitchCtx>,
    loop_depth: u32,
    /// Block-scope statics and compound-literal backing variables that the
    /// lowering pass must emit as module data.
    pub statics: Vec<VarRef>,
    static_no: u32,
    pub(crate) complit_count: u32,
    pub(crate) no_flonum: bool,
}

/// What one parsed declarator contributes, applied innermost-first over the
/// base type.
enum DeclPart {
    Ptr,
    Array(Option<u32>),
    Func(Vec<(Option<String>, TypeRef)>, bool),
}

impl<'a> Parser<'a> {
    /// Create a parser over `source`.
    pub fn new(
        source: &str,
        types: &'a mut Types,
        scopes: &'a mut Scopes,
        diags: &'a mut Diagnostics,
        no_flonum: bool,
    ) -> Self {
        let global = scopes.global();
        Self {
            lexer: Lexer::new(source, no_flonum),
            types,
            scopes,
            diags,
            cur_scope: global,
            cur_fn_scopes: Vec::new(),
            switch_stack: Vec::new(),
            loop_depth: 0,
            statics: Vec::new(),
            static_no: 0,
            complit_count: 0,
            no_flonum,
        }
    }

    // --- token plumbing -------------------------------------------------

    pub(crate) fn next(&mut self) -> Token {
        loop {
            match self.lexer.next_token() {
                Ok(tok) => return tok,
                Err(e) => self.diags.error(e.pos, e.message),
            }
        }
    }

    pub(crate) fn peek(&mut self) -> Token {
        let tok = self.next();
        self.lexer.unget(tok.clone());
        tok
    }

    pub(crate) fn eat(&mut self, kind: TokenKind) -> bool {
        let tok = self.next();
        if tok.kind == kind {
            true
        } else {
            self.lexer.unget(tok);
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        let tok = self.next();
        if tok.kind == kind {
            true
        } else {
            self.diags.error(tok.pos, format!("expected {}", what));
            self.lexer.unget(tok);
            false
        }
    }

    /// Skip ahead to the next statement boundary.
    fn resync(&mut self) {
        let mut depth = 0u32;
        loop {
            let tok = self.next();
            match tok.kind {
                TokenKind::Eof => return,
                TokenKind::Semicolon if depth == 0 => return,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    if depth == 0 {
                        self.lexer.unget(tok);
                        return;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    fn is_typedef_name(&self, name: &str) -> bool {
        match self.scopes.find(self.cur_scope, name) {
            Some((var, _)) => matches!(self.scopes.vars[var].storage, Storage::Typedef),
            None => false,
        }
    }

    pub(crate) fn is_type_start(&self, tok: &Token) -> bool {
        match &tok.kind {
            TokenKind::KwVoid
            | TokenKind::KwChar
            | TokenKind::KwShort
            | TokenKind::KwInt
            | TokenKind::KwLong
            | TokenKind::KwUnsigned
            | TokenKind::KwSigned
            | TokenKind::KwFloat
            | TokenKind::KwDouble
            | TokenKind::KwStruct
            | TokenKind::KwUnion
            | TokenKind::KwEnum
            | TokenKind::KwConst
            | TokenKind::KwVolatile
            | TokenKind::KwStatic
            | TokenKind::KwExtern
            | TokenKind::KwTypedef => true,
            TokenKind::Ident(name) => self.is_typedef_name(name),
            _ => false,
        }
    }

    // --- top level ------------------------------------------------------

    /// Parse the whole unit.
    pub fn parse(&mut self) -> Vec<Declaration> {
        let mut decls = Vec::new();
        loop {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }
            if self.peek().kind == TokenKind::Eof {
                break;
            }
            self.toplevel(&mut decls);
        }
        decls
    }

    fn toplevel(&mut self, out: &mut Vec<Declaration>) {
        let pos = self.peek().pos;
        let spec = match self.decl_specifiers() {
            Some(spec) => spec,
            None => {
                let tok = self.next();
                self.diags.error(tok.pos, "declaration expected");
                self.resync();
                return;
            }
        };
        if self.eat(TokenKind::Semicolon) {
            return; // bare struct/union/enum definition
        }

        loop {
            let (name, ty, fn_params) = self.declarator(spec.ty);
            let name = match name {
                Some(name) => name,
                None => {
                    self.diags.error(pos, "identifier expected in declaration");
                    self.resync();
                    return;
                }
            };

            if spec.is_typedef {
                let info = VarInfo {
                    name: name.clone(),
                    ty,
                    flags: spec.flags,
                    storage: Storage::Typedef,
                    init: None,
                };
                if let Err(msg) = self.scopes.add(self.scopes.global(), info) {
                    self.diags.error(pos, msg);
                }
            } else if self.types.is_func(ty) {
                let mut flags = spec.flags;
                let defining = self.peek().kind == TokenKind::LBrace;
                if !defining {
                    flags.is_extern = true;
                }
                let info = VarInfo {
                    name: name.clone(),
                    ty,
                    flags,
                    storage: Storage::Global,
                    init: None,
                };
                if let Err(msg) = self.scopes.add(self.scopes.global(), info) {
                    self.diags.error(pos, msg);
                }
                if defining {
                    let defun = self.funcdef(name, ty, spec.flags, fn_params);
                    out.push(Declaration::Defun(Box::new(defun)));
                    return;
                }
            } else {
                self.global_var(name, ty, spec.flags, pos, out);
            }

            if self.eat(TokenKind::Comma) {
                continue;
            }
            if !self.expect(TokenKind::Semicolon, "`;` after declaration") {
                self.resync();
            }
            return;
        }
    }

    fn global_var(
        &mut self,
        name: String,
        mut ty: TypeRef,
        flags: VarFlags,
        pos: Pos,
        out: &mut Vec<Declaration>,
    ) {
        let mut init = None;
        if self.eat(TokenKind::Assign) {
            let raw = self.parse_initializer();
            init = Some(self.flatten_initializer(&mut ty, raw, pos));
        }
        if self.types.is_array(ty) {
            if let Type::Array { len: None, .. } = self.types.get(ty) {
                self.diags.error(pos, format!("array `{}` has unknown size", name));
            }
        }
        let info = VarInfo { name, ty, flags, storage: Storage::Global, init };
        match self.scopes.add(self.scopes.global(), info) {
            Ok(var) => out.push(Declaration::Global(var)),
            Err(msg) => self.diags.error(pos, msg),
        }
    }

    fn funcdef(
        &mut self,
        name: String,
        ty: TypeRef,
        flags: VarFlags,
        fn_params: Option<Vec<(Option<String>, TypeRef)>>,
    ) -> Defun {
        let top_scope = self.scopes.create(self.scopes.global());
        self.cur_scope = top_scope;
        self.cur_fn_scopes = vec![top_scope];

        let mut params = Vec::new();
        for (pname, pty) in fn_params.unwrap_or_default() {
            let pos = self.peek().pos;
            let pname = match pname {
                Some(n) => n,
                None => {
                    self.diags.error(pos, "parameter name omitted");
                    continue;
                }
            };
            let info = VarInfo {
                name: pname,
                ty: pty,
                flags: VarFlags::default(),
                storage: Storage::Local { vreg: None },
                init: None,
            };
            match self.scopes.add(top_scope, info) {
                Ok(var) => params.push(var),
                Err(msg) => self.diags.error(pos, msg),
            }
        }

        self.expect(TokenKind::LBrace, "`{` to start function body");
        let mut body = Vec::new();
        loop {
            if self.eat(TokenKind::RBrace) {
                break;
            }
            if self.peek().kind == TokenKind::Eof {
                let pos = self.peek().pos;
                self.diags.error(pos, "unexpected end of file in function body");
                break;
            }
            let stmt = self.stmt();
            body.push(stmt);
        }

        self.cur_scope = self.scopes.global();
        Defun {
            name,
            ty,
            flags,
            params,
            top_scope,
            body: Some(body),
            all_scopes: std::mem::replace(&mut self.cur_fn_scopes, Vec::new()),
        }
    }

    // --- declaration specifiers ----------------------------------------

    pub(crate) fn decl_specifiers(&mut self) -> Option<DeclSpec> {
        let mut flags = VarFlags::default();
        let mut is_typedef = false;
        let mut base: Option<TypeRef> = None;
        let mut kind: Option<FixnumKind> = None;
        let mut unsigned: Option<bool> = None;
        let mut seen = false;

        loop {
            let tok = self.next();
            match tok.kind {
                TokenKind::KwTypedef => is_typedef = true,
                TokenKind::KwStatic => flags.is_static = true,
                TokenKind::KwExtern => flags.is_extern = true,
                TokenKind::KwConst => flags.is_const = true,
                TokenKind::KwVolatile => {}
                TokenKind::KwVoid => base = Some(self.types.void_),
                TokenKind::KwFloat | TokenKind::KwDouble => {
                    if self.no_flonum {
                        self.diags.error(tok.pos, "floating-point types are disabled");
                        base = Some(self.types.int_);
                    } else {
                        base = Some(if tok.kind == TokenKind::KwDouble {
                            self.types.double_
                        } else {
                            self.types.float_
                        });
                    }
                }
                TokenKind::KwChar => kind = Some(FixnumKind::Char),
                TokenKind::KwShort => kind = Some(FixnumKind::Short),
                TokenKind::KwInt => {
                    if kind.is_none() {
                        kind = Some(FixnumKind::Int);
                    }
                }
                TokenKind::KwLong => kind = Some(FixnumKind::Long),
                TokenKind::KwUnsigned => unsigned = Some(true),
                TokenKind::KwSigned => unsigned = Some(false),
                TokenKind::KwStruct => base = Some(self.struct_spec(false)),
                TokenKind::KwUnion => base = Some(self.struct_spec(true)),
                TokenKind::KwEnum => base = Some(self.enum_spec()),
                TokenKind::Ident(ref name)
                    if base.is_none()
                        && kind.is_none()
                        && unsigned.is_none()
                        && self.is_typedef_name(name) =>
                {
                    let (var, _) = self.scopes.find(self.cur_scope, name).unwrap();
                    base = Some(self.scopes.vars[var].ty);
                }
                _ => {
                    self.lexer.unget(tok);
                    break;
                }
            }
            seen = true;
        }

        if !seen {
            return None;
        }
        let ty = match (base, kind, unsigned) {
            (Some(b), None, None) => b,
            (None, k, u) => self.types.fixnum(k.unwrap_or(FixnumKind::Int), u.unwrap_or(false)),
            (Some(_), _, _) => {
                let pos = self.peek().pos;
                self.diags.error(pos, "conflicting type specifiers");
                self.types.int_
            }
        };
        Some(DeclSpec { ty, flags, is_typedef })
    }

    fn struct_spec(&mut self, is_union: bool) -> TypeRef {
        let tag = match self.peek().kind {
            TokenKind::Ident(_) => match self.next().kind {
                TokenKind::Ident(name) => Some(name),
                _ => unreachable!(),
            },
            _ => None,
        };

        if self.eat(TokenKind::LBrace) {
            // Definition: reuse a forward-declared tag in this scope.
            let (ty, info) = match tag
                .as_ref()
                .and_then(|t| self.scopes.find_tag_here(self.cur_scope, t))
            {
                Some(prev) if self.reusable_struct(prev, is_union) => {
                    let info = self.struct_ref_of(prev).unwrap();
                    (prev, info)
                }
                _ => {
                    let (ty, info) = self.types.new_struct(is_union);
                    if let Some(tag) = &tag {
                        self.scopes.add_tag(self.cur_scope, tag, ty);
                    }
                    (ty, info)
                }
            };
            self.struct_members(info);
            ty
        } else {
            match tag {
                Some(tag) => match self.scopes.find_tag(self.cur_scope, &tag) {
                    Some(ty) => ty,
                    None => {
                        let (ty, _) = self.types.new_struct(is_union);
                        self.scopes.add_tag(self.cur_scope, &tag, ty);
                        ty
                    }
                },
                None => {
                    let pos = self.peek().pos;
                    self.diags.error(pos, "struct tag or body expected");
                    self.types.int_
                }
            }
        }
    }

    fn reusable_struct(&self, ty: TypeRef, is_union: bool) -> bool {
        match self.struct_ref_of(ty) {
            Some(info) => {
                let si = self.types.struct_info(info);
                si.is_union == is_union && si.size < 0 && si.members.is_empty()
            }
            None => false,
        }
    }

    pub(crate) fn struct_ref_of(&self, ty: TypeRef) -> Option<StructRef> {
        match *self.types.get(ty) {
            Type::Struct { info } => Some(info),
            _ => None,
        }
    }

    fn struct_members(&mut self, info: StructRef) {
        loop {
            if self.eat(TokenKind::RBrace) {
                break;
            }
            if self.peek().kind == TokenKind::Eof {
                let pos = self.peek().pos;
                self.diags.error(pos, "unexpected end of file in struct body");
                break;
            }
            let pos = self.peek().pos;
            let spec = match self.decl_specifiers() {
                Some(spec) => spec,
                None => {
                    let tok = self.next();
                    self.diags.error(tok.pos, "member declaration expected");
                    self.resync();
                    continue;
                }
            };
            loop {
                let (name, ty, _) = self.declarator(spec.ty);
                match name {
                    Some(name) => {
                        let members = &mut self.types.struct_info_mut(info).members;
                        if members.iter().any(|m| m.name == name) {
                            self.diags.error(pos, format!("duplicate member `{}`", name));
                        } else {
                            members.push(crate::types::Member { name, ty, offset: 0 });
                        }
                    }
                    None => self.diags.error(pos, "member name expected"),
                }
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::Semicolon, "`;` after member");
        }
    }

    fn enum_spec(&mut self) -> TypeRef {
        let tag = match self.peek().kind {
            TokenKind::Ident(_) => match self.next().kind {
                TokenKind::Ident(name) => Some(name),
                _ => unreachable!(),
            },
            _ => None,
        };

        let ty = match tag.as_ref().and_then(|t| self.scopes.find_tag(self.cur_scope, t)) {
            Some(prev) => prev,
            None => {
                let ty = self.types.new_enum();
                if let Some(tag) = &tag {
                    self.scopes.add_tag(self.cur_scope, tag, ty);
                }
                ty
            }
        };

        if self.eat(TokenKind::LBrace) {
            let mut value = 0i64;
            loop {
                if self.eat(TokenKind::RBrace) {
                    break;
                }
                let tok = self.next();
                let name = match tok.kind {
                    TokenKind::Ident(name) => name,
                    _ => {
                        self.diags.error(tok.pos, "enumerator name expected");
                        self.resync();
                        break;
                    }
                };
                if self.eat(TokenKind::Assign) {
                    value = self.const_expr();
                }
                let info = VarInfo {
                    name,
                    ty,
                    flags: VarFlags { is_const: true, ..VarFlags::default() },
                    storage: Storage::EnumConst { value },
                    init: None,
                };
                if let Err(msg) = self.scopes.add(self.cur_scope, info) {
                    self.diags.error(tok.pos, msg);
                }
                value += 1;
                if !self.eat(TokenKind::Comma) {
                    self.expect(TokenKind::RBrace, "`}` after enumerators");
                    break;
                }
            }
        }
        ty
    }

    // --- declarators ----------------------------------------------------

    /// Parse a declarator against `base`, returning the declared name (if
    /// any), the resulting type, and the named parameter list when the
    /// outermost derivation is a function.
    pub(crate) fn declarator(
        &mut self,
        base: TypeRef,
    ) -> (Option<String>, TypeRef, Option<Vec<(Option<String>, TypeRef)>>) {
        let (name, parts) = self.declarator_parts();
        let mut ty = base;
        let mut fn_params = None;
        for part in &parts {
            match part {
                DeclPart::Ptr => ty = self.types.ptr_to(ty),
                DeclPart::Array(len) => ty = self.types.array_of(ty, *len),
                DeclPart::Func(params, vaargs) => {
                    let ptypes = params.iter().map(|(_, t)| *t).collect();
                    ty = self.types.func_of(ty, ptypes, *vaargs);
                    fn_params = Some(params.clone());
                }
            }
        }
        // Only a parameter list on the outermost derivation names the
        // function's own parameters.
        if !matches!(parts.last(), Some(DeclPart::Func(..))) {
            fn_params = None;
        }
        (name, ty, fn_params)
    }

    fn declarator_parts(&mut self) -> (Option<String>, Vec<DeclPart>) {
        let mut ptrs = 0usize;
        while self.eat(TokenKind::Star) {
            while self.eat(TokenKind::KwConst) || self.eat(TokenKind::KwVolatile) {}
            ptrs += 1;
        }

        let (name, inner) = {
            let tok = self.next();
            match tok.kind {
                TokenKind::Ident(name) => (Some(name), Vec::new()),
                TokenKind::LParen => {
                    let after = self.peek();
                    let nested = !(self.is_type_start(&after)
                        || after.kind == TokenKind::RParen);
                    if nested {
                        let (name, parts) = self.declarator_parts();
                        self.expect(TokenKind::RParen, "`)` after declarator");
                        (name, parts)
                    } else {
                        // Abstract function declarator: hand the `(` back.
                        self.lexer.unget(tok);
                        (None, Vec::new())
                    }
                }
                _ => {
                    self.lexer.unget(tok);
                    (None, Vec::new())
                }
            }
        };

        let mut suffixes = Vec::new();
        loop {
            if self.eat(TokenKind::LBracket) {
                let len = if self.eat(TokenKind::RBracket) {
                    None
                } else {
                    let n = self.const_expr();
                    self.expect(TokenKind::RBracket, "`]` after array size");
                    if n < 0 {
                        let pos = self.peek().pos;
                        self.diags.error(pos, "negative array size");
                        Some(0)
                    } else {
                        Some(n as u32)
                    }
                };
                suffixes.push(DeclPart::Array(len));
            } else if self.eat(TokenKind::LParen) {
                let (params, vaargs) = self.param_list();
                suffixes.push(DeclPart::Func(params, vaargs));
            } else {
                break;
            }
        }

        let mut parts = Vec::with_capacity(ptrs + suffixes.len() + inner.len());
        for _ in 0..ptrs {
            parts.push(DeclPart::Ptr);
        }
        parts.extend(suffixes);
        parts.extend(inner);
        (name, parts)
    }

    fn param_list(&mut self) -> (Vec<(Option<String>, TypeRef)>, bool) {
        if self.eat(TokenKind::RParen) {
            return (Vec::new(), true); // unspecified parameters
        }
        {
            let tok = self.next();
            if tok.kind == TokenKind::KwVoid && self.peek().kind == TokenKind::RParen {
                self.next();
                return (Vec::new(), false);
            }
            self.lexer.unget(tok);
        }

        let mut params = Vec::new();
        let mut vaargs = false;
        loop {
            if self.eat(TokenKind::Ellipsis) {
                vaargs = true;
                self.expect(TokenKind::RParen, "`)` after `...`");
                break;
            }
            let pos = self.peek().pos;
            let spec = match self.decl_specifiers() {
                Some(spec) => spec,
                None => {
                    self.diags.error(pos, "parameter type expected");
                    self.resync();
                    break;
                }
            };
            let (name, mut ty, _) = self.declarator(spec.ty);
            // Arrays and functions decay in parameter position.
            if self.types.is_array(ty) {
                let inner = self.types.elem_of(ty);
                ty = self.types.ptr_to(inner);
            } else if self.types.is_func(ty) {
                ty = self.types.ptr_to(ty);
            }
            params.push((name, ty));
            if self.eat(TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen, "`)` after parameters");
            break;
        }
        (params, vaargs)
    }

    /// Parse a type name (for casts, `sizeof`, compound literals).
    pub(crate) fn type_name(&mut self) -> TypeRef {
        let pos = self.peek().pos;
        let spec = match self.decl_specifiers() {
            Some(spec) => spec,
            None => {
                self.diags.error(pos, "type name expected");
                DeclSpec { ty: self.types.int_, flags: VarFlags::default(), is_typedef: false }
            }
        };
        let (name, ty, _) = self.declarator(spec.ty);
        if name.is_some() {
            self.diags.error(pos, "unexpected identifier in type name");
        }
        ty
    }

    // --- statements -----------------------------------------------------

    fn enter_scope(&mut self) -> ScopeRef {
        let scope = self.scopes.create(self.cur_scope);
        self.cur_scope = scope;
        self.cur_fn_scopes.push(scope);
        scope
    }

    fn leave_scope(&mut self) {
        self.cur_scope = self.scopes.parent(self.cur_scope).expect("left the global scope");
    }

    pub(crate) fn stmt(&mut self) -> Stmt {
        let tok = self.next();
        let pos = tok.pos;
        match tok.kind {
            TokenKind::Semicolon => Stmt { kind: StmtKind::Empty, pos },
            TokenKind::LBrace => {
                self.lexer.unget(tok);
                self.block()
            }
            TokenKind::KwIf => {
                self.expect(TokenKind::LParen, "`(` after `if`");
                let cond = self.expr();
                let cond = self.check_cond(cond);
                self.expect(TokenKind::RParen, "`)` after condition");
                let then = Box::new(self.stmt());
                let els = if self.eat(TokenKind::KwElse) {
                    Some(Box::new(self.stmt()))
                } else {
                    None
                };
                Stmt { kind: StmtKind::If { cond, then, els }, pos }
            }
            TokenKind::KwWhile => {
                self.expect(TokenKind::LParen, "`(` after `while`");
                let cond = self.expr();
                let cond = self.check_cond(cond);
                self.expect(TokenKind::RParen, "`)` after condition");
                self.loop_depth += 1;
                let body = Box::new(self.stmt());
                self.loop_depth -= 1;
                Stmt { kind: StmtKind::While { cond, body }, pos }
            }
            TokenKind::KwDo => {
                self.loop_depth += 1;
                let body = Box::new(self.stmt());
                self.loop_depth -= 1;
                self.expect(TokenKind::KwWhile, "`while` after `do` body");
                self.expect(TokenKind::LParen, "`(` after `while`");
                let cond = self.expr();
                let cond = self.check_cond(cond);
                self.expect(TokenKind::RParen, "`)` after condition");
                self.expect(TokenKind::Semicolon, "`;` after `do`-`while`");
                Stmt { kind: StmtKind::DoWhile { body, cond }, pos }
            }
            TokenKind::KwFor => self.for_stmt(pos),
            TokenKind::KwSwitch => {
                self.expect(TokenKind::LParen, "`(` after `switch`");
                let value = self.expr();
                if !self.types.is_fixnum(value.ty) {
                    self.diags.error(value.pos, "switch selector must be an integer");
                }
                self.expect(TokenKind::RParen, "`)` after selector");
                self.switch_stack.push(SwitchCtx { cases: Vec::new() });
                let body = Box::new(self.stmt());
                let ctx = self.switch_stack.pop().unwrap();
                Stmt { kind: StmtKind::Switch { value, body, cases: ctx.cases }, pos }
            }
            TokenKind::KwCase => {
                let value = self.const_expr();
                self.expect(TokenKind::Colon, "`:` after `case`");
                match self.switch_stack.last_mut() {
                    Some(ctx) => {
                        if ctx.cases.contains(&Some(value)) {
                            self.diags.error(pos, format!("duplicate case value {}", value));
                        } else {
                            ctx.cases.push(Some(value));
                        }
                    }
                    None => self.diags.error(pos, "`case` outside of switch"),
                }
                Stmt { kind: StmtKind::Case(value), pos }
            }
            TokenKind::KwDefault => {
                self.expect(TokenKind::Colon, "`:` after `default`");
                match self.switch_stack.last_mut() {
                    Some(ctx) => {
                        if ctx.cases.contains(&None) {
                            self.diags.error(pos, "duplicate `default` label");
                        }
                        ctx.cases.push(None);
                    }
                    None => self.diags.error(pos, "`default` outside of switch"),
                }
                Stmt { kind: StmtKind::Default, pos }
            }
            TokenKind::KwBreak => {
                if self.loop_depth == 0 && self.switch_stack.is_empty() {
                    self.diags.error(pos, "`break` outside of loop or switch");
                }
                self.expect(TokenKind::Semicolon, "`;` after `break`");
                Stmt { kind: StmtKind::Break, pos }
            }
            TokenKind::KwContinue => {
                if self.loop_depth == 0 {
                    self.diags.error(pos, "`continue` outside of loop");
                }
                self.expect(TokenKind::Semicolon, "`;` after `continue`");
                Stmt { kind: StmtKind::Continue, pos }
            }
            TokenKind::KwReturn => {
                let value = if self.eat(TokenKind::Semicolon) {
                    None
                } else {
                    let e = self.expr();
                    self.expect(TokenKind::Semicolon, "`;` after `return`");
                    Some(e)
                };
                Stmt { kind: StmtKind::Return(value), pos }
            }
            TokenKind::KwGoto => {
                let tok = self.next();
                let name = match tok.kind {
                    TokenKind::Ident(name) => name,
                    _ => {
                        self.diags.error(tok.pos, "label name expected after `goto`");
                        String::new()
                    }
                };
                self.expect(TokenKind::Semicolon, "`;` after `goto`");
                Stmt { kind: StmtKind::Goto(name), pos }
            }
            TokenKind::Ident(ref name) if self.peek().kind == TokenKind::Colon => {
                let name = name.clone();
                self.next(); // the colon
                Stmt { kind: StmtKind::Label(name), pos }
            }
            _ => {
                self.lexer.unget(tok);
                let probe = self.peek();
                if self.is_type_start(&probe) {
                    let mut stmts = Vec::new();
                    self.local_decl(&mut stmts);
                    Stmt { kind: StmtKind::Decl(stmts), pos }
                } else {
                    let e = self.expr();
                    if !self.expect(TokenKind::Semicolon, "`;` after expression") {
                        self.resync();
                    }
                    Stmt { kind: StmtKind::Expr(e), pos }
                }
            }
        }
    }

    fn block(&mut self) -> Stmt {
        let pos = self.peek().pos;
        self.expect(TokenKind::LBrace, "`{`");
        let scope = self.enter_scope();
        let mut stmts = Vec::new();
        loop {
            if self.eat(TokenKind::RBrace) {
                break;
            }
            if self.peek().kind == TokenKind::Eof {
                let pos = self.peek().pos;
                self.diags.error(pos, "unexpected end of file in block");
                break;
            }
            let stmt = self.stmt();
            stmts.push(stmt);
        }
        self.leave_scope();
        Stmt { kind: StmtKind::Block { scope: Some(scope), stmts }, pos }
    }

    fn for_stmt(&mut self, pos: Pos) -> Stmt {
        self.expect(TokenKind::LParen, "`(` after `for`");
        let mut scope = None;
        let probe = self.peek();
        let pre = if self.eat(TokenKind::Semicolon) {
            None
        } else if self.is_type_start(&probe) {
            scope = Some(self.enter_scope());
            let mut stmts = Vec::new();
            self.local_decl(&mut stmts);
            Some(Box::new(Stmt { kind: StmtKind::Decl(stmts), pos }))
        } else {
            let e = self.expr();
            self.expect(TokenKind::Semicolon, "`;` after `for` initializer");
            Some(Box::new(Stmt { kind: StmtKind::Expr(e), pos }))
        };
        let cond = if self.eat(TokenKind::Semicolon) {
            None
        } else {
            let e = self.expr();
            let e = self.check_cond(e);
            self.expect(TokenKind::Semicolon, "`;` after `for` condition");
            Some(e)
        };
        let post = if self.peek().kind == TokenKind::RParen {
            None
        } else {
            Some(self.expr())
        };
        self.expect(TokenKind::RParen, "`)` after `for` clauses");
        self.loop_depth += 1;
        let body = Box::new(self.stmt());
        self.loop_depth -= 1;
        if scope.is_some() {
            self.leave_scope();
        }
        Stmt { kind: StmtKind::For { scope, pre, cond, post, body }, pos }
    }

    // --- local declarations ---------------------------------------------

    fn local_decl(&mut self, out: &mut Vec<Stmt>) {
        let pos = self.peek().pos;
        let spec = match self.decl_specifiers() {
            Some(spec) => spec,
            None => {
                let tok = self.next();
                self.diags.error(tok.pos, "declaration expected");
                self.resync();
                return;
            }
        };
        if self.eat(TokenKind::Semicolon) {
            return; // local struct/enum definition
        }

        loop {
            let (name, mut ty, _) = self.declarator(spec.ty);
            let name = match name {
                Some(name) => name,
                None => {
                    self.diags.error(pos, "identifier expected in declaration");
                    self.resync();
                    return;
                }
            };

            if spec.is_typedef {
                let info = VarInfo {
                    name,
                    ty,
                    flags: spec.flags,
                    storage: Storage::Typedef,
                    init: None,
                };
                if let Err(msg) = self.scopes.add(self.cur_scope, info) {
                    self.diags.error(pos, msg);
                }
            } else if spec.flags.is_extern {
                let info = VarInfo {
                    name,
                    ty,
                    flags: spec.flags,
                    storage: Storage::Global,
                    init: None,
                };
                if let Err(msg) = self.scopes.add(self.cur_scope, info) {
                    self.diags.error(pos, msg);
                }
            } else if spec.flags.is_static {
                let label = format!("{}.{}", name, self.static_no);
                self.static_no += 1;
                let mut init = None;
                if self.eat(TokenKind::Assign) {
                    let raw = self.parse_initializer();
                    init = Some(self.flatten_initializer(&mut ty, raw, pos));
                }
                let info = VarInfo {
                    name,
                    ty,
                    flags: spec.flags,
                    storage: Storage::StaticLocal { label },
                    init,
                };
                match self.scopes.add(self.cur_scope, info) {
                    Ok(var) => self.statics.push(var),
                    Err(msg) => self.diags.error(pos, msg),
                }
            } else {
                let init = if self.eat(TokenKind::Assign) {
                    Some(self.parse_initializer())
                } else {
                    None
                };
                if let Some(raw) = init {
                    let flat = self.flatten_initializer(&mut ty, raw, pos);
                    let info = VarInfo {
                        name: name.clone(),
                        ty,
                        flags: spec.flags,
                        storage: Storage::Local { vreg: None },
                        init: None,
                    };
                    match self.scopes.add(self.cur_scope, info) {
                        Ok(_) => {
                            let target = self.var_expr(&name, pos);
                            self.init_assign_stmts(target, ty, &flat, out);
                        }
                        Err(msg) => self.diags.error(pos, msg),
                    }
                } else {
                    if self.types.is_array(ty) {
                        if let Type::Array { len: None, .. } = self.types.get(ty) {
                            self.diags
                                .error(pos, format!("array `{}` has unknown size", name));
                        }
                    }
                    let info = VarInfo {
                        name,
                        ty,
                        flags: spec.flags,
                        storage: Storage::Local { vreg: None },
                        init: None,
                    };
                    if let Err(msg) = self.scopes.add(self.cur_scope, info) {
                        self.diags.error(pos, msg);
                    }
                }
            }

            if self.eat(TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::Semicolon, "`;` after declaration");
            return;
        }
    }

    /// A resolved reference to a variable visible from the current scope.
    pub(crate) fn var_expr(&mut self, name: &str, pos: Pos) -> Expr {
        match self.scopes.find(self.cur_scope, name) {
            Some((var, scope)) => {
                let ty = self.scopes.vars[var].ty;
                Expr { kind: ExprKind::Var { name: name.to_string(), scope }, ty, pos }
            }
            None => {
                self.diags.error(pos, format!("`{}` is not declared", name));
                Expr { kind: ExprKind::IntLit(0), ty: self.types.int_, pos }
            }
        }
    }

    fn check_cond(&mut self, e: Expr) -> Expr {
        if !self.types.is_scalar(e.ty) {
            self.diags.error(e.pos, "condition must be scalar");
        }
        e
    }
}

/// The result of parsing declaration specifiers.
pub(crate) struct DeclSpec {
    pub(crate) ty: TypeRef,
    pub(crate) flags: VarFlags,
    pub(crate) is_typedef: bool,
}

/// Convenience used by tests and the driver: parse a whole unit.
pub fn parse_unit(
    source: &str,
    types: &mut Types,
    scopes: &mut Scopes,
    diags: &mut Diagnostics,
    no_flonum: bool,
) -> (Vec<Declaration>, Vec<VarRef>) {
    let mut parser = Parser::new(source, types, scopes, diags, no_flonum);
    let decls = parser.parse();
    let statics = std::mem::replace(&mut parser.statics, Vec::new());
    (decls, statics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Declaration;

    fn parse_ok(src: &str) -> (Types, Scopes, Vec<Declaration>) {
        let mut types = Types::new();
        let mut scopes = Scopes::new();
        let mut diags = Diagnostics::new("test.c");
        let (decls, _) = parse_unit(src, &mut types, &mut scopes, &mut diags, false);
        assert!(diags.is_ok(), "unexpected diagnostics:\n{}", diags);
        (types, scopes, decls)
    }

    fn parse_err(src: &str) -> Diagnostics {
        let mut types = Types::new();
        let mut scopes = Scopes::new();
        let mut diags = Diagnostics::new("test.c");
        let _ = parse_unit(src, &mut types, &mut scopes, &mut diags, false);
        assert!(!diags.is_ok(), "expected diagnostics");
        diags
    }

    #[test]
    fn function_definition_shape() {
        let (_, _, decls) = parse_ok("int add(int a, int b) { return a + b; }");
        assert_eq!(decls.len(), 1);
        match &decls[0] {
            Declaration::Defun(d) => {
                assert_eq!(d.name, "add");
                assert_eq!(d.params.len(), 2);
                assert!(d.body.is_some());
            }
            _ => panic!("expected a function"),
        }
    }

    #[test]
    fn declarator_precedence() {
        let (mut types, scopes, _) = parse_ok("int *a[3]; int (*b)[3]; int (*f)(int);");
        let g = scopes.global();
        let a = scopes.find(g, "a").unwrap().0;
        let b = scopes.find(g, "b").unwrap().0;
        let f = scopes.find(g, "f").unwrap().0;
        // a: array of pointer; 3 * 8 bytes.
        assert_eq!(types.size_of(scopes.vars[a].ty), 24);
        assert!(types.is_array(scopes.vars[a].ty));
        // b: pointer to array; 8 bytes.
        assert!(types.is_ptr(scopes.vars[b].ty));
        let b_inner = types.elem_of(scopes.vars[b].ty);
        assert!(types.is_array(b_inner));
        // f: pointer to function.
        assert!(types.is_ptr(scopes.vars[f].ty));
        let f_inner = types.elem_of(scopes.vars[f].ty);
        assert!(types.is_func(f_inner));
    }

    #[test]
    fn enum_values_count_up() {
        let (_, scopes, _) = parse_ok("enum E { A, B = 10, C };");
        let g = scopes.global();
        for (name, want) in &[("A", 0i64), ("B", 10), ("C", 11)] {
            let var = scopes.find(g, name).unwrap().0;
            match scopes.vars[var].storage {
                Storage::EnumConst { value } => assert_eq!(value, *want, "{}", name),
                _ => panic!("{} is not an enum constant", name),
            }
        }
    }

    #[test]
    fn typedef_names_act_as_types() {
        let (mut types, scopes, _) = parse_ok("typedef long word; word w;");
        let g = scopes.global();
        let w = scopes.find(g, "w").unwrap().0;
        assert_eq!(types.size_of(scopes.vars[w].ty), 8);
    }

    #[test]
    fn duplicate_case_is_diagnosed() {
        let diags =
            parse_err("int main(void) { switch (1) { case 1: case 1: break; } return 0; }");
        assert!(diags.to_string().contains("duplicate case"));
    }

    #[test]
    fn break_outside_loop_is_diagnosed() {
        let diags = parse_err("int main(void) { break; return 0; }");
        assert!(diags.to_string().contains("outside of loop"));
    }

    #[test]
    fn recovery_reports_multiple_errors() {
        let diags = parse_err("int main(void) { undeclared_a; undeclared_b; return 0; }");
        assert!(diags.error_count() >= 2);
    }

    #[test]
    fn unsized_global_array_without_initializer_is_an_error() {
        let diags = parse_err("int a[];");
        assert!(diags.to_string().contains("unknown size"));
    }
}

//! AST → IR lowering.
//!
//! Each function gets a fresh basic-block graph and virtual-register
//! namespace; module-level items (globals, statics, string literals,
//! float constants) are staged as data on the shared codegen context.
//! Control flow is built the way the block builder wants it: every
//! construct splits blocks off the current one so the layout order equals
//! source order, and `break`/`continue` target a stack of blocks pushed
//! by the enclosing loop or switch.

use crate::ast::{Declaration, Defun, Expr, ExprKind, Initializer, Stmt, StmtKind};
use crate::diag::{Diagnostics, Pos};
use crate::scope::{ScopeRef, Scopes, Storage, VarRef};
use crate::types::{Type, TypeRef, Types};
use oxcc_codegen::binemit::Label;
use oxcc_codegen::ir::{Block, Cond, Function, FunctionBuilder, Signature};
use oxcc_codegen::Context;
use std::collections::HashMap;

mod expr;

/// Lower a whole unit: functions into machine code, globals and statics
/// into data segments.
pub fn lower_unit(
    types: &mut Types,
    scopes: &mut Scopes,
    diags: &mut Diagnostics,
    ctx: &mut Context,
    decls: &[Declaration],
    statics: &[VarRef],
) {
    // A declaration and its later definition share a `VarRef`; emit each
    // variable once.
    let mut emitted = std::collections::HashSet::new();
    for decl in decls {
        match decl {
            Declaration::Defun(defun) => {
                if defun.body.is_some() {
                    lower_function(types, scopes, diags, ctx, defun);
                }
            }
            Declaration::Global(var) => {
                if emitted.insert(*var) {
                    emit_global(types, scopes, diags, ctx, *var);
                }
            }
        }
    }
    for &var in statics {
        if emitted.insert(var) {
            emit_global(types, scopes, diags, ctx, var);
        }
    }
}

/// Per-switch lowering state.
struct SwitchLower {
    cases: Vec<Option<i64>>,
    blocks: Vec<Block>,
    next: Block,
}

/// The per-function lowering context; all module state is reached through
/// the explicit references, never through globals.
pub(crate) struct Lowerer<'a, 'f> {
    pub(crate) types: &'a mut Types,
    pub(crate) scopes: &'a mut Scopes,
    pub(crate) diags: &'a mut Diagnostics,
    pub(crate) ctx: &'a mut Context,
    pub(crate) b: FunctionBuilder<'f>,
    ret_ty: TypeRef,
    exit: Block,
    break_stack: Vec<Block>,
    cont_stack: Vec<Block>,
    switches: Vec<SwitchLower>,
    labels: HashMap<String, Block>,
}

fn lower_function(
    types: &mut Types,
    scopes: &mut Scopes,
    diags: &mut Diagnostics,
    ctx: &mut Context,
    defun: &Defun,
) {
    let (ret, param_tys, vaargs) = match types.get(defun.ty).clone() {
        Type::Func { ret, params, vaargs } => (ret, params, vaargs),
        _ => unreachable!("function with a non-function type"),
    };
    let pos = Pos::new(1, 1);
    if types.is_struct(ret) {
        diags.error(pos, format!("`{}`: returning a struct by value is not supported", defun.name));
        return;
    }
    for &pty in &param_tys {
        if types.is_struct(pty) {
            diags.error(
                pos,
                format!("`{}`: struct parameters are not supported; pass a pointer", defun.name),
            );
            return;
        }
    }

    let signature = Signature {
        params: param_tys.iter().map(|&t| types.to_vtype(t)).collect(),
        ret: if types.is_void(ret) { None } else { Some(types.to_vtype(ret)) },
        vaargs,
    };
    let mut func = Function::new(&defun.name, !defun.flags.is_static, signature);

    {
        let mut b = FunctionBuilder::new(&mut func);
        let exit = b.func.create_block();

        // Bind every local in every body scope to a fresh virtual register.
        // Parameters come first so their registers line up with the ABI.
        let mut params = Vec::new();
        for &var in &defun.params {
            let ty = scopes.vars[var].ty;
            let vt = types.to_vtype(ty);
            let vreg = b.func.new_vreg(vt);
            scopes.vars[var].storage = Storage::Local { vreg: Some(vreg) };
            params.push(vreg);
        }
        b.func.params = params;
        for &scope in &defun.all_scopes {
            bind_scope_locals(types, scopes, &mut b, scope);
        }

        let mut lw = Lowerer {
            types: &mut *types,
            scopes: &mut *scopes,
            diags: &mut *diags,
            ctx: &mut *ctx,
            b,
            ret_ty: ret,
            exit,
            break_stack: Vec::new(),
            cont_stack: Vec::new(),
            switches: Vec::new(),
            labels: HashMap::new(),
        };
        for stmt in defun.body.as_ref().unwrap() {
            lw.gen_stmt(stmt);
        }

        for (name, &bb) in &lw.labels {
            if !lw.b.func.is_block_placed(bb) {
                lw.diags.error(pos, format!("label `{}` used but not defined", name));
                return;
            }
        }
    }

    if diags.is_ok() {
        if let Err(err) = ctx.compile_function(&func) {
            diags.error(pos, format!("code generation failed: {}", err));
        }
    }
}

fn bind_scope_locals(
    types: &mut Types,
    scopes: &mut Scopes,
    b: &mut FunctionBuilder,
    scope: ScopeRef,
) {
    let vars: Vec<VarRef> = scopes.scope_vars(scope).to_vec();
    for var in vars {
        let needs_reg = match scopes.vars[var].storage {
            Storage::Local { vreg: None } => true,
            _ => false,
        };
        if !needs_reg {
            continue;
        }
        let ty = scopes.vars[var].ty;
        let vt = types.to_vtype(ty);
        let vreg = b.func.new_vreg(vt);
        if types.is_array(ty) || types.is_struct(ty) {
            b.func.set_reffed(vreg);
        }
        scopes.vars[var].storage = Storage::Local { vreg: Some(vreg) };
    }
}

impl<'a, 'f> Lowerer<'a, 'f> {
    pub(crate) fn gen_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Empty => {}
            StmtKind::Expr(e) => {
                self.gen_expr(e);
            }
            StmtKind::Decl(inits) | StmtKind::Block { stmts: inits, scope: _ } => {
                for s in inits {
                    self.gen_stmt(s);
                }
            }
            StmtKind::If { cond, then, els } => self.gen_if(cond, then, els.as_deref()),
            StmtKind::While { cond, body } => self.gen_while(cond, body),
            StmtKind::DoWhile { body, cond } => self.gen_do_while(body, cond),
            StmtKind::For { pre, cond, post, body, scope: _ } => {
                self.gen_for(pre.as_deref(), cond.as_ref(), post.as_ref(), body)
            }
            StmtKind::Switch { value, body, cases } => self.gen_switch(value, body, cases),
            StmtKind::Case(v) => self.gen_case(Some(*v), stmt.pos),
            StmtKind::Default => self.gen_case(None, stmt.pos),
            StmtKind::Break => match self.break_stack.last() {
                Some(&bb) => self.b.jmp(Cond::Any, bb),
                None => self.diags.error(stmt.pos, "`break` outside of loop or switch"),
            },
            StmtKind::Continue => match self.cont_stack.last() {
                Some(&bb) => self.b.jmp(Cond::Any, bb),
                None => self.diags.error(stmt.pos, "`continue` outside of loop"),
            },
            StmtKind::Return(value) => self.gen_return(value.as_ref(), stmt.pos),
            StmtKind::Goto(name) => {
                let bb = self.label_block(name);
                self.b.jmp(Cond::Any, bb);
            }
            StmtKind::Label(name) => {
                let bb = self.label_block(name);
                if self.b.func.is_block_placed(bb) {
                    self.diags.error(stmt.pos, format!("duplicate label `{}`", name));
                    return;
                }
                let cur = self.b.cur_block();
                self.b.func.insert_block_after(bb, cur);
                self.b.switch_to_block(bb);
            }
        }
    }

    fn label_block(&mut self, name: &str) -> Block {
        match self.labels.get(name) {
            Some(&bb) => bb,
            None => {
                let bb = self.b.func.create_detached_block();
                self.labels.insert(name.to_string(), bb);
                bb
            }
        }
    }

    fn gen_if(&mut self, cond: &Expr, then: &Stmt, els: Option<&Stmt>) {
        let tbb = self.b.split();
        let fbb = self.b.split_after(tbb);
        self.gen_cond_jmp(cond, false, fbb);
        self.b.switch_to_block(tbb);
        self.gen_stmt(then);
        match els {
            None => self.b.switch_to_block(fbb),
            Some(els) => {
                let nbb = self.b.split_after(fbb);
                self.b.jmp(Cond::Any, nbb);
                self.b.switch_to_block(fbb);
                self.gen_stmt(els);
                self.b.switch_to_block(nbb);
            }
        }
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt) {
        let cond_bb = self.b.split();
        let body_bb = self.b.split_after(cond_bb);
        let next_bb = self.b.split_after(body_bb);
        self.break_stack.push(next_bb);
        self.cont_stack.push(cond_bb);

        self.b.jmp(Cond::Any, cond_bb);
        self.b.switch_to_block(cond_bb);
        self.gen_cond_jmp(cond, false, next_bb);
        self.b.switch_to_block(body_bb);
        self.gen_stmt(body);
        self.b.jmp(Cond::Any, cond_bb);
        self.b.switch_to_block(next_bb);

        self.break_stack.pop();
        self.cont_stack.pop();
    }

    fn gen_do_while(&mut self, body: &Stmt, cond: &Expr) {
        let body_bb = self.b.split();
        let cond_bb = self.b.split_after(body_bb);
        let next_bb = self.b.split_after(cond_bb);
        self.break_stack.push(next_bb);
        self.cont_stack.push(cond_bb);

        self.b.switch_to_block(body_bb);
        self.gen_stmt(body);
        self.b.switch_to_block(cond_bb);
        self.gen_cond_jmp(cond, true, body_bb);
        self.b.switch_to_block(next_bb);

        self.break_stack.pop();
        self.cont_stack.pop();
    }

    fn gen_for(&mut self, pre: Option<&Stmt>, cond: Option<&Expr>, post: Option<&Expr>, body: &Stmt) {
        if let Some(pre) = pre {
            self.gen_stmt(pre);
        }
        let cond_bb = self.b.split();
        let body_bb = self.b.split_after(cond_bb);
        let cont_bb = self.b.split_after(body_bb);
        let next_bb = self.b.split_after(cont_bb);
        self.break_stack.push(next_bb);
        self.cont_stack.push(cont_bb);

        self.b.switch_to_block(cond_bb);
        if let Some(cond) = cond {
            self.gen_cond_jmp(cond, false, next_bb);
        }
        self.b.switch_to_block(body_bb);
        self.gen_stmt(body);
        self.b.switch_to_block(cont_bb);
        if let Some(post) = post {
            self.gen_expr(post);
        }
        self.b.jmp(Cond::Any, cond_bb);
        self.b.switch_to_block(next_bb);

        self.break_stack.pop();
        self.cont_stack.pop();
    }

    fn gen_switch(&mut self, value: &Expr, body: &Stmt, cases: &[Option<i64>]) {
        let value_reg = match self.gen_expr(value) {
            Some(reg) => reg,
            None => return,
        };
        let vt = self.types.to_vtype(value.ty);

        // One block per label, chained in source order, then the exit.
        let mut after = self.b.cur_block();
        let mut blocks = Vec::with_capacity(cases.len());
        for _ in cases {
            after = self.b.split_after(after);
            blocks.push(after);
        }
        let next = self.b.split_after(after);

        for (i, case) in cases.iter().enumerate() {
            if let Some(v) = *case {
                let k = self.b.iconst(v, vt);
                self.b.cmp(value_reg, k);
                self.b.jmp(Cond::Eq, blocks[i]);
            }
        }
        let default = cases.iter().position(Option::is_none).map(|i| blocks[i]);
        self.b.jmp(Cond::Any, default.unwrap_or(next));

        self.break_stack.push(next);
        self.switches.push(SwitchLower { cases: cases.to_vec(), blocks, next });
        self.gen_stmt(body);
        let sw = self.switches.pop().unwrap();
        self.break_stack.pop();
        self.b.switch_to_block(sw.next);
    }

    fn gen_case(&mut self, value: Option<i64>, pos: Pos) {
        let bb = match self.switches.last() {
            Some(sw) => {
                let idx = sw.cases.iter().position(|c| *c == value);
                match idx {
                    Some(idx) => Some(sw.blocks[idx]),
                    None => None,
                }
            }
            None => None,
        };
        match bb {
            Some(bb) => self.b.switch_to_block(bb),
            None => self.diags.error(pos, "case label outside of its switch"),
        }
    }

    fn gen_return(&mut self, value: Option<&Expr>, pos: Pos) {
        match value {
            Some(e) => {
                if self.types.is_void(self.ret_ty) {
                    self.diags.error(pos, "`return` with a value in a void function");
                } else if let Some(reg) = self.gen_expr(e) {
                    let ret_ty = self.ret_ty;
                    let reg = self.gen_cast_reg(reg, ret_ty);
                    self.b.result(reg);
                }
            }
            None => {
                if !self.types.is_void(self.ret_ty) {
                    self.diags.error(pos, "non-void function returns no value");
                }
            }
        }
        let exit = self.exit;
        self.b.jmp(Cond::Any, exit);
    }
}

// --- module data --------------------------------------------------------

fn emit_global(
    types: &mut Types,
    scopes: &mut Scopes,
    diags: &mut Diagnostics,
    ctx: &mut Context,
    var: VarRef,
) {
    let info = scopes.vars[var].clone();
    match info.storage {
        Storage::Global | Storage::StaticLocal { .. } => {}
        _ => return,
    }
    if info.flags.is_extern || types.is_func(info.ty) {
        return;
    }
    let label_name = match &info.storage {
        Storage::StaticLocal { label } => label.clone(),
        _ => info.name.clone(),
    };
    let label = ctx.label(&label_name);
    let global = !info.flags.is_static && matches!(info.storage, Storage::Global);
    let size = types.size_of(info.ty);
    let align = types.align_of(info.ty);

    match &info.init {
        Some(init) => {
            let mut buf = vec![0u8; size as usize];
            let mut relocs = Vec::new();
            let mut data = DataGen {
                types: &mut *types,
                scopes: &mut *scopes,
                diags: &mut *diags,
                ctx: &mut *ctx,
            };
            data.construct(info.ty, init, &mut buf, 0, &mut relocs);
            ctx.define_data(label, global, buf, align, relocs);
        }
        None => ctx.define_bss(label, global, size.max(1), align),
    }
}

/// Builds the byte image of a static initializer, collecting embedded
/// pointer relocations.
struct DataGen<'a> {
    types: &'a mut Types,
    scopes: &'a mut Scopes,
    diags: &'a mut Diagnostics,
    ctx: &'a mut Context,
}

impl<'a> DataGen<'a> {
    fn construct(
        &mut self,
        ty: TypeRef,
        init: &Initializer,
        buf: &mut Vec<u8>,
        at: u32,
        relocs: &mut Vec<(u32, Label)>,
    ) {
        match self.types.get(ty).clone() {
            Type::Fixnum { kind, .. } => {
                let v = self.const_int(init);
                store_le(buf, at, v as u64, kind.size());
            }
            Type::Enum => {
                let v = self.const_int(init);
                store_le(buf, at, v as u64, 4);
            }
            Type::Flonum { dbl } => {
                let v = self.const_float(init);
                if dbl {
                    store_le(buf, at, v.to_bits(), 8);
                } else {
                    store_le(buf, at, u64::from((v as f32).to_bits()), 4);
                }
            }
            Type::Ptr { .. } => match init {
                Initializer::Single(e) => self.pointer_init(e, buf, at, relocs),
                _ => self.bad(init_pos(init), "invalid pointer initializer"),
            },
            Type::Array { inner, len } => match init {
                Initializer::Multi(elems) => {
                    let step = self.types.size_of(inner);
                    let n = len.unwrap_or(elems.len() as u32);
                    for i in 0..n as usize {
                        if let Some(Some(sub)) = elems.get(i).map(|e| e.as_ref()) {
                            self.construct(inner, sub, buf, at + i as u32 * step, relocs);
                        }
                    }
                }
                _ => self.bad(init_pos(init), "invalid array initializer"),
            },
            Type::Struct { info } => {
                self.types.compute_layout(info);
                match init {
                    Initializer::Multi(elems) => {
                        let members: Vec<(TypeRef, u32)> = self
                            .types
                            .struct_info(info)
                            .members
                            .iter()
                            .map(|m| (m.ty, m.offset))
                            .collect();
                        for (i, (mty, off)) in members.iter().enumerate() {
                            if let Some(Some(sub)) = elems.get(i).map(|e| e.as_ref()) {
                                self.construct(*mty, sub, buf, at + off, relocs);
                            }
                        }
                    }
                    _ => self.bad(init_pos(init), "invalid struct initializer"),
                }
            }
            Type::Void | Type::Func { .. } => {
                self.bad(init_pos(init), "cannot initialize this type");
            }
        }
    }

    fn const_int(&mut self, init: &Initializer) -> i64 {
        match init {
            Initializer::Single(e) => match const_expr_value(e) {
                Some(v) => v,
                None => {
                    self.bad(e.pos, "initializer element is not a constant");
                    0
                }
            },
            _ => {
                self.bad(init_pos(init), "invalid scalar initializer");
                0
            }
        }
    }

    fn const_float(&mut self, init: &Initializer) -> f64 {
        match init {
            Initializer::Single(e) => match e.kind {
                ExprKind::FloLit(v) => v,
                ExprKind::IntLit(v) => v as f64,
                _ => {
                    self.bad(e.pos, "initializer element is not a constant");
                    0.0
                }
            },
            _ => {
                self.bad(init_pos(init), "invalid scalar initializer");
                0.0
            }
        }
    }

    fn pointer_init(
        &mut self,
        e: &Expr,
        buf: &mut Vec<u8>,
        at: u32,
        relocs: &mut Vec<(u32, Label)>,
    ) {
        match &e.kind {
            ExprKind::IntLit(v) => store_le(buf, at, *v as u64, 8),
            ExprKind::StrLit(bytes) => {
                let mut data = bytes.clone();
                data.push(0);
                let label = self.ctx.define_rodata(data, 1);
                relocs.push((at, label));
            }
            ExprKind::Ref(sub) => self.symbol_reloc(sub, at, relocs),
            ExprKind::Var { .. } => self.symbol_reloc(e, at, relocs),
            ExprKind::Cast(sub) => self.pointer_init(sub, buf, at, relocs),
            _ => self.bad(e.pos, "pointer initializer must be a constant address"),
        }
    }

    fn symbol_reloc(&mut self, e: &Expr, at: u32, relocs: &mut Vec<(u32, Label)>) {
        match &e.kind {
            ExprKind::Var { name, scope } => {
                let found = self.scopes.find_here(*scope, name);
                let target = match found {
                    Some(var) => match &self.scopes.vars[var].storage {
                        Storage::Global => Some(name.clone()),
                        Storage::StaticLocal { label } => Some(label.clone()),
                        _ => None,
                    },
                    None => None,
                };
                match target {
                    Some(target) => {
                        let label = self.ctx.label(&target);
                        relocs.push((at, label));
                    }
                    None => {
                        self.bad(e.pos, "static initializer may only reference globals")
                    }
                }
            }
            _ => self.bad(e.pos, "pointer initializer must be a constant address"),
        }
    }

    fn bad(&mut self, pos: Pos, msg: &str) {
        self.diags.error(pos, msg);
    }
}

fn store_le(buf: &mut Vec<u8>, at: u32, value: u64, size: u32) {
    let at = at as usize;
    for i in 0..size as usize {
        buf[at + i] = (value >> (i * 8)) as u8;
    }
}

fn const_expr_value(e: &Expr) -> Option<i64> {
    match e.kind {
        ExprKind::IntLit(v) => Some(v),
        ExprKind::FloLit(v) => Some(v as i64),
        _ => None,
    }
}

fn init_pos(init: &Initializer) -> Pos {
    match init {
        Initializer::Single(e) => e.pos,
        Initializer::Multi(elems) => elems
            .iter()
            .filter_map(|e| e.as_ref())
            .map(init_pos)
            .next()
            .unwrap_or_default(),
        Initializer::Dot(_, sub) | Initializer::Arr(_, sub) => init_pos(sub),
    }
}

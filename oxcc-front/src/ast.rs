//! The typed abstract syntax tree.
//!
//! Every expression carries its resolved type: the parser performs
//! identifier resolution, the usual arithmetic conversions and constant
//! folding while building these nodes, so later stages never see an
//! untyped or foldable expression. Pointer arithmetic is represented by
//! the dedicated `PtrAdd`/`PtrSub`/`PtrDiff` operators rather than integer
//! `Add`/`Sub`; the implicit `sizeof(pointee)` scale stays visible all the
//! way to the back end.

use crate::diag::Pos;
use crate::scope::{ScopeRef, VarRef};
use crate::types::TypeRef;

/// Binary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+` on numbers.
    Add,
    /// `-` on numbers.
    Sub,
    /// `*`.
    Mul,
    /// `/`.
    Div,
    /// `%`.
    Mod,
    /// `&`.
    BitAnd,
    /// `|`.
    BitOr,
    /// `^`.
    BitXor,
    /// `<<`.
    LShift,
    /// `>>`.
    RShift,
    /// `==`.
    Eq,
    /// `!=`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
    /// `&&`.
    LogAnd,
    /// `||`.
    LogOr,
    /// `,`.
    Comma,
    /// Pointer + integer, scaled by the pointee size.
    PtrAdd,
    /// Pointer - integer, scaled by the pointee size.
    PtrSub,
    /// Pointer - pointer, divided by the pointee size.
    PtrDiff,
}

impl BinaryOp {
    /// Is this a comparison producing `int` 0/1?
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Unary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// `~`.
    BitNot,
    /// `!`.
    Not,
}

/// A typed expression.
#[derive(Clone, Debug)]
pub struct Expr {
    /// Node payload.
    pub kind: ExprKind,
    /// Resolved type; never void except for void calls and ternaries.
    pub ty: TypeRef,
    /// Source position for diagnostics.
    pub pos: Pos,
}

/// Expression payloads.
#[derive(Clone, Debug)]
pub enum ExprKind {
    /// Integer (or enum, or character) constant.
    IntLit(i64),
    /// Floating constant.
    FloLit(f64),
    /// String literal bytes, NUL not included.
    StrLit(Vec<u8>),
    /// Variable reference, bound to the scope that declared it.
    Var {
        /// Name as written.
        name: String,
        /// Scope the reference resolved in.
        scope: ScopeRef,
    },
    /// Binary operation.
    Bin {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Unary operation.
    Un {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        sub: Box<Expr>,
    },
    /// `*p`.
    Deref(Box<Expr>),
    /// `&x`.
    Ref(Box<Expr>),
    /// `s.m` or `p->m` (the parser inserts the deref for `->`).
    Member {
        /// Aggregate operand.
        base: Box<Expr>,
        /// Member name.
        name: String,
        /// Index into the struct's member list.
        index: usize,
    },
    /// Simple assignment.
    Assign {
        /// Target lvalue.
        lhs: Box<Expr>,
        /// Value.
        rhs: Box<Expr>,
    },
    /// Compound assignment `lhs op= rhs`.
    AssignWith {
        /// The arithmetic operator.
        op: BinaryOp,
        /// Target lvalue.
        lhs: Box<Expr>,
        /// Value.
        rhs: Box<Expr>,
    },
    /// `++`/`--` in either position.
    IncDec {
        /// Prefix form.
        pre: bool,
        /// Increment rather than decrement.
        inc: bool,
        /// Target lvalue.
        sub: Box<Expr>,
    },
    /// Cast to this node's type.
    Cast(Box<Expr>),
    /// `cond ? then : els`.
    Ternary {
        /// Condition.
        cond: Box<Expr>,
        /// Value when true.
        then: Box<Expr>,
        /// Value when false.
        els: Box<Expr>,
    },
    /// Function call.
    Call {
        /// Callee (function or function pointer).
        func: Box<Expr>,
        /// Arguments, already cast to parameter types.
        args: Vec<Expr>,
    },
    /// Compound literal: an anonymous variable plus its initializing
    /// statements; the expression's value is the variable.
    CompLit {
        /// The anonymous variable as a `Var` expression.
        var: Box<Expr>,
        /// Statements initializing it.
        inits: Vec<Stmt>,
    },
}

/// A statement.
#[derive(Clone, Debug)]
pub struct Stmt {
    /// Node payload.
    pub kind: StmtKind,
    /// Source position.
    pub pos: Pos,
}

/// Statement payloads.
#[derive(Clone, Debug)]
pub enum StmtKind {
    /// Expression statement.
    Expr(Expr),
    /// `{ ... }`, owning its scope when it declares anything.
    Block {
        /// The block's scope, if one was created.
        scope: Option<ScopeRef>,
        /// Statements in order.
        stmts: Vec<Stmt>,
    },
    /// `if`.
    If {
        /// Condition.
        cond: Expr,
        /// Then branch.
        then: Box<Stmt>,
        /// Else branch.
        els: Option<Box<Stmt>>,
    },
    /// `while`.
    While {
        /// Condition, tested before the body.
        cond: Expr,
        /// Body.
        body: Box<Stmt>,
    },
    /// `do ... while`.
    DoWhile {
        /// Body.
        body: Box<Stmt>,
        /// Condition, tested after the body.
        cond: Expr,
    },
    /// `for`.
    For {
        /// Scope of a declaration in the init position.
        scope: Option<ScopeRef>,
        /// Init statement.
        pre: Option<Box<Stmt>>,
        /// Condition.
        cond: Option<Expr>,
        /// Step expression.
        post: Option<Expr>,
        /// Body.
        body: Box<Stmt>,
    },
    /// `switch`; labels were collected during parsing.
    Switch {
        /// Selector.
        value: Expr,
        /// Body containing `Case`/`Default` markers.
        body: Box<Stmt>,
        /// Labels in source order: `Some(v)` for `case v:`, `None` for
        /// `default:`.
        cases: Vec<Option<i64>>,
    },
    /// `case N:`.
    Case(i64),
    /// `default:`.
    Default,
    /// `break`.
    Break,
    /// `continue`.
    Continue,
    /// `return`.
    Return(Option<Expr>),
    /// `goto label;`.
    Goto(String),
    /// `label:`; marks the statement that follows it in the stream.
    Label(String),
    /// A local declaration, reduced to its initializing statements.
    Decl(Vec<Stmt>),
    /// `;`.
    Empty,
}

/// An initializer tree.
///
/// The parser's flattening pass rewrites the source-order/designated forms
/// into a canonical `Multi` whose positions map one-to-one onto array
/// elements or struct members, with `None` for zero-initialized holes. A
/// `Single` stays `Single` for scalars.
#[derive(Clone, Debug)]
pub enum Initializer {
    /// A single expression.
    Single(Box<Expr>),
    /// Positional elements; `None` means zero-initialize.
    Multi(Vec<Option<Initializer>>),
    /// `.name = init` (pre-flattening only).
    Dot(String, Box<Initializer>),
    /// `[index] = init` (pre-flattening only).
    Arr(i64, Box<Initializer>),
}

/// A function definition.
pub struct Defun {
    /// Function name.
    pub name: String,
    /// Function type (`Type::Func`).
    pub ty: TypeRef,
    /// Storage flags (`static` functions are unit-local).
    pub flags: crate::scope::VarFlags,
    /// Parameter variables in order.
    pub params: Vec<VarRef>,
    /// The parameter scope, parent of every body scope.
    pub top_scope: ScopeRef,
    /// Body statements; `None` for a declaration without a body.
    pub body: Option<Vec<Stmt>>,
    /// Every scope created in the body, for frame accounting.
    pub all_scopes: Vec<ScopeRef>,
}

/// A top-level item.
pub enum Declaration {
    /// A function definition (or prototype).
    Defun(Box<Defun>),
    /// A global variable.
    Global(VarRef),
}

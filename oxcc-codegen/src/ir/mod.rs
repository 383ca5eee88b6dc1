//! Intermediate representation: functions made of basic blocks over virtual
//! registers.
//!
//! Every C function is lowered into one [`Function`]: a list of basic blocks
//! in emission order, each holding straight-line [`InstData`] instructions
//! terminated by jumps. Values live in virtual registers ([`VReg`]); the
//! register allocator later maps each to a physical register, a frame slot
//! or an immediate. Entity references are plain `u32` newtypes indexing
//! `PrimaryMap` tables in the function, so instructions stay `Copy`-sized
//! and the whole graph is freed with the function.

use crate::binemit::Label;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};

mod cond;

pub use self::cond::Cond;

/// An opaque reference to a basic block in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "bb");

/// An opaque reference to a virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// The machine-level shape of a virtual register's value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VRegType {
    /// Size in bytes. Values wider than 8 (aggregates) always live in
    /// memory and are moved with `Memcpy`.
    pub size: u32,
    /// Alignment in bytes.
    pub align: u32,
    /// Unsigned integer semantics (division, right shift, widening).
    pub unsigned: bool,
    /// Floating-point value, allocated from the XMM bank.
    pub flonum: bool,
}

impl VRegType {
    /// Signed 8-bit integer.
    pub const I8: Self = Self { size: 1, align: 1, unsigned: false, flonum: false };
    /// Signed 16-bit integer.
    pub const I16: Self = Self { size: 2, align: 2, unsigned: false, flonum: false };
    /// Signed 32-bit integer.
    pub const I32: Self = Self { size: 4, align: 4, unsigned: false, flonum: false };
    /// Signed 64-bit integer.
    pub const I64: Self = Self { size: 8, align: 8, unsigned: false, flonum: false };
    /// Pointer-sized unsigned integer.
    pub const PTR: Self = Self { size: 8, align: 8, unsigned: true, flonum: false };
    /// 32-bit float.
    pub const F32: Self = Self { size: 4, align: 4, unsigned: false, flonum: true };
    /// 64-bit float.
    pub const F64: Self = Self { size: 8, align: 8, unsigned: false, flonum: true };
}

/// Everything the compiler knows about one virtual register.
#[derive(Clone, Debug)]
pub struct VRegData {
    /// Value shape.
    pub vtype: VRegType,
    /// The register's address has been taken; it must be given a frame slot
    /// rather than a physical register.
    pub reffed: bool,
    /// Constant payload. A constant register occupies no physical register;
    /// its value is materialized at each use site.
    pub konst: Option<i64>,
}

/// Two-operand integer/float arithmetic selected by `InstData::Bin`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Signed division.
    Div,
    /// Unsigned division.
    DivU,
    /// Signed remainder.
    Mod,
    /// Unsigned remainder.
    ModU,
    /// Bitwise and.
    BitAnd,
    /// Bitwise or.
    BitOr,
    /// Bitwise exclusive or.
    BitXor,
    /// Left shift.
    LShift,
    /// Right shift; arithmetic or logical per the operand's signedness.
    RShift,
}

/// One-operand operations selected by `InstData::Un`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    /// Two's-complement negation.
    Neg,
    /// Bitwise complement.
    BitNot,
    /// Logical not: 1 if the operand is zero, else 0.
    Not,
}

/// The callee of a `Call` instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallTarget {
    /// Direct call through a label (function name).
    Label(Label),
    /// Indirect call through a register holding the function address.
    Reg(VReg),
}

/// An IR instruction.
///
/// Destination registers are written exactly once per execution of the
/// instruction; the allocator requires every register to be defined before
/// use in a linear walk of the blocks in layout order.
#[derive(Clone, Debug)]
pub enum InstData {
    /// `dst = address of base's frame slot`. `base` must be frame-resident
    /// (its address was taken, or it is an aggregate).
    Bofs {
        /// Destination (pointer).
        dst: VReg,
        /// Frame-resident register whose slot address is taken.
        base: VReg,
    },
    /// `dst = address of label` (function, global or interned literal).
    Iofs {
        /// Destination (pointer).
        dst: VReg,
        /// Referenced label.
        label: Label,
    },
    /// `dst = stack pointer + offset`; addresses an outgoing argument slot.
    Sofs {
        /// Destination (pointer).
        dst: VReg,
        /// Byte offset from the current stack pointer.
        offset: i32,
    },
    /// `dst = *(addr)`, size and signedness from `dst`'s type.
    Load {
        /// Destination.
        dst: VReg,
        /// Address operand.
        addr: VReg,
    },
    /// `*(addr) = src`, size from `src`'s type.
    Store {
        /// Address operand.
        addr: VReg,
        /// Stored value.
        src: VReg,
    },
    /// Copy `size` bytes from address `src` to address `dst`.
    Memcpy {
        /// Destination address.
        dst: VReg,
        /// Source address.
        src: VReg,
        /// Byte count.
        size: u32,
    },
    /// `dst = lhs op rhs`.
    Bin {
        /// Operation.
        op: BinOp,
        /// Destination.
        dst: VReg,
        /// Left operand.
        lhs: VReg,
        /// Right operand.
        rhs: VReg,
    },
    /// `dst = op src`.
    Un {
        /// Operation.
        op: UnOp,
        /// Destination.
        dst: VReg,
        /// Operand.
        src: VReg,
    },
    /// Compare `lhs` with `rhs`, setting the flags a following `Jmp` or
    /// `Cond` consumes.
    Cmp {
        /// Left operand.
        lhs: VReg,
        /// Right operand.
        rhs: VReg,
    },
    /// Test `src` against itself (compare with zero).
    Test {
        /// Operand.
        src: VReg,
    },
    /// Materialize the current flags as 0/1 in `dst`.
    Cond {
        /// Destination.
        dst: VReg,
        /// Condition to materialize.
        cond: Cond,
    },
    /// Jump to `dest` when `cond` holds (`Cond::Any` is unconditional).
    Jmp {
        /// Condition.
        cond: Cond,
        /// Target block.
        dest: Block,
    },
    /// Open a call sequence: reserves outgoing stack-argument space and
    /// establishes alignment for the matching `Call`.
    Precall {
        /// Number of register-passed arguments that will be pushed.
        arg_count: u32,
        /// Bytes of stack-passed argument storage.
        stack_bytes: u32,
    },
    /// Push one register-passed argument (staged on the stack, popped into
    /// argument registers by the matching `Call`).
    PushArg {
        /// Argument value.
        src: VReg,
    },
    /// Call `target`. Pops `reg_args` staged arguments into the argument
    /// registers; bit `i` of `float_mask` routes the `i`-th one through the
    /// XMM bank.
    Call {
        /// Result register, absent for `void` calls.
        dst: PackedOption<VReg>,
        /// Callee.
        target: CallTarget,
        /// Number of register-passed arguments.
        reg_args: u32,
        /// Float-argument bitmask over the register-passed arguments.
        float_mask: u32,
    },
    /// Set the function return register from `src`.
    Result {
        /// Returned value.
        src: VReg,
    },
    /// `dst = base + index * scale + disp`; the pointer-arithmetic form kept
    /// distinct from integer `Add` so scaling stays explicit.
    PtrAdd {
        /// Destination (pointer).
        dst: VReg,
        /// Base pointer.
        base: VReg,
        /// Optional index register.
        index: PackedOption<VReg>,
        /// Scale factor applied to `index`; one of 1, 2, 4 or 8.
        scale: u8,
        /// Constant displacement.
        disp: i64,
    },
    /// Width/representation change from `src`'s type to `dst`'s type.
    Cast {
        /// Destination.
        dst: VReg,
        /// Operand.
        src: VReg,
    },
    /// Register copy.
    Mov {
        /// Destination.
        dst: VReg,
        /// Source.
        src: VReg,
    },
    /// `*(addr) += value` performed in memory, for pre/post increment.
    Inc {
        /// Address of the modified cell.
        addr: VReg,
        /// Access size in bytes.
        size: u8,
        /// Step (pointer stride or 1).
        value: i64,
    },
    /// `*(addr) -= value` performed in memory.
    Dec {
        /// Address of the modified cell.
        addr: VReg,
        /// Access size in bytes.
        size: u8,
        /// Step (pointer stride or 1).
        value: i64,
    },
    /// Adjust the stack pointer by `bytes` (negative reserves).
    AddSp {
        /// Signed adjustment.
        bytes: i32,
    },
}

/// A basic block: straight-line instructions ended by jumps. Control enters
/// only at the top; a block with no terminal jump falls through to the next
/// block in layout order.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// Instructions in execution order.
    pub insts: Vec<InstData>,
}

/// A function signature as the back end sees it: machine shapes only.
#[derive(Clone, Debug)]
pub struct Signature {
    /// Parameter shapes, in declaration order.
    pub params: Vec<VRegType>,
    /// Return shape, or `None` for `void`.
    pub ret: Option<VRegType>,
    /// Variadic tail.
    pub vaargs: bool,
}

/// A function under compilation: blocks, virtual registers and signature.
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Visible outside the unit (`false` for `static`).
    pub global: bool,
    /// Machine-level signature.
    pub signature: Signature,
    /// Parameter registers, one per signature parameter.
    pub params: Vec<VReg>,
    /// Block storage.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Emission order of the blocks.
    pub layout: Vec<Block>,
    /// Virtual register storage.
    pub vregs: PrimaryMap<VReg, VRegData>,
}

impl Function {
    /// Create an empty function.
    pub fn new(name: &str, global: bool, signature: Signature) -> Self {
        Self {
            name: name.to_string(),
            global,
            signature,
            params: Vec::new(),
            blocks: PrimaryMap::new(),
            layout: Vec::new(),
            vregs: PrimaryMap::new(),
        }
    }

    /// Create a new block appended to the end of the layout.
    pub fn create_block(&mut self) -> Block {
        let bb = self.blocks.push(BlockData::default());
        self.layout.push(bb);
        bb
    }

    /// Create a new block placed immediately after `after` in the layout.
    pub fn split_block(&mut self, after: Block) -> Block {
        let bb = self.blocks.push(BlockData::default());
        let pos = self
            .layout
            .iter()
            .position(|&b| b == after)
            .expect("split point not in layout");
        self.layout.insert(pos + 1, bb);
        bb
    }

    /// Create a block with no layout position yet; used for forward jump
    /// targets whose placement is not known until they are defined.
    pub fn create_detached_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Place a detached block immediately after `after` in the layout.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.layout.contains(&block), "block already placed");
        let pos = self
            .layout
            .iter()
            .position(|&b| b == after)
            .expect("insertion point not in layout");
        self.layout.insert(pos + 1, block);
    }

    /// Whether `block` has a layout position.
    pub fn is_block_placed(&self, block: Block) -> bool {
        self.layout.contains(&block)
    }

    /// Allocate a fresh virtual register of shape `vtype`.
    pub fn new_vreg(&mut self, vtype: VRegType) -> VReg {
        self.vregs.push(VRegData { vtype, reffed: false, konst: None })
    }

    /// Allocate a constant virtual register carrying `value`.
    pub fn new_const(&mut self, value: i64, vtype: VRegType) -> VReg {
        self.vregs.push(VRegData { vtype, reffed: false, konst: Some(value) })
    }

    /// Mark `vreg` as address-taken, forcing it onto the frame.
    pub fn set_reffed(&mut self, vreg: VReg) {
        self.vregs[vreg].reffed = true;
    }

    /// The shape of `vreg`.
    pub fn vtype(&self, vreg: VReg) -> VRegType {
        self.vregs[vreg].vtype
    }

    /// Total number of instructions, mostly for logging.
    pub fn inst_count(&self) -> usize {
        self.layout.iter().map(|&bb| self.blocks[bb].insts.len()).sum()
    }
}

/// Append-only builder used by the front end to grow a [`Function`].
///
/// The builder tracks the current block; instructions are appended there,
/// and helpers allocate destination registers with the right shapes, in the
/// style of an instruction-builder interface.
pub struct FunctionBuilder<'a> {
    /// The function being built.
    pub func: &'a mut Function,
    cur: Block,
}

impl<'a> FunctionBuilder<'a> {
    /// Create a builder positioned at a fresh entry block.
    pub fn new(func: &'a mut Function) -> Self {
        debug_assert!(func.layout.is_empty());
        let entry = func.create_block();
        Self { func, cur: entry }
    }

    /// The block instructions are currently appended to.
    pub fn cur_block(&self) -> Block {
        self.cur
    }

    /// Switch the insertion point to `block`.
    pub fn switch_to_block(&mut self, block: Block) {
        self.cur = block;
    }

    /// Create a block placed right after the current one, without switching
    /// to it.
    pub fn split(&mut self) -> Block {
        let cur = self.cur;
        self.func.split_block(cur)
    }

    /// Create a block placed right after `after`, without switching to it.
    pub fn split_after(&mut self, after: Block) -> Block {
        self.func.split_block(after)
    }

    fn ins(&mut self, inst: InstData) {
        let cur = self.cur;
        self.func.blocks[cur].insts.push(inst);
    }

    /// Allocate a plain register; used when a value is written from more
    /// than one predecessor block (ternaries, short-circuit results).
    pub fn new_reg(&mut self, vtype: VRegType) -> VReg {
        self.func.new_vreg(vtype)
    }

    /// Allocate a constant register.
    pub fn iconst(&mut self, value: i64, vtype: VRegType) -> VReg {
        self.func.new_const(value, vtype)
    }

    /// Take the frame address of `base`.
    pub fn bofs(&mut self, base: VReg) -> VReg {
        let dst = self.func.new_vreg(VRegType::PTR);
        self.ins(InstData::Bofs { dst, base });
        dst
    }

    /// Take the address of `label`.
    pub fn iofs(&mut self, label: Label) -> VReg {
        let dst = self.func.new_vreg(VRegType::PTR);
        self.ins(InstData::Iofs { dst, label });
        dst
    }

    /// Address an outgoing stack-argument slot.
    pub fn sofs(&mut self, offset: i32) -> VReg {
        let dst = self.func.new_vreg(VRegType::PTR);
        self.ins(InstData::Sofs { dst, offset });
        dst
    }

    /// Load a value of shape `vtype` from `addr`.
    pub fn load(&mut self, addr: VReg, vtype: VRegType) -> VReg {
        let dst = self.func.new_vreg(vtype);
        self.ins(InstData::Load { dst, addr });
        dst
    }

    /// Store `src` to `addr`.
    pub fn store(&mut self, addr: VReg, src: VReg) {
        self.ins(InstData::Store { addr, src });
    }

    /// Copy `size` bytes between addresses.
    pub fn memcpy(&mut self, dst: VReg, src: VReg, size: u32) {
        self.ins(InstData::Memcpy { dst, src, size });
    }

    /// Binary arithmetic producing a fresh register of shape `vtype`.
    pub fn binop(&mut self, op: BinOp, lhs: VReg, rhs: VReg, vtype: VRegType) -> VReg {
        let dst = self.func.new_vreg(vtype);
        self.ins(InstData::Bin { op, dst, lhs, rhs });
        dst
    }

    /// Unary arithmetic producing a fresh register of shape `vtype`.
    pub fn unop(&mut self, op: UnOp, src: VReg, vtype: VRegType) -> VReg {
        let dst = self.func.new_vreg(vtype);
        self.ins(InstData::Un { op, dst, src });
        dst
    }

    /// Compare two registers, leaving flags for `jmp`/`cond`.
    pub fn cmp(&mut self, lhs: VReg, rhs: VReg) {
        self.ins(InstData::Cmp { lhs, rhs });
    }

    /// Compare a register against zero.
    pub fn test(&mut self, src: VReg) {
        self.ins(InstData::Test { src });
    }

    /// Materialize the flags as a 0/1 `int`.
    pub fn cond(&mut self, cond: Cond) -> VReg {
        let dst = self.func.new_vreg(VRegType::I32);
        self.ins(InstData::Cond { dst, cond });
        dst
    }

    /// Jump to `dest` when `cond` holds.
    pub fn jmp(&mut self, cond: Cond, dest: Block) {
        self.ins(InstData::Jmp { cond, dest });
    }

    /// Open a call sequence.
    pub fn precall(&mut self, arg_count: u32, stack_bytes: u32) {
        self.ins(InstData::Precall { arg_count, stack_bytes });
    }

    /// Stage one register-passed argument.
    pub fn pusharg(&mut self, src: VReg) {
        self.ins(InstData::PushArg { src });
    }

    /// Call `target`, returning the result register when `ret` is present.
    pub fn call(
        &mut self,
        target: CallTarget,
        reg_args: u32,
        float_mask: u32,
        ret: Option<VRegType>,
    ) -> Option<VReg> {
        let dst = ret.map(|vtype| self.func.new_vreg(vtype));
        self.ins(InstData::Call { dst: dst.into(), target, reg_args, float_mask });
        dst
    }

    /// Set the function return register.
    pub fn result(&mut self, src: VReg) {
        self.ins(InstData::Result { src });
    }

    /// Pointer arithmetic: `base + index * scale + disp`.
    pub fn ptradd(
        &mut self,
        base: VReg,
        index: Option<VReg>,
        scale: u8,
        disp: i64,
        vtype: VRegType,
    ) -> VReg {
        debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
        let dst = self.func.new_vreg(vtype);
        self.ins(InstData::PtrAdd { dst, base, index: index.into(), scale, disp });
        dst
    }

    /// Convert `src` to shape `vtype`.
    pub fn cast(&mut self, src: VReg, vtype: VRegType) -> VReg {
        let dst = self.func.new_vreg(vtype);
        self.ins(InstData::Cast { dst, src });
        dst
    }

    /// Copy `src` into the existing register `dst`.
    pub fn mov(&mut self, dst: VReg, src: VReg) {
        self.ins(InstData::Mov { dst, src });
    }

    /// In-memory increment.
    pub fn inc(&mut self, addr: VReg, size: u8, value: i64) {
        self.ins(InstData::Inc { addr, size, value });
    }

    /// In-memory decrement.
    pub fn dec(&mut self, addr: VReg, size: u8, value: i64) {
        self.ins(InstData::Dec { addr, size, value });
    }

    /// Stack pointer adjustment.
    pub fn addsp(&mut self, bytes: i32) {
        self.ins(InstData::AddSp { bytes });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig_void() -> Signature {
        Signature { params: Vec::new(), ret: Some(VRegType::I32), vaargs: false }
    }

    #[test]
    fn split_preserves_chain_order() {
        let mut func = Function::new("f", true, sig_void());
        let entry = func.create_block();
        let a = func.split_block(entry);
        let b = func.split_block(a);
        let c = func.split_block(b);
        assert_eq!(func.layout, vec![entry, a, b, c]);
        // Splitting after entry again lands between entry and a.
        let d = func.split_block(entry);
        assert_eq!(func.layout, vec![entry, d, a, b, c]);
    }

    #[test]
    fn builder_appends_to_current_block() {
        let mut func = Function::new("f", true, sig_void());
        let mut b = FunctionBuilder::new(&mut func);
        let entry = b.cur_block();
        let k = b.iconst(7, VRegType::I32);
        b.result(k);
        let join = b.split();
        b.switch_to_block(join);
        b.jmp(Cond::Any, entry);
        assert_eq!(func.blocks[entry].insts.len(), 1);
        assert_eq!(func.blocks[join].insts.len(), 1);
        assert!(func.vregs[k].konst.is_some());
    }
}

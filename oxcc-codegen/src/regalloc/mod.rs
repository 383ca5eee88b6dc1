//! Linear-scan register allocation over virtual registers.
//!
//! Allocation works on one function at a time. A single forward walk of the
//! blocks in layout order gives every instruction a linear index; each
//! virtual register gets a live range spanning its first and last mention,
//! extended over loop back edges so a value that enters a loop stays valid
//! until the last back edge that can observe it.
//!
//! Registers come from two banks (general integer and XMM). A register
//! whose range crosses a call site must survive the callee: integer values
//! are then restricted to the callee-saved subset, and floating values are
//! spilled outright since the System V ABI makes every XMM register
//! caller-saved. Address-taken registers, aggregates and constants never
//! receive a physical register at all: the first two are born on the frame
//! and constants are rematerialized at each use.

use crate::ir::{CallTarget, Function, InstData, VReg};
use crate::isa::{RegPools, RegUnit};
use cranelift_entity::SecondaryMap;
use log::debug;

mod register_set;

pub use self::register_set::RegisterSet;

/// Where a virtual register lives after allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// Not yet allocated (or never mentioned).
    None,
    /// A physical register.
    Reg(RegUnit),
    /// A frame slot, as an offset from the frame base register. Negative
    /// offsets are locals and spills; positive offsets address incoming
    /// stack-passed parameters.
    Stack(i32),
    /// A constant rematerialized at each use.
    Imm(i64),
}

impl Default for Allocation {
    fn default() -> Self {
        Allocation::None
    }
}

/// The result of register allocation for one function.
pub struct Allocations {
    /// Location of every virtual register.
    pub locs: SecondaryMap<VReg, Allocation>,
    /// Frame bytes to reserve below the frame base, 16-byte aligned, with
    /// the callee-saved save area included.
    pub frame_size: u32,
    /// Callee-saved registers handed out, with their save-slot offsets.
    pub save_slots: Vec<(RegUnit, i32)>,
}

#[derive(Clone, Copy)]
struct Interval {
    vreg: VReg,
    start: u32,
    end: u32,
    crosses_call: bool,
}

struct FrameLayout {
    size: u32,
}

impl FrameLayout {
    fn alloc(&mut self, size: u32, align: u32) -> i32 {
        let size = size.max(1);
        let align = align.max(1);
        self.size = (self.size + size + align - 1) & !(align - 1);
        -(self.size as i32)
    }
}

/// Offset from the frame base to the first incoming stack parameter
/// (saved frame pointer plus return address).
const INCOMING_ARG_BASE: i32 = 16;

/// Run liveness analysis and linear-scan allocation for `func`.
pub fn run(func: &Function, pools: &RegPools) -> Allocations {
    let mut locs: SecondaryMap<VReg, Allocation> = SecondaryMap::new();
    let mut frame = FrameLayout { size: 0 };

    // Linear position of the first instruction of every block, and the
    // first/last mention of every vreg.
    let mut block_start: SecondaryMap<crate::ir::Block, u32> = SecondaryMap::new();
    let mut first = SecondaryMap::with_default(u32::max_value());
    let mut last: SecondaryMap<VReg, u32> = SecondaryMap::new();
    let mut call_sites = Vec::new();
    let mut back_edges = Vec::new();

    let mut pos = 0u32;
    for &bb in &func.layout {
        block_start[bb] = pos;
        for inst in &func.blocks[bb].insts {
            let mut mention = |v: VReg| {
                if first[v] == u32::max_value() {
                    first[v] = pos;
                }
                last[v] = pos;
            };
            visit_regs(inst, &mut mention);
            match *inst {
                InstData::Call { .. } => call_sites.push(pos),
                InstData::Jmp { dest, .. } => back_edges.push((pos, dest)),
                _ => {}
            }
            pos += 1;
        }
    }

    // Extend ranges over loop back edges: a value defined before the loop
    // head and mentioned at or after it must survive until the jump back.
    let back_edges: Vec<(u32, u32)> = back_edges
        .into_iter()
        .filter_map(|(at, dest)| {
            let start = block_start[dest];
            if start <= at {
                Some((at, start))
            } else {
                None
            }
        })
        .collect();

    let mut intervals = Vec::new();
    for (vreg, data) in func.vregs.iter() {
        if first[vreg] == u32::max_value() {
            continue;
        }
        let mut start = first[vreg];
        let mut end = last[vreg];
        for &(at, head) in &back_edges {
            if start < head && end >= head {
                end = end.max(at);
            }
        }
        // Incoming parameters are live from the function entry.
        if func.params.contains(&vreg) {
            start = 0;
        }
        let crosses_call = call_sites.iter().any(|&c| start < c && c < end);

        if let Some(value) = data.konst {
            locs[vreg] = Allocation::Imm(value);
            continue;
        }
        if data.reffed || data.vtype.size > 8 || (data.vtype.flonum && crosses_call) {
            locs[vreg] = Allocation::Stack(frame.alloc(data.vtype.size, data.vtype.align));
            continue;
        }
        intervals.push(Interval { vreg, start, end, crosses_call });
    }

    // Incoming stack-passed parameters already have a home in the caller's
    // frame; bind them there instead of copying.
    bind_stack_params(func, &mut locs);

    intervals.sort_by_key(|iv| iv.start);

    let mut avail = RegisterSet::new(pools);
    let mut active: Vec<(Interval, RegUnit)> = Vec::new();
    let mut spills = 0usize;

    for iv in intervals {
        if locs[iv.vreg] != Allocation::None {
            continue; // stack-bound parameter
        }
        active.retain(|&(ref old, unit)| {
            if old.end < iv.start {
                avail.free(unit);
                false
            } else {
                true
            }
        });

        let flonum = func.vregs[iv.vreg].vtype.flonum;
        let candidates: &[RegUnit] = if flonum {
            pools.fpr
        } else if iv.crosses_call {
            pools.gpr_callee_saved
        } else {
            pools.gpr
        };

        if let Some(unit) = candidates.iter().cloned().find(|&u| avail.is_avail(u)) {
            avail.take(unit);
            locs[iv.vreg] = Allocation::Reg(unit);
            active.push((iv, unit));
            continue;
        }

        // Bank exhausted: spill whichever of the actives holding an
        // acceptable register ends last, or the new interval itself.
        spills += 1;
        let mut victim: Option<usize> = None;
        for (idx, &(old, unit)) in active.iter().enumerate() {
            if !candidates.contains(&unit) {
                continue;
            }
            match victim {
                Some(best) if active[best].0.end >= old.end => {}
                _ => victim = Some(idx),
            }
        }
        match victim {
            Some(idx) if active[idx].0.end > iv.end => {
                let (old, unit) = active.remove(idx);
                let vt = func.vregs[old.vreg].vtype;
                locs[old.vreg] = Allocation::Stack(frame.alloc(vt.size, vt.align));
                locs[iv.vreg] = Allocation::Reg(unit);
                active.push((iv, unit));
            }
            _ => {
                let vt = func.vregs[iv.vreg].vtype;
                locs[iv.vreg] = Allocation::Stack(frame.alloc(vt.size, vt.align));
            }
        }
    }

    // Reserve save slots for the callee-saved registers we handed out.
    let mut save_slots = Vec::new();
    for &unit in pools.gpr_callee_saved {
        let used = locs
            .values()
            .any(|loc| *loc == Allocation::Reg(unit));
        if used {
            save_slots.push((unit, frame.alloc(8, 8)));
        }
    }

    let frame_size = (frame.size + 15) & !15;
    debug!(
        "{}: {} insts, frame {} bytes, {} spills, {} callee-saved",
        func.name,
        func.inst_count(),
        frame_size,
        spills,
        save_slots.len()
    );

    Allocations { locs, frame_size, save_slots }
}

/// Pre-bind parameters that arrive on the stack to their incoming slots.
fn bind_stack_params(func: &Function, locs: &mut SecondaryMap<VReg, Allocation>) {
    let mut gpr_used = 0usize;
    let mut fpr_used = 0usize;
    let mut stack_offset = INCOMING_ARG_BASE;
    for (i, &vreg) in func.params.iter().enumerate() {
        let vtype = func.signature.params[i];
        let in_reg = if vtype.flonum {
            let ok = fpr_used < 8;
            fpr_used += usize::from(ok);
            ok
        } else if vtype.size > 8 {
            false
        } else {
            let ok = gpr_used < 6;
            gpr_used += usize::from(ok);
            ok
        };
        if !in_reg {
            locs[vreg] = Allocation::Stack(stack_offset);
            stack_offset += ((vtype.size.max(1) + 7) & !7) as i32;
        }
    }
}

fn visit_regs<F: FnMut(VReg)>(inst: &InstData, f: &mut F) {
    match *inst {
        InstData::Bofs { dst, base } => {
            f(dst);
            f(base);
        }
        InstData::Iofs { dst, .. } | InstData::Sofs { dst, .. } => f(dst),
        InstData::Load { dst, addr } => {
            f(dst);
            f(addr);
        }
        InstData::Store { addr, src } => {
            f(addr);
            f(src);
        }
        InstData::Memcpy { dst, src, .. } => {
            f(dst);
            f(src);
        }
        InstData::Bin { dst, lhs, rhs, .. } => {
            f(dst);
            f(lhs);
            f(rhs);
        }
        InstData::Un { dst, src, .. } => {
            f(dst);
            f(src);
        }
        InstData::Cmp { lhs, rhs } => {
            f(lhs);
            f(rhs);
        }
        InstData::Test { src } => f(src),
        InstData::Cond { dst, .. } => f(dst),
        InstData::Jmp { .. } | InstData::Precall { .. } | InstData::AddSp { .. } => {}
        InstData::PushArg { src } => f(src),
        InstData::Call { dst, target, .. } => {
            if let Some(dst) = dst.expand() {
                f(dst);
            }
            if let CallTarget::Reg(r) = target {
                f(r);
            }
        }
        InstData::Result { src } => f(src),
        InstData::PtrAdd { dst, base, index, .. } => {
            f(dst);
            f(base);
            if let Some(index) = index.expand() {
                f(index);
            }
        }
        InstData::Cast { dst, src } | InstData::Mov { dst, src } => {
            f(dst);
            f(src);
        }
        InstData::Inc { addr, .. } | InstData::Dec { addr, .. } => f(addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Cond, FunctionBuilder, Signature, VRegType};
    use crate::isa::x86_64;

    fn build_straightline(n: usize) -> Function {
        let mut func = Function::new(
            "t",
            false,
            Signature { params: Vec::new(), ret: Some(VRegType::I64), vaargs: false },
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            // n long-lived values, all overlapping.
            let mut vs = Vec::new();
            for i in 0..n {
                let k = b.iconst(i as i64, VRegType::I64);
                let v = b.binop(BinOp::Add, k, k, VRegType::I64);
                vs.push(v);
            }
            let mut acc = vs[0];
            for &v in &vs[1..] {
                acc = b.binop(BinOp::Add, acc, v, VRegType::I64);
            }
            b.result(acc);
        }
        func
    }

    #[test]
    fn constants_become_immediates() {
        let func = build_straightline(2);
        let allocs = run(&func, x86_64::reg_pools());
        let imm = func
            .vregs
            .keys()
            .filter(|&v| matches!(allocs.locs[v], Allocation::Imm(_)))
            .count();
        assert_eq!(imm, 2);
    }

    #[test]
    fn overlapping_ranges_never_share_a_register() {
        let func = build_straightline(12);
        let pools = x86_64::reg_pools();
        let allocs = run(&func, pools);

        // Recompute simple mention ranges and check pairwise disjointness
        // for identical register assignments.
        let mut first = std::collections::HashMap::new();
        let mut last = std::collections::HashMap::new();
        let mut pos = 0u32;
        for &bb in &func.layout {
            for inst in &func.blocks[bb].insts {
                visit_regs(inst, &mut |v| {
                    first.entry(v).or_insert(pos);
                    last.insert(v, pos);
                });
                pos += 1;
            }
        }
        let regs: Vec<(VReg, RegUnit)> = func
            .vregs
            .keys()
            .filter_map(|v| match allocs.locs[v] {
                Allocation::Reg(u) => Some((v, u)),
                _ => None,
            })
            .collect();
        for (i, &(a, ua)) in regs.iter().enumerate() {
            for &(b, ub) in &regs[i + 1..] {
                if ua != ub {
                    continue;
                }
                let disjoint = last[&a] < first[&b] || last[&b] < first[&a];
                assert!(disjoint, "{} and {} share {}", a, b, ua);
            }
        }
    }

    #[test]
    fn pressure_forces_spills() {
        let func = build_straightline(12);
        let allocs = run(&func, x86_64::reg_pools());
        let spilled = func
            .vregs
            .keys()
            .filter(|&v| matches!(allocs.locs[v], Allocation::Stack(_)))
            .count();
        assert!(spilled > 0, "12 overlapping values must not fit in 6 registers");
        assert!(allocs.frame_size % 16 == 0);
    }

    #[test]
    fn reffed_values_live_on_the_frame() {
        let mut func = Function::new(
            "t",
            false,
            Signature { params: Vec::new(), ret: None, vaargs: false },
        );
        let v;
        {
            let mut b = FunctionBuilder::new(&mut func);
            v = b.new_reg(VRegType::I32);
            let a = b.bofs(v);
            let k = b.iconst(1, VRegType::I32);
            b.store(a, k);
            b.jmp(Cond::Any, b.cur_block());
        }
        func.set_reffed(v);
        let allocs = run(&func, x86_64::reg_pools());
        assert!(matches!(allocs.locs[v], Allocation::Stack(off) if off < 0));
    }
}

use bitvec::vec::BitVec;

use crate::{
    block::{BlockId, Phi, PhiArg},
    edge::{EdgeFlags, EdgeId},
    procedure::Procedure,
    profile::{edge_frequency, BRANCH_PROB_BASE},
    stmt::{SourceLocation, Stmt},
};

/// Clones `bb`: statements, phis (with empty argument lists; slots appear as
/// predecessors are wired in), and all outgoing edges with their flags,
/// profile and annotations. The copy lands in the loop the copy table says
/// copies of `bb`'s loop belong to.
pub fn duplicate_block(proc: &mut Procedure, bb: BlockId) -> BlockId {
    let frequency = proc.block(bb).frequency();
    let count = proc.block(bb).count();
    let new_bb = proc.add_block(frequency);
    proc.block_mut(new_bb).count = count;

    let stmts = proc.block(bb).stmts().to_vec();
    proc.block_mut(new_bb).stmts = stmts;
    let phis: Vec<Phi> = proc
        .block(bb)
        .phis()
        .iter()
        .map(|phi| Phi {
            result: phi.result,
            args: Vec::new(),
        })
        .collect();
    proc.block_mut(new_bb).phis = phis;

    for e in proc.block(bb).succs().to_vec() {
        let (dest, flags, probability, count, aux) = {
            let edge = proc.edge(e);
            (
                edge.dest,
                edge.flags,
                edge.probability,
                edge.count,
                edge.aux.clone(),
            )
        };
        let ne = proc.make_edge(new_bb, dest, flags);
        let new_edge = proc.edge_mut(ne);
        new_edge.probability = probability;
        new_edge.count = count;
        new_edge.aux = aux;
    }

    if proc.has_loops() {
        let cloop = proc.loop_father(bb);
        let copy = proc.loops().get_loop_copy(cloop).unwrap_or(cloop);
        proc.add_bb_to_loop(new_bb, copy);
    }
    new_bb
}

/// Redirects `e` to `dest` and returns the surviving edge. A redirected
/// switch edge merges into an existing parallel edge; everything else is
/// retargeted in place. The phi arguments `e` carried at its old destination
/// are parked in the pending table for `flush_pending_phi_args`.
pub fn redirect_edge_and_branch(proc: &mut Procedure, e: EdgeId, dest: BlockId) -> EdgeId {
    let src = proc.edge(e).src;
    let old_dest = proc.edge(e).dest;
    if old_dest == dest {
        return e;
    }

    if matches!(proc.block(src).ctrl_stmt(), Some(Stmt::Switch { .. })) {
        if let Some(existing) = proc.find_edge(src, dest) {
            let (probability, count) = {
                let edge = proc.edge(e);
                (edge.probability, edge.count)
            };
            let survivor = proc.edge_mut(existing);
            survivor.probability = (survivor.probability + probability).min(BRANCH_PROB_BASE);
            survivor.count += count;
            proc.remove_edge(e);
            return existing;
        }
    }

    proc.pending_phi_args.swap_remove(&e);
    let slot = proc.pred_index(old_dest, e);
    let saved: Vec<PhiArg> = proc
        .block(old_dest)
        .phis()
        .iter()
        .map(|phi| phi.args[slot])
        .collect();
    proc.pending_phi_args.insert(e, saved);

    proc.detach_edge_from_dest(e);
    proc.attach_edge_to_dest(e, dest);
    e
}

/// Writes the phi arguments parked by a redirect of `e` into the phis of its
/// current destination.
pub fn flush_pending_phi_args(proc: &mut Procedure, e: EdgeId) {
    let Some(saved) = proc.pending_phi_args.swap_remove(&e) else {
        return;
    };
    let dest = proc.edge(e).dest;
    let slot = proc.pred_index(dest, e);
    let block = proc.block_mut(dest);
    assert_eq!(
        saved.len(),
        block.phis.len(),
        "pending phi arguments do not line up with the destination's phis"
    );
    for (phi, arg) in block.phis.iter_mut().zip(saved) {
        phi.args[slot] = arg;
    }
}

/// Inserts a fresh block along `e`. The phi argument `e` carried at its old
/// destination migrates to the new block's fall-through edge.
pub fn split_edge(proc: &mut Procedure, e: EdgeId) -> BlockId {
    let src = proc.edge(e).src;
    let dest = proc.edge(e).dest;
    let count = proc.edge(e).count;

    let nb = proc.add_block(edge_frequency(proc, e));
    proc.block_mut(nb).count = count;
    let ne = proc.make_edge(nb, dest, EdgeFlags::FALLTHRU);
    proc.edge_mut(ne).probability = BRANCH_PROB_BASE;
    proc.edge_mut(ne).count = count;

    let old_slot = proc.pred_index(dest, e);
    let new_slot = proc.pred_index(dest, ne);
    for phi in &mut proc.block_mut(dest).phis {
        phi.args[new_slot] = phi.args[old_slot];
    }

    proc.detach_edge_from_dest(e);
    proc.attach_edge_to_dest(e, nb);

    if proc.has_loops() {
        let common = common_loop(proc, src, dest);
        proc.add_bb_to_loop(nb, common);
    }
    nb
}

fn common_loop(proc: &Procedure, a: BlockId, b: BlockId) -> crate::loops::LoopId {
    let mut fa = proc.loop_father(a);
    let mut fb = proc.loop_father(b);
    while proc.loops().depth(fa) > proc.loops().depth(fb) {
        fa = proc.loops().outer(fa).unwrap();
    }
    while proc.loops().depth(fb) > proc.loops().depth(fa) {
        fb = proc.loops().outer(fb).unwrap();
    }
    while fa != fb {
        fa = proc.loops().outer(fa).unwrap();
        fb = proc.loops().outer(fb).unwrap();
    }
    fa
}

/// Splits `bb` into a forwarder (labels only) and a real part holding the
/// statements, control statement and outgoing edges. Predecessor edges for
/// which `keep` holds stay on the forwarder; the rest move to the real part,
/// carrying their phi arguments with them. The phis split SSA-correctly: the
/// forwarder keeps the merge of the edges it retains under fresh names, and
/// the real part re-merges those with the moved edges. Returns the
/// forwarder-to-real fall-through edge.
pub fn make_forwarder_block(
    proc: &mut Procedure,
    bb: BlockId,
    keep: impl Fn(&Procedure, EdgeId) -> bool,
) -> EdgeId {
    let split_at = proc
        .block(bb)
        .stmts()
        .iter()
        .position(|s| !matches!(s, Stmt::Label(_)))
        .unwrap_or(proc.block(bb).stmts().len());

    let frequency = proc.block(bb).frequency();
    let count = proc.block(bb).count();
    let real = proc.add_block(frequency);
    proc.block_mut(real).count = count;

    let moved = proc.block_mut(bb).stmts.split_off(split_at);
    proc.block_mut(real).stmts = moved;

    for e in std::mem::take(&mut proc.block_mut(bb).succs) {
        proc.edge_mut(e).src = real;
        proc.block_mut(real).succs.push(e);
    }

    // The real part re-merges the forwarder's phis through fresh names.
    let phi_results: Vec<_> = proc.block(bb).phis().iter().map(|p| p.result).collect();
    for result in &phi_results {
        proc.block_mut(real).phis.push(Phi {
            result: *result,
            args: Vec::new(),
        });
    }
    let mut forwarder_names = Vec::with_capacity(phi_results.len());
    for i in 0..phi_results.len() {
        let name = proc.new_ssa_name();
        proc.block_mut(bb).phis[i].result = name;
        forwarder_names.push(name);
    }

    let fallthru = proc.make_edge(bb, real, EdgeFlags::FALLTHRU);
    proc.edge_mut(fallthru).probability = BRANCH_PROB_BASE;
    proc.edge_mut(fallthru).count = count;
    let fallthru_slot = proc.pred_index(real, fallthru);
    for (i, name) in forwarder_names.iter().enumerate() {
        proc.block_mut(real).phis[i].args[fallthru_slot] = PhiArg {
            def: *name,
            location: SourceLocation::UNKNOWN,
        };
    }

    for e in proc.block(bb).preds().to_vec() {
        if keep(proc, e) {
            continue;
        }
        let slot = proc.pred_index(bb, e);
        let args: Vec<PhiArg> = proc
            .block(bb)
            .phis()
            .iter()
            .map(|phi| phi.args[slot])
            .collect();
        proc.detach_edge_from_dest(e);
        proc.attach_edge_to_dest(e, real);
        let new_slot = proc.pred_index(real, e);
        for (i, arg) in args.into_iter().enumerate() {
            proc.block_mut(real).phis[i].args[new_slot] = arg;
        }
    }

    if proc.has_loops() {
        let father = proc.loop_father(bb);
        proc.add_bb_to_loop(real, father);
    }
    fallthru
}

/// Enumerates blocks reachable from `start` (through predecessors when
/// `reverse`) visiting only blocks the predicate admits.
pub fn dfs_enumerate_from(
    proc: &Procedure,
    start: BlockId,
    reverse: bool,
    predicate: impl Fn(&Procedure, BlockId) -> bool,
) -> Vec<BlockId> {
    let mut visited: BitVec = BitVec::repeat(false, proc.num_blocks());
    let mut result = Vec::new();
    let mut stack = Vec::new();

    if predicate(proc, start) {
        visited.set(start.0, true);
        result.push(start);
        stack.push(start);
    }
    while let Some(bb) = stack.pop() {
        let edges = if reverse {
            proc.block(bb).preds().to_vec()
        } else {
            proc.block(bb).succs().to_vec()
        };
        for e in edges {
            let next = if reverse {
                proc.edge(e).src
            } else {
                proc.edge(e).dest
            };
            if !visited[next.0] && predicate(proc, next) {
                visited.set(next.0, true);
                result.push(next);
                stack.push(next);
            }
        }
    }
    result
}

/// True if the block does nothing but transfer control: only labels, debug
/// markers and nops before the (optional) control statement.
pub fn is_redirection_block(proc: &Procedure, bb: BlockId) -> bool {
    let mut stmts = proc.block(bb).stmts().iter().skip_while(|s| s.is_filler());
    match stmts.next() {
        None => true,
        Some(s) => s.is_ctrl() && stmts.next().is_none(),
    }
}

/// True if the block carries no statements other than labels.
pub fn is_empty_block(proc: &Procedure, bb: BlockId) -> bool {
    proc.block(bb)
        .stmts()
        .iter()
        .all(|s| matches!(s, Stmt::Label(_)))
}

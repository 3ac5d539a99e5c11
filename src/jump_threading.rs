//! Thread edges through blocks and update the control flow and SSA graphs.
//!
//! Given a block B, redirect one or more in-edges of B to reach the
//! destination of an out-edge of B while preserving B's side effects:
//! given A->B and B->C, turn A->B into A->C through a duplicate B' of B.
//!
//! Upstream analyses register paths describing which incoming edges can
//! bypass which branches; `thread_through_all_blocks` performs all of the
//! pending rewrites at once. Incoming edges that share the same path suffix
//! are grouped so each unique suffix costs a single duplicate, and the
//! first duplicate serves as a template for the rest.

use bitvec::vec::BitVec;
use indexmap::map::Entry;
use indexmap::IndexMap;

use crate::{
    block::BlockId,
    cfg::{
        dfs_enumerate_from, duplicate_block, flush_pending_phi_args, is_empty_block,
        is_redirection_block, make_forwarder_block, redirect_edge_and_branch, split_edge,
    },
    dbg_cnt::dbg_cnt,
    edge::{EdgeFlags, EdgeId},
    loops::{create_preheader, LoopId, LoopsState},
    procedure::Procedure,
    profile::{edge_frequency, update_bb_profile_for_threading, BB_FREQ_MAX, BRANCH_PROB_BASE},
    stats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadEdgeKind {
    /// The incoming edge that triggers the threading; always step 0.
    #[default]
    Start,
    /// A block whose statements must be duplicated along the path.
    CopySrc,
    /// A block with multiple predecessors whose control statement is kept.
    CopySrcJoiner,
    /// A block traversed but not duplicated.
    NoCopySrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JumpThreadEdge {
    pub edge: EdgeId,
    pub kind: ThreadEdgeKind,
}

impl JumpThreadEdge {
    pub fn new(edge: EdgeId, kind: ThreadEdgeKind) -> Self {
        Self { edge, kind }
    }
}

/// An ordered walk from an incoming edge to the final destination. Step 0 is
/// always `Start`; step 1 decides plain-copy vs. joiner handling; the last
/// step's edge destination is where the threaded jump lands.
pub type ThreadPath = Vec<JumpThreadEdge>;

/// Hash key for grouping incoming edges behind one duplicate. Two paths
/// belong together when everything past step 0 matches; the incoming edge
/// itself is deliberately excluded so distinct predecessors share a
/// duplicate. The hash is just the final destination's block index.
struct PathKey {
    final_dest: BlockId,
    suffix: Vec<(ThreadEdgeKind, EdgeId)>,
}

impl PathKey {
    fn new(proc: &Procedure, path: &ThreadPath) -> Self {
        Self {
            final_dest: proc.edge(path.last().unwrap().edge).dest,
            suffix: path[1..].iter().map(|s| (s.kind, s.edge)).collect(),
        }
    }
}

impl std::hash::Hash for PathKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.final_dest.0.hash(state);
    }
}

impl PartialEq for PathKey {
    fn eq(&self, other: &Self) -> bool {
        self.suffix == other.suffix
    }
}

impl Eq for PathKey {}

/// Bookkeeping for one unique path suffix while a block is processed.
struct RedirectionEntry {
    /// The path all grouped edges follow past their starting step.
    path: ThreadPath,
    /// The duplicate serving this suffix, once created.
    dup_block: Option<BlockId>,
    /// Incoming edges waiting to be redirected to the duplicate.
    incoming_edges: Vec<EdgeId>,
}

type RedirectionTable = IndexMap<PathKey, RedirectionEntry>;

/// Finds the entry for the path attached to `e`. With `insert`, a fresh
/// suffix takes ownership of the edge's path and starts a new incoming
/// list; a known suffix just gains `e` as another incoming edge.
fn lookup_redirection_data<'a>(
    proc: &mut Procedure,
    table: &'a mut RedirectionTable,
    e: EdgeId,
    insert: bool,
) -> Option<&'a mut RedirectionEntry> {
    let key = PathKey::new(proc, proc.edge(e).aux.as_ref().expect("edge carries no path"));
    if !insert {
        return table.get_mut(&key);
    }
    match table.entry(key) {
        Entry::Occupied(slot) => {
            let entry = slot.into_mut();
            entry.incoming_edges.push(e);
            Some(entry)
        }
        Entry::Vacant(slot) => {
            let path = proc.edge_mut(e).aux.take().unwrap();
            Some(slot.insert(RedirectionEntry {
                path,
                dup_block: None,
                incoming_edges: vec![e],
            }))
        }
    }
}

#[derive(Default)]
struct ThreadStats {
    num_threaded_edges: u64,
}

/// Removes the trailing control statement, if any, and every outgoing edge
/// that does not reach `dest_bb` (all of them when `dest_bb` is `None`).
fn remove_ctrl_stmt_and_useless_edges(proc: &mut Procedure, bb: BlockId, dest_bb: Option<BlockId>) {
    // A copy of the template may have no statements at all.
    if proc.block(bb).ctrl_stmt().is_some() {
        proc.block_mut(bb).stmts_mut().pop();
    }
    for e in proc.block(bb).succs().to_vec() {
        if Some(proc.edge(e).dest) != dest_bb {
            proc.remove_edge(e);
        }
    }
}

/// Duplicates `bb` for threading: annotations on the copied outgoing edges
/// are dropped and the profile is zeroed, the copy being unreachable until
/// it is wired up.
fn create_block_for_threading(
    proc: &mut Procedure,
    bb: BlockId,
    rd: &mut RedirectionEntry,
) -> BlockId {
    let dup = duplicate_block(proc, bb);
    for e in proc.block(dup).succs().to_vec() {
        proc.edge_mut(e).aux = None;
    }
    // Zero out the profile; the block is unreachable for now.
    proc.block_mut(dup).frequency = 0;
    proc.block_mut(dup).count = 0;
    rd.dup_block = Some(dup);
    dup
}

/// For every phi in `bb`, copies the argument carried by `src_e` into the
/// slot of `tgt_e`, source location included.
fn copy_phi_args(proc: &mut Procedure, bb: BlockId, src_e: EdgeId, tgt_e: EdgeId) {
    let src_slot = proc.pred_index(bb, src_e);
    let tgt_slot = proc.pred_index(bb, tgt_e);
    for phi in &mut proc.block_mut(bb).phis {
        phi.args[tgt_slot] = phi.args[src_slot];
    }
}

/// `new_bb` was just copied from `orig_bb` together with its outgoing
/// edges. Initialize the phi arguments of every successor along the copied
/// edges to match the originals.
fn update_destination_phis(proc: &mut Procedure, orig_bb: BlockId, new_bb: BlockId) {
    for e in proc.block(orig_bb).succs().to_vec() {
        let dest = proc.edge(e).dest;
        let e2 = proc
            .find_edge(new_bb, dest)
            .expect("the copy has a parallel edge to every successor");
        copy_phi_args(proc, dest, e, e2);
    }
}

/// Wires `bb` (a duplicate with no outgoing edges) straight to the path's
/// final destination and mirrors the phi arguments the original final edge
/// carried there. A nested thread registered on the final edge is cloned
/// onto the new edge.
fn create_edge_and_update_destination_phis(proc: &mut Procedure, path: &ThreadPath, bb: BlockId) {
    let last_e = path.last().unwrap().edge;
    let dest = proc.edge(last_e).dest;
    let e = proc.make_edge(bb, dest, EdgeFlags::FALLTHRU);
    let count = proc.block(bb).count();
    proc.edge_mut(e).probability = BRANCH_PROB_BASE;
    proc.edge_mut(e).count = count;

    let nested = proc.edge(last_e).aux.clone();
    proc.edge_mut(e).aux = nested;

    copy_phi_args(proc, dest, last_e, e);
}

/// Wires up the outgoing edges of a duplicate. A joiner duplicate keeps its
/// control statement and has the edge paralleling the joiner step redirected
/// to the final destination; a plain duplicate is stripped down to a single
/// fall-through edge.
fn fix_duplicate_block_edges(proc: &mut Procedure, bb: BlockId, rd: &RedirectionEntry) {
    let dup = rd.dup_block.expect("duplicate was created");
    if rd.path[1].kind == ThreadEdgeKind::CopySrcJoiner {
        update_destination_phis(proc, bb, dup);

        let victim = proc
            .find_edge(dup, proc.edge(rd.path[1].edge).dest)
            .expect("the duplicate parallels the joiner edge");
        let last_e = rd.path.last().unwrap().edge;
        let final_dest = proc.edge(last_e).dest;
        let e2 = redirect_edge_and_branch(proc, victim, final_dest);
        let last_count = proc.edge(last_e).count;
        proc.edge_mut(e2).count = last_count;

        // If the redirect reused an existing parallel edge, the target's
        // phis already carry the right arguments.
        if e2 == victim {
            copy_phi_args(proc, final_dest, last_e, e2);
        }
    } else {
        remove_ctrl_stmt_and_useless_edges(proc, dup, None);
        create_edge_and_update_destination_phis(proc, &rd.path, dup);
    }
}

/// One mode of `thread_block`: handles either the plain-copy paths or the
/// joiner paths attached to predecessors of `bb`.
fn thread_block_edges(
    proc: &mut Procedure,
    thread_stats: &mut ThreadStats,
    bb: BlockId,
    noloop_only: bool,
    joiners: bool,
) -> bool {
    let mut redirection_data: RedirectionTable =
        IndexMap::with_capacity(proc.block(bb).succs().len());
    let loop_ = proc.loop_father(bb);

    // Threading the latch to a loop exit makes the loop cease to exist; do
    // not restrict the update in order to preserve it.
    if proc.loops().loop_(loop_).header == Some(bb) {
        if let Some(latch_e) = proc.latch_edge(loop_) {
            let mode_matches = proc.edge(latch_e).aux.as_ref().is_some_and(|path| {
                (path[1].kind == ThreadEdgeKind::CopySrcJoiner && joiners)
                    || (path[1].kind == ThreadEdgeKind::CopySrc && !joiners)
            });
            if mode_matches {
                let steps: Vec<EdgeId> = proc.edge(latch_e).aux.as_ref().unwrap()[1..]
                    .iter()
                    .map(|s| s.edge)
                    .collect();
                if steps.iter().any(|e2| proc.is_loop_exit_edge(loop_, *e2)) {
                    let lp = proc.loops_mut().loop_mut(loop_);
                    lp.header = None;
                    lp.latch = None;
                    proc.loops_mut().state_set(LoopsState::NEED_FIXUP);
                }
            }
        }
    }

    // Group each annotated predecessor by its path suffix.
    for e in proc.block(bb).preds().to_vec() {
        let Some((kind1, e2)) = proc
            .edge(e)
            .aux
            .as_ref()
            .map(|p| (p[1].kind, p.last().unwrap().edge))
        else {
            continue;
        };
        if (kind1 == ThreadEdgeKind::CopySrcJoiner && !joiners)
            || (kind1 == ThreadEdgeKind::CopySrc && joiners)
        {
            continue;
        }

        if noloop_only {
            // Threading through a loop header is only allowed towards an
            // exit; the header itself is handled by the loop-header
            // threader, so leave its requests alone here.
            let father = proc.loop_father(bb);
            if proc.loops().loop_(father).header == Some(bb)
                && (!proc.is_loop_exit_edge(father, e2) || kind1 == ThreadEdgeKind::CopySrcJoiner)
            {
                continue;
            }

            // A loop header buried inside the path has no special handler;
            // cancel the request outright.
            let e2_src_father = proc.loop_father(proc.edge(e2).src);
            let e2_dest_father = proc.loop_father(proc.edge(e2).dest);
            if (father != e2_src_father && !proc.is_loop_exit_edge(e2_src_father, e2))
                || (e2_src_father != e2_dest_father && !proc.is_loop_exit_edge(e2_src_father, e2))
            {
                proc.edge_mut(e).aux = None;
                continue;
            }
        }

        if bb == proc.edge(e2).src {
            let taken = proc.edge(e).aux.as_ref().unwrap()[1].edge;
            let freq = edge_frequency(proc, e);
            let count = proc.edge(e).count;
            update_bb_profile_for_threading(proc, bb, freq, count, taken);
        }

        lookup_redirection_data(proc, &mut redirection_data, e, true);
    }

    // Dominance information is not kept up to date.
    proc.invalidate_dominators();

    // Header-to-exit threading does not give the loop a new entry; let the
    // duplication machinery place copies in the enclosing loop.
    let is_own_header = |proc: &Procedure| {
        let father = proc.loop_father(bb);
        proc.loops().loop_(father).header == Some(bb)
    };
    if noloop_only && is_own_header(proc) {
        let father = proc.loop_father(bb);
        let outer = proc.loops().outer(father).unwrap_or(LoopId::root());
        proc.loops_mut().set_loop_copy(father, Some(outer));
    }

    // Create the duplicates. The first entry becomes the template; in plain
    // mode it is stripped right away so later copies never carry edges that
    // would only be deleted again. Non-template duplicates are wired as
    // they are created; the template itself is wired in a second pass, once
    // no further copies will be made from it.
    let mut template_block: Option<BlockId> = None;
    for i in 0..redirection_data.len() {
        if let Some(template) = template_block {
            let rd = redirection_data.get_index_mut(i).unwrap().1;
            create_block_for_threading(proc, template, rd);
            let rd = redirection_data.get_index(i).unwrap().1;
            fix_duplicate_block_edges(proc, bb, rd);
        } else {
            let rd = redirection_data.get_index_mut(i).unwrap().1;
            let dup = create_block_for_threading(proc, bb, rd);
            if !joiners {
                remove_ctrl_stmt_and_useless_edges(proc, dup, None);
            }
            template_block = Some(dup);
        }
    }

    for i in 0..redirection_data.len() {
        let rd = redirection_data.get_index(i).unwrap().1;
        if rd.dup_block.is_some() && rd.dup_block == template_block {
            fix_duplicate_block_edges(proc, bb, rd);
            break;
        }
    }

    // Redirect each incoming edge to its duplicate, moving its profile
    // contribution over.
    let mut jumps_threaded = false;
    for i in 0..redirection_data.len() {
        let (dup_block, kind1, incoming) = {
            let rd = redirection_data.get_index_mut(i).unwrap().1;
            (
                rd.dup_block,
                rd.path[1].kind,
                std::mem::take(&mut rd.incoming_edges),
            )
        };
        for e in &incoming {
            thread_stats.num_threaded_edges += 1;

            if let Some(dup) = dup_block {
                if proc.options.dump_jump_threads {
                    eprintln!(
                        "  Threaded jump {} -> {} to {}",
                        proc.edge(*e).src.0,
                        proc.edge(*e).dest.0,
                        dup.0
                    );
                }

                let count = proc.edge(*e).count;
                let freq = edge_frequency(proc, *e);
                let block = proc.block_mut(dup);
                block.count += count;
                // Excessive threading can overflow the frequency sums.
                if block.frequency < BB_FREQ_MAX * 2 {
                    block.frequency += freq;
                }

                // A joiner duplicate's outgoing edges were already updated
                // when they were redirected.
                if kind1 != ThreadEdgeKind::CopySrcJoiner {
                    let out = proc.block(dup).succs()[0];
                    proc.edge_mut(out).count += count;
                }

                let e2 = redirect_edge_and_branch(proc, *e, dup);
                assert_eq!(e2, *e, "redirecting an incoming edge must keep it");
                flush_pending_phi_args(proc, e2);
            }

            // Failing to clear the annotation here corrupts later passes.
            proc.edge_mut(*e).aux = None;
        }
        if !incoming.is_empty() {
            jumps_threaded = true;
        }
    }

    drop(redirection_data);

    if noloop_only && is_own_header(proc) {
        let father = proc.loop_father(bb);
        proc.loops_mut().set_loop_copy(father, None);
    }

    jumps_threaded
}

/// Threads all pending requests through `bb`. Plain paths go first: copying
/// a joiner block earlier could expose spurious new opportunities.
fn thread_block(
    proc: &mut Procedure,
    thread_stats: &mut ThreadStats,
    bb: BlockId,
    noloop_only: bool,
) -> bool {
    let mut retval = thread_block_edges(proc, thread_stats, bb, noloop_only, false);
    retval |= thread_block_edges(proc, thread_stats, bb, noloop_only, true);
    retval
}

/// Threads `e` through its destination along a one-step plain path. Returns
/// the copy that now receives `e`, or the destination itself when it had no
/// other predecessor and could simply be simplified in place.
fn thread_single_edge(proc: &mut Procedure, thread_stats: &mut ThreadStats, e: EdgeId) -> BlockId {
    let bb = proc.edge(e).dest;
    let path = proc.edge_mut(e).aux.take().expect("edge carries a path");
    let eto = path[1].edge;
    drop(path);

    thread_stats.num_threaded_edges += 1;

    if proc.single_pred(bb).is_some() {
        // Strip the control statement and the edges it fed; the remaining
        // edge becomes a fall-through.
        let eto_dest = proc.edge(eto).dest;
        remove_ctrl_stmt_and_useless_edges(proc, bb, Some(eto_dest));
        let edge = proc.edge_mut(eto);
        edge.flags
            .remove(EdgeFlags::TRUE_VALUE | EdgeFlags::FALSE_VALUE | EdgeFlags::ABNORMAL);
        edge.flags.insert(EdgeFlags::FALLTHRU);
        return bb;
    }

    if bb == proc.edge(eto).src {
        let freq = edge_frequency(proc, e);
        let count = proc.edge(e).count;
        update_bb_profile_for_threading(proc, bb, freq, count, eto);
    }

    let npath: ThreadPath = vec![
        JumpThreadEdge::new(e, ThreadEdgeKind::Start),
        JumpThreadEdge::new(eto, ThreadEdgeKind::CopySrc),
    ];
    let mut rd = RedirectionEntry {
        path: npath,
        dup_block: None,
        incoming_edges: Vec::new(),
    };
    let dup = create_block_for_threading(proc, bb, &mut rd);
    remove_ctrl_stmt_and_useless_edges(proc, dup, None);
    create_edge_and_update_destination_phis(proc, &rd.path, dup);

    if proc.options.dump_jump_threads {
        eprintln!(
            "  Threaded jump {} -> {} to {}",
            proc.edge(e).src.0,
            proc.edge(e).dest.0,
            dup.0
        );
    }

    let count = proc.edge(e).count;
    let freq = edge_frequency(proc, e);
    proc.block_mut(dup).count = count;
    proc.block_mut(dup).frequency = freq;
    let out = proc.single_succ(dup).unwrap();
    proc.edge_mut(out).count = count;
    redirect_edge_and_branch(proc, e, dup);
    flush_pending_phi_args(proc, e);

    dup
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomStatus {
    /// The block does not dominate the latch.
    Nondominating,
    /// There is no longer a path from the header to the latch.
    LoopBroken,
    /// The block dominates the latch.
    Dominating,
}

/// How `bb` relates to the latch of `l`. Assumes `bb` is a successor of the
/// loop header; anything else is reported as non-dominating, which is
/// always safe.
fn determine_bb_domination_status(proc: &Procedure, l: LoopId, bb: BlockId) -> DomStatus {
    let header = proc.loops().loop_(l).header.unwrap();
    let latch = proc.loops().loop_(l).latch.unwrap();

    if !proc
        .block(bb)
        .preds()
        .iter()
        .any(|e| proc.edge(*e).src == header)
    {
        return DomStatus::Nondominating;
    }
    if bb == latch {
        return DomStatus::Dominating;
    }

    // Walk backwards from the latch, stopping at `bb` and the header. If we
    // reach the header some path avoids `bb`; if we never see `bb` at all
    // the loop body has come apart.
    let mut bb_reachable = false;
    for b in dfs_enumerate_from(proc, latch, true, |_, x| x != bb && x != header) {
        for e in proc.block(b).preds() {
            let src = proc.edge(*e).src;
            if src == header {
                return DomStatus::Nondominating;
            }
            if src == bb {
                bb_reachable = true;
            }
        }
    }
    if bb_reachable {
        DomStatus::Dominating
    } else {
        DomStatus::LoopBroken
    }
}

fn cancel_header_threads(proc: &mut Procedure, header: BlockId) -> bool {
    for e in proc.block(header).preds().to_vec() {
        proc.edge_mut(e).aux = None;
    }
    false
}

/// Threads jumps through the header of `l`. Only two shapes are handled,
/// both of which keep the loop describable: propagating the latch edge to a
/// block that dominates the latch (which peels the old header out of the
/// loop), and propagating all entry edges to a single dominating block
/// (which rotates the loop and builds a fresh latch). Everything else
/// cancels the requests. When `may_peel_loop_headers` is false, entry edges
/// are only threaded through headers that are pure redirection blocks.
fn thread_through_loop_header(
    proc: &mut Procedure,
    thread_stats: &mut ThreadStats,
    l: LoopId,
    may_peel_loop_headers: bool,
) -> bool {
    let header = proc.loops().loop_(l).header.expect("live loop");
    let Some(latch_e) = proc.latch_edge(l) else {
        return cancel_header_threads(proc, header);
    };

    // Threading through a header with a single successor gains nothing.
    if proc.single_succ(header).is_some() {
        return cancel_header_threads(proc, header);
    }

    let latch_annotated = proc.edge(latch_e).aux.is_some();
    let mut tgt_edge: Option<EdgeId> = None;
    let tgt_bb: BlockId;

    if latch_annotated {
        let (kind1, e1) = {
            let path = proc.edge(latch_e).aux.as_ref().unwrap();
            (path[1].kind, path[1].edge)
        };
        if kind1 == ThreadEdgeKind::CopySrcJoiner {
            return cancel_header_threads(proc, header);
        }
        tgt_edge = Some(e1);
        tgt_bb = proc.edge(e1).dest;
    } else if !may_peel_loop_headers && !is_redirection_block(proc, header) {
        return cancel_header_threads(proc, header);
    } else {
        let mut tgt: Option<BlockId> = None;
        for e in proc.block(header).preds().to_vec() {
            let Some((kind1, e1)) = proc
                .edge(e)
                .aux
                .as_ref()
                .map(|p| (p[1].kind, p[1].edge))
            else {
                if e == latch_e {
                    continue;
                }
                // An unthreaded entry edge next to threaded ones would
                // leave the loop with two entry points.
                return cancel_header_threads(proc, header);
            };
            if kind1 == ThreadEdgeKind::CopySrcJoiner {
                return cancel_header_threads(proc, header);
            }
            let atgt = proc.edge(e1).dest;
            match tgt {
                None => tgt = Some(atgt),
                // Two targets would also make the loop multi-entry.
                Some(t) if t != atgt => return cancel_header_threads(proc, header),
                _ => {}
            }
            tgt_edge = Some(e1);
        }
        let Some(t) = tgt else {
            // No threading requests at all.
            return false;
        };
        let latch_block = proc.loops().loop_(l).latch.unwrap();
        if t == latch_block && is_empty_block(proc, latch_block) {
            // Redirecting everything to an empty latch is useless.
            return cancel_header_threads(proc, header);
        }
        tgt_bb = t;
    }

    let mut tgt_bb = tgt_bb;
    match determine_bb_domination_status(proc, l, tgt_bb) {
        DomStatus::Nondominating => return cancel_header_threads(proc, header),
        DomStatus::LoopBroken => {
            // The loop ceased to exist; mark it and thread through its
            // former header like any other block.
            let lp = proc.loops_mut().loop_mut(l);
            lp.header = None;
            lp.latch = None;
            proc.loops_mut().state_set(LoopsState::NEED_FIXUP);
            return thread_block(proc, thread_stats, header, false);
        }
        DomStatus::Dominating => {}
    }

    let tgt_father = proc.loop_father(tgt_bb);
    if proc.loops().loop_(tgt_father).header == Some(tgt_bb) {
        // The target heads a subloop; give that subloop its own preheader
        // so the two headers do not merge.
        if proc.block(tgt_bb).preds().len() > 2 {
            tgt_bb = create_preheader(proc, tgt_father).expect("preheader must be created");
        } else {
            tgt_bb = split_edge(proc, tgt_edge.unwrap());
        }
    }

    if latch_annotated {
        // The latch edge is redirected: the header is copied, but the loop
        // gains no entry. Tell the duplication machinery.
        proc.loops_mut().set_loop_copy(l, Some(l));
        let new_latch = thread_single_edge(proc, thread_stats, latch_e);
        proc.loops_mut().set_loop_copy(l, None);
        proc.loops_mut().loop_mut(l).latch = Some(new_latch);
        let out = proc.single_succ(new_latch).expect("the copy falls through");
        assert_eq!(proc.edge(out).dest, tgt_bb, "the new latch must reach the target");
        proc.loops_mut().loop_mut(l).header = Some(tgt_bb);

        // The peeled header blocks now sit in front of the loop.
        let tgt_father = proc.loop_father(tgt_bb);
        let peeled = dfs_enumerate_from(proc, header, false, |p, b| {
            b != tgt_bb && p.loops().chain_contains(p.loop_father(b), tgt_father)
        });
        let outer = proc.loops().outer(l).unwrap_or(LoopId::root());
        for b in peeled {
            if proc.loop_father(b) == l {
                proc.remove_bb_from_loop(b);
                proc.add_bb_to_loop(b, outer);
            }
        }

        // If the new header gained extra in-loop predecessors, it has
        // multiple latches.
        for e in proc.block(tgt_bb).preds().to_vec() {
            let src = proc.edge(e).src;
            if proc.loop_father(src) == l && src != new_latch {
                proc.loops_mut().loop_mut(l).latch = None;
                proc.loops_mut().state_set(LoopsState::MAY_HAVE_MULTIPLE_LATCHES);
            }
        }

        // Cancel any remaining request that would turn the loop into a
        // multiple-entry loop.
        for e in proc.block(header).preds().to_vec() {
            let Some(last_edge) = proc.edge(e).aux.as_ref().map(|p| p.last().unwrap().edge)
            else {
                continue;
            };
            let e2_dest = proc.edge(last_edge).dest;
            if proc.loop_father(proc.edge(e).src) != proc.loop_father(e2_dest)
                && e2_dest != tgt_bb
            {
                proc.edge_mut(e).aux = None;
            }
        }

        // Thread what is left through the former header.
        thread_block(proc, thread_stats, header, false);
    } else {
        // All entry edges are redirected. Remember one so the new
        // preheader (its destination after threading) can be found again.
        let e = proc
            .block(header)
            .preds()
            .iter()
            .copied()
            .find(|e| proc.edge(*e).aux.is_some())
            .expect("at least one entry edge is annotated");

        // The duplicate of the header becomes the loop's preheader and
        // belongs in the enclosing loop.
        let outer = proc.loops().outer(l).unwrap_or(LoopId::root());
        proc.loops_mut().set_loop_copy(l, Some(outer));
        thread_block(proc, thread_stats, header, false);
        proc.loops_mut().set_loop_copy(l, None);

        let new_preheader = proc.edge(e).dest;
        proc.loops_mut().loop_mut(l).latch = None;
        let kj = proc
            .single_succ(new_preheader)
            .expect("the preheader falls through");
        let kj_dest = proc.edge(kj).dest;
        proc.loops_mut().loop_mut(l).header = Some(kj_dest);

        // The latch must have a single successor but the old header had at
        // least two, so a fresh latch block is always needed.
        let latch = make_forwarder_block(proc, tgt_bb, move |_, pe| pe != kj);
        let latch_src = proc.edge(latch).src;
        let latch_dest = proc.edge(latch).dest;
        proc.loops_mut().loop_mut(l).header = Some(latch_dest);
        proc.loops_mut().loop_mut(l).latch = Some(latch_src);
    }

    true
}

/// True if the phi arguments carried by `e1` and `e2` into their common
/// destination are pairwise equal.
fn phi_args_equal_on_edges(proc: &Procedure, e1: EdgeId, e2: EdgeId) -> bool {
    let bb = proc.edge(e1).dest;
    let i1 = proc.pred_index(bb, e1);
    let i2 = proc.pred_index(bb, e2);
    proc.block(bb)
        .phis()
        .iter()
        .all(|phi| phi.args[i1].def == phi.args[i2].def)
}

fn dump_jump_thread_path(proc: &Procedure, path: &ThreadPath) {
    if path[0].edge.is_invalid() {
        eprint!("  Registering jump thread: (?, ?) incoming edge; ");
    } else {
        let start = proc.edge(path[0].edge);
        eprint!(
            "  Registering jump thread: ({}, {}) incoming edge; ",
            start.src.0, start.dest.0
        );
    }
    for step in &path[1..] {
        // Paths can carry an invalid edge when the final destination turned
        // out to be a constant address; they are dumped before cancellation.
        if step.edge.is_invalid() {
            continue;
        }
        let edge = proc.edge(step.edge);
        match step.kind {
            ThreadEdgeKind::CopySrcJoiner => {
                eprint!(" ({}, {}) joiner; ", edge.src.0, edge.dest.0)
            }
            ThreadEdgeKind::CopySrc => eprint!(" ({}, {}) normal;", edge.src.0, edge.dest.0),
            ThreadEdgeKind::NoCopySrc => eprint!(" ({}, {}) nocopy;", edge.src.0, edge.dest.0),
            ThreadEdgeKind::Start => {}
        }
    }
    eprintln!();
}

/// The pending threading requests of one function, and the entry points of
/// the update engine.
#[derive(Default)]
pub struct JumpThreads {
    paths: Vec<ThreadPath>,
}

impl JumpThreads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_pending(&self) -> usize {
        self.paths.len()
    }

    /// Queues a threading opportunity discovered by an upstream pass. The
    /// path is dropped when a step has an invalid edge (a jump to a
    /// constant address) or when the bisection debug counter says no.
    pub fn register_jump_thread(&mut self, proc: &Procedure, path: ThreadPath) {
        if !dbg_cnt("registered_jump_thread") {
            return;
        }

        if path.iter().any(|step| step.edge.is_invalid()) {
            if proc.options.dump_jump_threads {
                eprintln!("Found invalid edge in jump threading path.  Cancelling jump thread:");
                dump_jump_thread_path(proc, &path);
            }
            return;
        }

        if proc.options.dump_jump_threads {
            dump_jump_thread_path(proc, &path);
        }
        self.paths.push(path);
    }

    /// Moves every request onto its starting edge and reports which blocks
    /// have incoming edges to thread. Requests that are too expensive when
    /// optimizing for size, that cross three or more loops (trimmed first),
    /// or whose joiner path disagrees with the direct edge's phi arguments
    /// are cancelled here.
    fn mark_threaded_blocks(&mut self, proc: &mut Procedure) -> BitVec {
        let n = proc.num_blocks();
        let mut tmp: BitVec = BitVec::repeat(false, n);
        let mut threaded_blocks: BitVec = BitVec::repeat(false, n);

        for path in self.paths.drain(..) {
            let e = path[0].edge;
            let dest = proc.edge(e).dest;
            proc.edge_mut(e).aux = Some(path);
            tmp.set(dest.0, true);
        }

        // When optimizing for size, only thread through blocks we do not
        // need to duplicate.
        if proc.options.optimize_for_size {
            for i in tmp.iter_ones() {
                let bb = BlockId(i);
                if proc.block(bb).preds().len() > 1 && !is_redirection_block(proc, bb) {
                    for e in proc.block(bb).preds().to_vec() {
                        proc.edge_mut(e).aux = None;
                    }
                } else {
                    threaded_blocks.set(i, true);
                }
            }
        } else {
            threaded_blocks.copy_from_bitslice(&tmp);
        }

        // A path showing three or more distinct loops would be rewritten in
        // ways the loop code cannot describe. Rather than cancelling, trim
        // the tail off; cancel only if what is left is no longer a usable
        // path.
        for i in tmp.iter_ones() {
            for e in proc.block(BlockId(i)).preds().to_vec() {
                if proc.edge(e).aux.is_none() {
                    continue;
                }
                let mut trim_at = None;
                {
                    let path = proc.edge(e).aux.as_ref().unwrap();
                    let first_father = proc.loop_father(proc.edge(path[0].edge).src);
                    let mut second_father = None;
                    for (idx, step) in path.iter().enumerate() {
                        let father = proc.loop_father(proc.edge(step.edge).dest);
                        if father != first_father && Some(father) != second_father {
                            if second_father.is_some() {
                                trim_at = Some(idx);
                                break;
                            }
                            second_father = Some(father);
                        }
                    }
                }
                if let Some(idx) = trim_at {
                    let path = proc.edge_mut(e).aux.as_mut().unwrap();
                    path.truncate(idx);
                    if path.len() < 2
                        || path.last().unwrap().kind == ThreadEdgeKind::CopySrcJoiner
                    {
                        proc.edge_mut(e).aux = None;
                    }
                }
            }
        }

        // A joiner J with a direct edge to the path's final destination S2
        // only threads correctly if every phi in S2 sees the same value on
        // J->S2 and on the path's final edge. This must run after trimming;
        // the situation can appear only once a path has been truncated.
        for i in tmp.iter_ones() {
            for e in proc.block(BlockId(i)).preds().to_vec() {
                let Some((have_joiner, final_edge)) = proc
                    .edge(e)
                    .aux
                    .as_ref()
                    .map(|p| (p[1].kind == ThreadEdgeKind::CopySrcJoiner, p.last().unwrap().edge))
                else {
                    continue;
                };
                if !have_joiner {
                    continue;
                }
                let joiner = proc.edge(e).dest;
                let final_dest = proc.edge(final_edge).dest;
                if let Some(e2) = proc.find_edge(joiner, final_dest) {
                    if !phi_args_equal_on_edges(proc, e2, final_edge) {
                        proc.edge_mut(e).aux = None;
                    }
                }
            }
        }

        threaded_blocks
    }

    /// Performs every pending threading. Non-loop-damaging requests go
    /// first, then loop headers innermost-first so inner rewrites cannot
    /// invalidate outer ones. Returns whether anything changed; the caller
    /// owns fixing dominance information afterwards.
    pub fn thread_through_all_blocks(
        &mut self,
        proc: &mut Procedure,
        may_peel_loop_headers: bool,
    ) -> bool {
        assert!(proc.has_loops(), "loop info must be computed before threading");

        if self.paths.is_empty() {
            return false;
        }

        let mut thread_stats = ThreadStats::default();
        let threaded_blocks = self.mark_threaded_blocks(proc);
        proc.loops_mut().clear_copy_table();

        let mut retval = false;
        for i in threaded_blocks.iter_ones() {
            let bb = BlockId(i);
            if !proc.block(bb).preds().is_empty() {
                retval |= thread_block(proc, &mut thread_stats, bb, true);
            }
        }

        for l in proc.loops().innermost_first() {
            let Some(header) = proc.loops().loop_(l).header else {
                continue;
            };
            if header.0 >= threaded_blocks.len() || !threaded_blocks[header.0] {
                continue;
            }
            retval |= thread_through_loop_header(proc, &mut thread_stats, l, may_peel_loop_headers);
        }

        // A latch-to-exit thread may null a header whose remaining requests
        // then never get processed; sweep all edges so no annotation
        // dangles into later passes.
        for b in 0..proc.num_blocks() {
            for e in proc.block(BlockId(b)).preds().to_vec() {
                proc.edge_mut(e).aux = None;
            }
        }

        if proc.options.dump_jump_threads {
            eprintln!("Jumps threaded: {}", thread_stats.num_threaded_edges);
        }
        stats::counter_event("jumps threaded", thread_stats.num_threaded_edges);

        proc.loops_mut().clear_copy_table();

        if retval {
            proc.loops_mut().state_set(LoopsState::NEED_FIXUP);
        }
        retval
    }
}

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::{
    block::{BasicBlockBuilder, BlockId},
    edge::{EdgeFlags, EdgeId},
    jump_threading::{JumpThreadEdge, JumpThreads, ThreadEdgeKind, ThreadPath},
    loops::LoopsState,
    procedure::Procedure,
    stmt::{Operand, SourceLocation, Stmt},
    Options,
};

fn start(e: EdgeId) -> JumpThreadEdge {
    JumpThreadEdge::new(e, ThreadEdgeKind::Start)
}

fn copy(e: EdgeId) -> JumpThreadEdge {
    JumpThreadEdge::new(e, ThreadEdgeKind::CopySrc)
}

fn joiner(e: EdgeId) -> JumpThreadEdge {
    JumpThreadEdge::new(e, ThreadEdgeKind::CopySrcJoiner)
}

fn nocopy(e: EdgeId) -> JumpThreadEdge {
    JumpThreadEdge::new(e, ThreadEdgeKind::NoCopySrc)
}

fn assert_phi_arity(proc: &Procedure) {
    for i in 0..proc.num_blocks() {
        let bb = proc.block(BlockId(i));
        for phi in bb.phis() {
            assert_eq!(
                phi.args.len(),
                bb.preds().len(),
                "phi arity diverged from predecessor count in BB{}",
                i
            );
            for arg in &phi.args {
                assert!(arg.def.is_set(), "unfilled phi argument in BB{}", i);
            }
        }
    }
}

fn assert_no_dangling_paths(proc: &Procedure) {
    for i in 0..proc.num_blocks() {
        for e in proc.block(BlockId(i)).preds() {
            assert!(
                proc.edge(*e).aux.is_none(),
                "edge into BB{} still carries a path",
                i
            );
        }
    }
}

#[test]
fn diamond_plain_thread_duplicates_and_rewires() {
    let mut proc = Procedure::new(Options::default());
    let a = proc.add_block(10000);
    let b = proc.add_block(10000);
    let c = proc.add_block(5000);
    let d = proc.add_block(5000);
    let ab = BasicBlockBuilder::new(&mut proc, a).add_goto(b);
    let (bc, _bd) = {
        let mut builder = BasicBlockBuilder::new(&mut proc, b);
        builder.add_assign(Operand::Ssa(1), Operand::Const(5));
        builder.add_cond(Operand::Ssa(0), Operand::Const(0), c, d)
    };
    let phi = proc.add_phi(c, Operand::Ssa(2));
    proc.set_phi_arg(c, phi, bc, Operand::Ssa(1), SourceLocation(7));
    proc.compute_loops();

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(ab), copy(bc)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // One duplicate of B exists and now receives A's edge.
    assert_eq!(proc.num_blocks(), 5);
    let dup = proc.edge(ab).dest;
    assert_ne!(dup, b);
    assert!(!proc.block(b).preds().contains(&ab));

    // The duplicate kept B's side effect but lost the branch; it falls
    // through to C.
    assert_eq!(
        proc.block(dup).stmts(),
        &[Stmt::Assign { lhs: Operand::Ssa(1), rhs: Operand::Const(5) }]
    );
    let out = proc.single_succ(dup).unwrap();
    assert_eq!(proc.edge(out).dest, c);
    assert!(proc.edge(out).flags.contains(EdgeFlags::FALLTHRU));

    // C merges the same value from both B and the duplicate.
    assert_eq!(proc.block(c).preds().len(), 2);
    assert_eq!(proc.phi_arg(c, phi, bc).def, Operand::Ssa(1));
    assert_eq!(proc.phi_arg(c, phi, out).def, Operand::Ssa(1));
    assert_eq!(proc.phi_arg(c, phi, out).location, SourceLocation(7));

    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
    assert!(proc.loops().state().contains(LoopsState::NEED_FIXUP));
}

fn joiner_cfg(
    j_to_s2_arg: Operand,
) -> (Procedure, EdgeId, EdgeId, EdgeId, EdgeId, BlockId, BlockId, usize) {
    // entry -> {a1, a2} -> J; J -> {S1, S2}; S1 -> S2.
    let mut proc = Procedure::new(Options::default());
    let entry = proc.add_block(10000);
    let a1 = proc.add_block(5000);
    let a2 = proc.add_block(5000);
    let j = proc.add_block(10000);
    let s1 = proc.add_block(5000);
    let s2 = proc.add_block(10000);
    BasicBlockBuilder::new(&mut proc, entry).add_cond(Operand::Ssa(0), Operand::Const(0), a1, a2);
    let e1 = BasicBlockBuilder::new(&mut proc, a1).add_goto(j);
    let _e2 = BasicBlockBuilder::new(&mut proc, a2).add_goto(j);
    let (js1, js2) =
        BasicBlockBuilder::new(&mut proc, j).add_cond(Operand::Ssa(1), Operand::Const(0), s1, s2);
    let s1s2 = BasicBlockBuilder::new(&mut proc, s1).add_goto(s2);
    let phi = proc.add_phi(s2, Operand::Ssa(3));
    proc.set_phi_arg(s2, phi, js2, j_to_s2_arg, SourceLocation::UNKNOWN);
    proc.set_phi_arg(s2, phi, s1s2, Operand::Const(2), SourceLocation::UNKNOWN);
    proc.compute_loops();
    (proc, e1, js1, js2, s1s2, j, s2, phi)
}

#[test]
fn joiner_path_with_phi_mismatch_is_cancelled() {
    let (mut proc, e1, js1, _js2, s1s2, j, _s2, _phi) = joiner_cfg(Operand::Const(1));
    let blocks_before = proc.num_blocks();

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(e1), joiner(js1), copy(s1s2)]);
    assert!(!threads.thread_through_all_blocks(&mut proc, true));

    // The direct J->S2 argument disagrees with the path's, so nothing moved.
    assert_eq!(proc.num_blocks(), blocks_before);
    assert_eq!(proc.edge(e1).dest, j);
    assert!(!proc.loops().state().contains(LoopsState::NEED_FIXUP));
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn joiner_path_with_matching_phi_args_is_threaded() {
    let (mut proc, e1, js1, _js2, s1s2, j, s2, phi) = joiner_cfg(Operand::Const(2));

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(e1), joiner(js1), copy(s1s2)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // A1 now enters a duplicate of J that kept its branch; the arm that
    // went to S1 lands directly on S2.
    let dup = proc.edge(e1).dest;
    assert_ne!(dup, j);
    assert!(matches!(proc.block(dup).ctrl_stmt(), Some(Stmt::Cond { .. })));
    assert_eq!(proc.block(dup).succs().len(), 2);
    for e in proc.block(dup).succs() {
        assert_eq!(proc.edge(*e).dest, s2);
        assert_eq!(proc.phi_arg(s2, phi, *e).def, Operand::Const(2));
    }

    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn latch_to_exit_thread_destroys_the_loop() {
    // entry -> H; H -> {X, L}; L -> H.
    let mut proc = Procedure::new(Options::default());
    let entry = proc.add_block(10000);
    let h = proc.add_block(10000);
    let x = proc.add_block(5000);
    let l = proc.add_block(5000);
    let eh = BasicBlockBuilder::new(&mut proc, entry).add_goto(h);
    let (hx, _hl) =
        BasicBlockBuilder::new(&mut proc, h).add_cond(Operand::Ssa(0), Operand::Const(0), x, l);
    let lh = BasicBlockBuilder::new(&mut proc, l).add_goto(h);
    let phi_h = proc.add_phi(h, Operand::Ssa(5));
    proc.set_phi_arg(h, phi_h, eh, Operand::Const(0), SourceLocation::UNKNOWN);
    proc.set_phi_arg(h, phi_h, lh, Operand::Ssa(6), SourceLocation::UNKNOWN);
    let phi_x = proc.add_phi(x, Operand::Ssa(9));
    proc.set_phi_arg(x, phi_x, hx, Operand::Ssa(5), SourceLocation::UNKNOWN);
    proc.compute_loops();
    let loop_id = proc.loop_father(h);
    assert!(!loop_id.is_root());

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(lh), copy(hx)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // The loop ceased to exist.
    assert_eq!(proc.loops().loop_(loop_id).header, None);
    assert_eq!(proc.loops().loop_(loop_id).latch, None);
    assert!(proc.loops().state().contains(LoopsState::NEED_FIXUP));

    // The latch jumps straight to a copy of H that falls through to X.
    let dup = proc.edge(lh).dest;
    assert_ne!(dup, h);
    let out = proc.single_succ(dup).unwrap();
    assert_eq!(proc.edge(out).dest, x);
    assert_eq!(proc.phi_arg(x, phi_x, out).def, Operand::Ssa(5));
    assert_eq!(proc.block(dup).phis()[0].args.len(), 1);
    assert_eq!(proc.phi_arg(dup, 0, lh).def, Operand::Ssa(6));

    // H keeps only its entry predecessor.
    assert_eq!(proc.block(h).preds(), &[eh]);
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn path_crossing_three_loops_is_trimmed() {
    // O -> A; A -> {E, B}; E -> A (latch); B -> {B, C}; C -> {C, X}.
    let mut proc = Procedure::new(Options::default());
    let o = proc.add_block(10000);
    let a = proc.add_block(10000);
    let e = proc.add_block(5000);
    let b = proc.add_block(8000);
    let c = proc.add_block(8000);
    let x = proc.add_block(2000);
    BasicBlockBuilder::new(&mut proc, o).add_goto(a);
    let (ae, ab) =
        BasicBlockBuilder::new(&mut proc, a).add_cond(Operand::Ssa(0), Operand::Const(0), e, b);
    let ea = BasicBlockBuilder::new(&mut proc, e).add_goto(a);
    let (_bb, bc) =
        BasicBlockBuilder::new(&mut proc, b).add_cond(Operand::Ssa(1), Operand::Const(0), b, c);
    BasicBlockBuilder::new(&mut proc, c).add_cond(Operand::Ssa(2), Operand::Const(0), c, x);
    let _ = ae;
    proc.compute_loops();
    let c_preds_before = proc.block(c).preds().to_vec();

    let mut threads = JumpThreads::new();
    // Dest fathers along the walk: A's loop, then B's, then C's; the third
    // distinct loop cuts the path down to two steps.
    threads.register_jump_thread(&proc, vec![start(ea), copy(ab), nocopy(bc)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // The trimmed path is a latch-to-exit thread of A's loop: E now reaches
    // a copy of A that falls through to B, never to C.
    let dup = proc.edge(ea).dest;
    assert_ne!(dup, a);
    let out = proc.single_succ(dup).unwrap();
    assert_eq!(proc.edge(out).dest, b);
    assert_eq!(proc.block(c).preds(), c_preds_before.as_slice());

    let la = proc.loop_father(a);
    assert_eq!(proc.loops().loop_(la).header, None);
    assert!(proc.loops().state().contains(LoopsState::NEED_FIXUP));
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn optimize_for_size_cancels_costly_duplication() {
    let mut proc = Procedure::new(Options {
        optimize_for_size: true,
        ..Options::default()
    });
    let entry = proc.add_block(10000);
    let a1 = proc.add_block(4000);
    let a2 = proc.add_block(3000);
    let a3 = proc.add_block(3000);
    let b = proc.add_block(10000);
    let c = proc.add_block(5000);
    let d = proc.add_block(5000);
    BasicBlockBuilder::new(&mut proc, entry).add_switch(Operand::Ssa(0), &[a1, a2, a3]);
    let e1 = BasicBlockBuilder::new(&mut proc, a1).add_goto(b);
    let e2 = BasicBlockBuilder::new(&mut proc, a2).add_goto(b);
    let _e3 = BasicBlockBuilder::new(&mut proc, a3).add_goto(b);
    let (bc, _bd) = {
        let mut builder = BasicBlockBuilder::new(&mut proc, b);
        builder.add_assign(Operand::Ssa(1), Operand::Const(1));
        builder.add_cond(Operand::Ssa(0), Operand::Const(0), c, d)
    };
    proc.compute_loops();
    let blocks_before = proc.num_blocks();

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(e1), copy(bc)]);
    threads.register_jump_thread(&proc, vec![start(e2), copy(bc)]);
    assert!(!threads.thread_through_all_blocks(&mut proc, true));

    // B has three predecessors and real work, so duplicating it is too
    // expensive at -Os; every request was dropped.
    assert_eq!(proc.num_blocks(), blocks_before);
    assert_eq!(proc.edge(e1).dest, b);
    assert_eq!(proc.edge(e2).dest, b);
    assert_no_dangling_paths(&proc);
}

#[test]
fn optimize_for_size_still_threads_redirection_blocks() {
    let mut proc = Procedure::new(Options {
        optimize_for_size: true,
        ..Options::default()
    });
    let entry = proc.add_block(10000);
    let a1 = proc.add_block(5000);
    let a2 = proc.add_block(5000);
    let b = proc.add_block(10000);
    let c = proc.add_block(5000);
    let d = proc.add_block(5000);
    BasicBlockBuilder::new(&mut proc, entry).add_cond(Operand::Ssa(0), Operand::Const(0), a1, a2);
    let e1 = BasicBlockBuilder::new(&mut proc, a1).add_goto(b);
    let _e2 = BasicBlockBuilder::new(&mut proc, a2).add_goto(b);
    let (bc, _bd) = {
        let mut builder = BasicBlockBuilder::new(&mut proc, b);
        builder.add_label(1);
        builder.add_debug();
        builder.add_nop();
        builder.add_cond(Operand::Ssa(1), Operand::Const(0), c, d)
    };
    proc.compute_loops();

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(e1), copy(bc)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // B is a pure redirection block, so duplicating it is free even at -Os.
    let dup = proc.edge(e1).dest;
    assert_ne!(dup, b);
    assert!(proc.block(dup).stmts().iter().all(|s| s.is_filler()));
    assert_eq!(
        proc.single_succ(dup).map(|e| proc.edge(e).dest),
        Some(c)
    );
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn common_suffix_shares_one_duplicate() {
    let mut proc = Procedure::new(Options::default());
    let entry = proc.add_block(10000);
    let a1 = proc.add_block(4000);
    let a2 = proc.add_block(3000);
    let a3 = proc.add_block(3000);
    let b = proc.add_block(10000);
    let c = proc.add_block(5000);
    let d = proc.add_block(5000);
    BasicBlockBuilder::new(&mut proc, entry).add_switch(Operand::Ssa(0), &[a1, a2, a3]);
    let e1 = BasicBlockBuilder::new(&mut proc, a1).add_goto(b);
    let e2 = BasicBlockBuilder::new(&mut proc, a2).add_goto(b);
    let e3 = BasicBlockBuilder::new(&mut proc, a3).add_goto(b);
    proc.edge_mut(e1).count = 10;
    proc.edge_mut(e2).count = 20;
    proc.edge_mut(e3).count = 30;
    let (bc, _bd) =
        BasicBlockBuilder::new(&mut proc, b).add_cond(Operand::Ssa(1), Operand::Const(0), c, d);
    proc.compute_loops();
    let blocks_before = proc.num_blocks();

    let mut threads = JumpThreads::new();
    for e in [e1, e2, e3] {
        threads.register_jump_thread(&proc, vec![start(e), copy(bc)]);
    }
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // Three requests, one shared suffix, exactly one duplicate.
    assert_eq!(proc.num_blocks(), blocks_before + 1);
    let dup = proc.edge(e1).dest;
    assert_eq!(proc.edge(e2).dest, dup);
    assert_eq!(proc.edge(e3).dest, dup);
    assert_eq!(proc.block(dup).preds().len(), 3);
    assert_eq!(proc.block(dup).count(), 60);
    let out = proc.single_succ(dup).unwrap();
    assert_eq!(proc.edge(out).dest, c);
    assert_eq!(proc.edge(out).count, 60);
    assert_eq!(proc.block(b).preds().len(), 0);
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn entries_case_builds_single_latch() {
    // entry -> {e1, e2} -> H; H -> {B, X}; B -> H.
    let mut proc = Procedure::new(Options::default());
    let entry = proc.add_block(10000);
    let e1 = proc.add_block(5000);
    let e2 = proc.add_block(5000);
    let h = proc.add_block(10000);
    let b = proc.add_block(8000);
    let x = proc.add_block(2000);
    BasicBlockBuilder::new(&mut proc, entry).add_cond(Operand::Ssa(0), Operand::Const(0), e1, e2);
    let n1 = BasicBlockBuilder::new(&mut proc, e1).add_goto(h);
    let n2 = BasicBlockBuilder::new(&mut proc, e2).add_goto(h);
    let (hb, hx) =
        BasicBlockBuilder::new(&mut proc, h).add_cond(Operand::Ssa(1), Operand::Const(0), b, x);
    let bh = BasicBlockBuilder::new(&mut proc, b).add_goto(h);
    let phi_h = proc.add_phi(h, Operand::Ssa(1));
    proc.set_phi_arg(h, phi_h, n1, Operand::Const(0), SourceLocation::UNKNOWN);
    proc.set_phi_arg(h, phi_h, n2, Operand::Const(1), SourceLocation::UNKNOWN);
    proc.set_phi_arg(h, phi_h, bh, Operand::Ssa(2), SourceLocation::UNKNOWN);
    proc.compute_loops();
    let l = proc.loop_father(h);
    assert_eq!(proc.loops().loop_(l).latch, Some(b));

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(n1), copy(hb)]);
    threads.register_jump_thread(&proc, vec![start(n2), copy(hb)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // Both entries land in one duplicate of H, the loop's new preheader.
    let preheader = proc.edge(n1).dest;
    assert_eq!(proc.edge(n2).dest, preheader);
    assert_ne!(preheader, h);
    assert!(proc.loop_father(preheader).is_root());
    assert_eq!(proc.phi_arg(preheader, 0, n1).def, Operand::Const(0));
    assert_eq!(proc.phi_arg(preheader, 0, n2).def, Operand::Const(1));

    // The loop was rotated: a fresh header took over B's statements and the
    // old latch block became a forwarder, the loop's only latch.
    let new_header = proc.loops().loop_(l).header.unwrap();
    let new_latch = proc.loops().loop_(l).latch.unwrap();
    assert_eq!(new_latch, b);
    assert_eq!(
        proc.single_succ(preheader).map(|e| proc.edge(e).dest),
        Some(new_header)
    );
    assert_eq!(
        proc.single_succ(new_latch).map(|e| proc.edge(e).dest),
        Some(new_header)
    );
    let in_loop_preds: Vec<BlockId> = proc
        .block(new_header)
        .preds()
        .iter()
        .filter(|e| proc.loop_father(proc.edge(**e).src) == l)
        .map(|e| proc.edge(*e).src)
        .collect();
    assert_eq!(in_loop_preds, vec![new_latch]);
    assert!(!proc
        .loops()
        .state()
        .contains(LoopsState::MAY_HAVE_MULTIPLE_LATCHES));

    // The old header still branches inside the loop.
    assert!(matches!(proc.block(h).ctrl_stmt(), Some(Stmt::Cond { .. })));
    assert_eq!(proc.edge(hx).dest, x);
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn latch_thread_peels_the_old_header() {
    // entry -> H; H -> {I, B}; I -> B; B -> {H, X}. The latch edge knows it
    // can skip H's first-iteration test.
    let mut proc = Procedure::new(Options::default());
    let entry = proc.add_block(10000);
    let h = proc.add_block(10000);
    let i = proc.add_block(3000);
    let b = proc.add_block(10000);
    let x = proc.add_block(2000);
    let eh = BasicBlockBuilder::new(&mut proc, entry).add_goto(h);
    let (hi, hb) =
        BasicBlockBuilder::new(&mut proc, h).add_cond(Operand::Ssa(1), Operand::Const(0), i, b);
    let ib = BasicBlockBuilder::new(&mut proc, i).add_goto(b);
    let (bh, bx) =
        BasicBlockBuilder::new(&mut proc, b).add_cond(Operand::Ssa(2), Operand::Const(0), h, x);
    let phi_h = proc.add_phi(h, Operand::Ssa(1));
    proc.set_phi_arg(h, phi_h, eh, Operand::Const(0), SourceLocation::UNKNOWN);
    proc.set_phi_arg(h, phi_h, bh, Operand::Ssa(4), SourceLocation::UNKNOWN);
    let phi_b = proc.add_phi(b, Operand::Ssa(3));
    proc.set_phi_arg(b, phi_b, hb, Operand::Const(3), SourceLocation::UNKNOWN);
    proc.set_phi_arg(b, phi_b, ib, Operand::Const(4), SourceLocation::UNKNOWN);
    proc.compute_loops();
    let l = proc.loop_father(h);
    assert_eq!(proc.loops().loop_(l).latch, Some(b));
    assert_eq!(proc.loop_father(i), l);

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(bh), copy(hb)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // B took over as header; the back edge enters a copy of H that lost its
    // branch and falls through to B.
    assert_eq!(proc.loops().loop_(l).header, Some(b));
    let new_latch = proc.loops().loop_(l).latch.unwrap();
    assert_eq!(proc.edge(bh).dest, new_latch);
    assert_ne!(new_latch, h);
    assert_eq!(
        proc.single_succ(new_latch).map(|e| proc.edge(e).dest),
        Some(b)
    );
    assert_eq!(proc.phi_arg(b, phi_b, proc.single_succ(new_latch).unwrap()).def, Operand::Const(3));
    assert_eq!(proc.phi_arg(new_latch, 0, bh).def, Operand::Ssa(4));

    // The run-once blocks H and I were peeled out of the loop.
    assert!(proc.loop_father(h).is_root());
    assert!(proc.loop_father(i).is_root());
    assert_eq!(proc.loop_father(new_latch), l);
    assert!(!proc
        .loops()
        .state()
        .contains(LoopsState::MAY_HAVE_MULTIPLE_LATCHES));

    // The loop still exits through B.
    assert_eq!(proc.edge(bx).dest, x);
    assert_eq!(proc.edge(eh).dest, h);
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn latch_thread_to_subloop_header_splits_the_entry() {
    // entry -> H; H -> {S, X}; S -> {S, L} (inner self-loop); L -> H.
    // The outer latch wants to skip H and land on the inner header S; the
    // engine must interpose a block so the two headers stay distinct.
    let mut proc = Procedure::new(Options::default());
    let entry = proc.add_block(10000);
    let h = proc.add_block(10000);
    let s = proc.add_block(9000);
    let x = proc.add_block(1000);
    let l = proc.add_block(8000);
    BasicBlockBuilder::new(&mut proc, entry).add_goto(h);
    let (hs, _hx) =
        BasicBlockBuilder::new(&mut proc, h).add_cond(Operand::Ssa(0), Operand::Const(0), s, x);
    let (ss, _sl) =
        BasicBlockBuilder::new(&mut proc, s).add_cond(Operand::Ssa(1), Operand::Const(0), s, l);
    let lh = BasicBlockBuilder::new(&mut proc, l).add_goto(h);
    proc.compute_loops();
    let inner = proc.loop_father(s);
    let outer = proc.loop_father(h);
    assert_eq!(proc.loops().outer(inner), Some(outer));

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(lh), copy(hs)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    // The outer loop rotated: its new header is the block split out of the
    // H -> S edge, its latch a copy of H; the old header sits in front of
    // the loop now.
    let new_header = proc.loops().loop_(outer).header.unwrap();
    let new_latch = proc.loops().loop_(outer).latch.unwrap();
    assert_eq!(proc.edge(hs).dest, new_header);
    assert_eq!(
        proc.single_succ(new_header).map(|e| proc.edge(e).dest),
        Some(s)
    );
    assert_eq!(proc.edge(lh).dest, new_latch);
    assert_eq!(
        proc.single_succ(new_latch).map(|e| proc.edge(e).dest),
        Some(new_header)
    );
    assert!(proc.loop_father(h).is_root());
    assert_eq!(proc.loop_father(new_header), outer);

    // The inner loop kept its own header and latch.
    assert_eq!(proc.loops().loop_(inner).header, Some(s));
    assert_eq!(proc.loops().loop_(inner).latch, Some(s));
    assert_eq!(proc.edge(ss).dest, s);
    assert_phi_arity(&proc);
    assert_no_dangling_paths(&proc);
}

#[test]
fn rerunning_with_no_requests_is_a_noop() {
    let mut proc = Procedure::new(Options::default());
    let a = proc.add_block(10000);
    let b = proc.add_block(10000);
    let c = proc.add_block(5000);
    let d = proc.add_block(5000);
    let ab = BasicBlockBuilder::new(&mut proc, a).add_goto(b);
    let (bc, _bd) =
        BasicBlockBuilder::new(&mut proc, b).add_cond(Operand::Ssa(0), Operand::Const(0), c, d);
    proc.compute_loops();

    let mut threads = JumpThreads::new();
    threads.register_jump_thread(&proc, vec![start(ab), copy(bc)]);
    assert!(threads.thread_through_all_blocks(&mut proc, true));

    let snapshot = proc.display().to_string();
    assert!(!threads.thread_through_all_blocks(&mut proc, true));
    assert_eq!(proc.display().to_string(), snapshot);
}

#[test]
fn invalid_edge_in_path_cancels_registration() {
    let mut proc = Procedure::new(Options::default());
    let a = proc.add_block(10000);
    let b = proc.add_block(10000);
    let c = proc.add_block(5000);
    let d = proc.add_block(5000);
    let ab = BasicBlockBuilder::new(&mut proc, a).add_goto(b);
    BasicBlockBuilder::new(&mut proc, b).add_cond(Operand::Ssa(0), Operand::Const(0), c, d);
    proc.compute_loops();

    let mut threads = JumpThreads::new();
    // A jump to a constant address shows up as an invalid edge.
    threads.register_jump_thread(&proc, vec![start(ab), copy(EdgeId::invalid())]);
    assert_eq!(threads.num_pending(), 0);
    assert!(!threads.thread_through_all_blocks(&mut proc, true));
}

// Random DAGs with random two-step and three-step requests: every surviving
// structure keeps the phi/predecessor bijection, carries no annotations, and
// a threaded plain path delivers exactly the value the original route
// carried into its final destination.
#[test]
fn random_dags_preserve_ssa_and_annotations() {
    for seed in 0..60u64 {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut proc = Procedure::new(Options {
            optimize_for_size: seed % 5 == 0,
            ..Options::default()
        });

        let n = rng.gen_range(5..9);
        let blocks: Vec<BlockId> = (0..n).map(|_| proc.add_block(10000)).collect();
        for i in 0..n - 1 {
            let candidates: Vec<usize> = (i + 1..n).collect();
            let mut builder = BasicBlockBuilder::new(&mut proc, blocks[i]);
            if rng.gen_bool(0.4) {
                builder.add_assign(Operand::Ssa(100 + i as u32), Operand::Const(i as i64));
            }
            if candidates.len() >= 2 && rng.gen_bool(0.7) {
                let t = candidates[rng.gen_range(0..candidates.len())];
                let mut f = candidates[rng.gen_range(0..candidates.len())];
                while f == t {
                    f = candidates[rng.gen_range(0..candidates.len())];
                }
                builder.add_cond(Operand::Ssa(i as u32), Operand::Const(0), blocks[t], blocks[f]);
            } else {
                let t = candidates[rng.gen_range(0..candidates.len())];
                builder.add_goto(blocks[t]);
            }
        }
        // A phi at every merge point, fed a distinct constant per edge.
        for i in 0..n {
            if proc.block(blocks[i]).preds().len() >= 2 {
                let phi = proc.add_phi(blocks[i], Operand::Ssa(200 + i as u32));
                for e in proc.block(blocks[i]).preds().to_vec() {
                    proc.set_phi_arg(
                        blocks[i],
                        phi,
                        e,
                        Operand::Const(e.0 as i64),
                        SourceLocation::UNKNOWN,
                    );
                }
            }
        }
        proc.compute_loops();

        let mut threads = JumpThreads::new();
        let mut used: Vec<EdgeId> = Vec::new();
        // (start edge, threaded block, final destination, expected args)
        let mut expectations = Vec::new();
        for _ in 0..6 {
            let bb = blocks[rng.gen_range(1..n)];
            if proc.block(bb).succs().len() < 2 || proc.block(bb).preds().is_empty() {
                continue;
            }
            let preds = proc.block(bb).preds().to_vec();
            let e = preds[rng.gen_range(0..preds.len())];

            let succs = proc.block(bb).succs().to_vec();
            let mid = succs[rng.gen_range(0..succs.len())];
            let mut path: ThreadPath = vec![start(e), copy(mid)];
            let mut final_edge = mid;
            let mid_dest = proc.edge(mid).dest;
            if !proc.block(mid_dest).succs().is_empty() && rng.gen_bool(0.3) {
                let nexts = proc.block(mid_dest).succs().to_vec();
                final_edge = nexts[rng.gen_range(0..nexts.len())];
                path.push(nocopy(final_edge));
            }
            // Paths sharing an edge (as start or interior) would thread
            // through each other; keep the sample paths edge-disjoint so
            // the delivered-value check below stays directly observable.
            if path.iter().any(|step| used.contains(&step.edge)) {
                continue;
            }
            used.extend(path.iter().map(|step| step.edge));
            let final_dest = proc.edge(final_edge).dest;
            let expected: Vec<Operand> = (0..proc.block(final_dest).phis().len())
                .map(|p| proc.phi_arg(final_dest, p, final_edge).def)
                .collect();
            expectations.push((e, bb, final_dest, expected));
            threads.register_jump_thread(&proc, path);
        }

        let size_opt = proc.options.optimize_for_size;
        let retval = threads.thread_through_all_blocks(&mut proc, true);

        assert_phi_arity(&proc);
        assert_no_dangling_paths(&proc);
        if retval {
            assert!(proc.loops().state().contains(LoopsState::NEED_FIXUP));
        }

        for (e, bb, final_dest, expected) in expectations {
            let landed = proc.edge(e).dest;
            if landed == bb {
                // Only the size heuristic may refuse a plain DAG request.
                assert!(size_opt, "plain request was dropped without -Os (seed {})", seed);
                continue;
            }
            let out = proc
                .find_edge(landed, final_dest)
                .expect("duplicate reaches the path's final destination");
            for (p, want) in expected.iter().enumerate() {
                assert_eq!(
                    proc.phi_arg(final_dest, p, out).def,
                    *want,
                    "wrong value delivered through a threaded path (seed {})",
                    seed
                );
            }
        }

        // Idempotence: a second run with nothing registered changes nothing.
        let snapshot = proc.display().to_string();
        assert!(!threads.thread_through_all_blocks(&mut proc, true));
        assert_eq!(proc.display().to_string(), snapshot);
    }
}

// The same harness with a back edge thrown in, so the loop guards and the
// header threader get exercised; only the structural invariants are checked.
#[test]
fn random_loopy_cfgs_keep_structural_invariants() {
    for seed in 0..60u64 {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut proc = Procedure::new(Options::default());

        let n = rng.gen_range(5..9);
        let blocks: Vec<BlockId> = (0..n).map(|_| proc.add_block(9000)).collect();
        for i in 0..n - 1 {
            let candidates: Vec<usize> = (i + 1..n).collect();
            let mut builder = BasicBlockBuilder::new(&mut proc, blocks[i]);
            if candidates.len() >= 2 && rng.gen_bool(0.6) {
                let t = candidates[rng.gen_range(0..candidates.len())];
                let mut f = candidates[rng.gen_range(0..candidates.len())];
                while f == t {
                    f = candidates[rng.gen_range(0..candidates.len())];
                }
                builder.add_cond(Operand::Ssa(i as u32), Operand::Const(0), blocks[t], blocks[f]);
            } else {
                let t = candidates[rng.gen_range(0..candidates.len())];
                builder.add_goto(blocks[t]);
            }
        }
        // One back edge out of the sink block towards an early block.
        let back_dest = blocks[rng.gen_range(1..3)];
        BasicBlockBuilder::new(&mut proc, blocks[n - 1]).add_goto(back_dest);

        for i in 0..n {
            if proc.block(blocks[i]).preds().len() >= 2 {
                let phi = proc.add_phi(blocks[i], Operand::Ssa(200 + i as u32));
                for e in proc.block(blocks[i]).preds().to_vec() {
                    proc.set_phi_arg(
                        blocks[i],
                        phi,
                        e,
                        Operand::Const(e.0 as i64),
                        SourceLocation::UNKNOWN,
                    );
                }
            }
        }
        proc.compute_loops();

        let mut threads = JumpThreads::new();
        let mut used: Vec<EdgeId> = Vec::new();
        for _ in 0..5 {
            let bb = blocks[rng.gen_range(1..n)];
            if proc.block(bb).succs().len() < 2 || proc.block(bb).preds().is_empty() {
                continue;
            }
            let preds = proc.block(bb).preds().to_vec();
            let e = preds[rng.gen_range(0..preds.len())];
            if used.contains(&e) {
                continue;
            }
            used.push(e);
            let succs = proc.block(bb).succs().to_vec();
            let mid = succs[rng.gen_range(0..succs.len())];
            threads.register_jump_thread(&proc, vec![start(e), copy(mid)]);
        }

        let retval = threads.thread_through_all_blocks(&mut proc, rng.gen_bool(0.5));

        assert_phi_arity(&proc);
        assert_no_dangling_paths(&proc);
        if retval {
            assert!(proc.loops().state().contains(LoopsState::NEED_FIXUP));
        }

        let snapshot = proc.display().to_string();
        assert!(!threads.thread_through_all_blocks(&mut proc, true));
        assert_eq!(proc.display().to_string(), snapshot);
    }
}

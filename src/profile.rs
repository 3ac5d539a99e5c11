use crate::{block::BlockId, edge::EdgeId, procedure::Procedure};

/// Ceiling for block execution frequencies.
pub const BB_FREQ_MAX: i64 = 10000;
/// Denominator for edge probabilities.
pub const BRANCH_PROB_BASE: i64 = 10000;

/// The estimated absolute frequency of traversing `e`.
pub fn edge_frequency(proc: &Procedure, e: EdgeId) -> i64 {
    let edge = proc.edge(e);
    let src = proc.block(edge.src);
    (src.frequency() * edge.probability + BRANCH_PROB_BASE / 2) / BRANCH_PROB_BASE
}

fn scale(num: i64, den: i64) -> i64 {
    (num * BRANCH_PROB_BASE + den / 2) / den
}

/// `bb` is about to be bypassed by flow of the given frequency and count
/// that used to leave through `taken_edge`. Subtracts that flow from the
/// block and rescales the outgoing probabilities so they still sum to the
/// whole.
pub fn update_bb_profile_for_threading(
    proc: &mut Procedure,
    bb: BlockId,
    edge_frequency: i64,
    count: i64,
    taken_edge: EdgeId,
) {
    assert_eq!(proc.edge(taken_edge).src, bb, "taken edge must leave the block");

    let block = proc.block_mut(bb);
    block.count = (block.count - count).max(0);

    let mut prob = if block.frequency > 0 {
        scale(edge_frequency, block.frequency)
    } else {
        0
    };
    if prob > proc.edge(taken_edge).probability {
        prob = proc.edge(taken_edge).probability;
    }
    proc.edge_mut(taken_edge).probability -= prob;
    let remainder = BRANCH_PROB_BASE - prob;

    let block = proc.block_mut(bb);
    block.frequency = (block.frequency - edge_frequency).max(0);

    let succs = proc.block(bb).succs().to_vec();
    if remainder <= 0 {
        // All of the flow was threaded out; even out what is left.
        let share = BRANCH_PROB_BASE / succs.len() as i64;
        for e in succs {
            proc.edge_mut(e).probability = share;
        }
    } else if remainder != BRANCH_PROB_BASE {
        for e in succs {
            let p = proc.edge(e).probability;
            proc.edge_mut(e).probability = scale(p, remainder).min(BRANCH_PROB_BASE);
        }
    }

    let taken = proc.edge_mut(taken_edge);
    taken.count = (taken.count - count).max(0);
}

pub mod block;
pub mod cfg;
pub mod dbg_cnt;
pub mod dominators;
pub mod edge;
pub mod jump_threading;
pub mod loops;
pub mod procedure;
pub mod profile;
pub mod sparse_collection;
pub mod stats;
pub mod stmt;

#[cfg(test)]
mod tests;

pub use block::{BasicBlock, BasicBlockBuilder, BlockId, Phi, PhiArg};
pub use edge::{Edge, EdgeFlags, EdgeId};
pub use jump_threading::{JumpThreadEdge, JumpThreads, ThreadEdgeKind, ThreadPath};
pub use loops::{Loop, LoopId, LoopTree, LoopsState};
pub use procedure::Procedure;
pub use stmt::{Operand, SourceLocation, Stmt};

/// Per-function knobs. Dump output goes to stderr.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Print each registered path, each threaded jump, and the final tally.
    pub dump_jump_threads: bool,
    /// Refuse to duplicate blocks that contain real work.
    pub optimize_for_size: bool,
}

use std::borrow::Cow;

use indexmap::IndexMap;

use crate::{
    block::{BasicBlock, BlockId, Phi, PhiArg},
    dominators::{Dominators, Graph},
    edge::{Edge, EdgeFlags, EdgeId},
    loops::{LoopId, LoopTree},
    sparse_collection::SparseCollection,
    stmt::{Operand, SourceLocation},
    Options,
};

/// The function being compiled: blocks, edges, and the cached analyses the
/// threading engine consumes and invalidates.
pub struct Procedure {
    pub options: Options,
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) edges: SparseCollection<Edge>,
    pub(crate) dominators: Option<Dominators<Procedure>>,
    pub(crate) loops: Option<LoopTree>,
    /// Phi arguments detached by an edge redirect, waiting to be flushed
    /// into the new destination.
    pub(crate) pending_phi_args: IndexMap<EdgeId, Vec<PhiArg>>,
    pub(crate) next_ssa_name: u32,
}

impl Graph for Procedure {
    type Node = BlockId;

    fn num_nodes(&self) -> usize {
        self.blocks.len()
    }

    fn node(&self, index: usize) -> Option<Self::Node> {
        Some(BlockId(index))
    }

    fn node_index(&self, node: Self::Node) -> usize {
        node.0
    }

    fn root(&self) -> Self::Node {
        BlockId(0)
    }

    fn successors(&self, block: Self::Node) -> Cow<[Self::Node]> {
        Cow::Owned(
            self.blocks[block.0]
                .succs
                .iter()
                .map(|e| self.edge(*e).dest)
                .collect(),
        )
    }

    fn predecessors(&self, block: Self::Node) -> Cow<[Self::Node]> {
        Cow::Owned(
            self.blocks[block.0]
                .preds
                .iter()
                .map(|e| self.edge(*e).src)
                .collect(),
        )
    }
}

impl Procedure {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            blocks: Vec::new(),
            edges: SparseCollection::new(),
            dominators: None,
            loops: None,
            pending_phi_args: IndexMap::new(),
            next_ssa_name: 0,
        }
    }

    pub fn add_block(&mut self, frequency: i64) -> BlockId {
        let block = BasicBlock::new(self.blocks.len(), frequency);
        self.blocks.push(block);
        BlockId(self.blocks.len() - 1)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.at(id).expect("stale edge id")
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.at_mut(id).expect("stale edge id")
    }

    pub fn new_ssa_name(&mut self) -> Operand {
        self.next_ssa_name += 1;
        Operand::Ssa(self.next_ssa_name - 1)
    }

    /// Reserves names up to `n` so test CFGs can hand-pick SSA numbers.
    pub fn seed_ssa_names(&mut self, n: u32) {
        self.next_ssa_name = self.next_ssa_name.max(n);
    }

    /// Creates `src -> dest`. Every phi in `dest` grows an `Unset` argument
    /// slot for the new predecessor.
    pub fn make_edge(&mut self, src: BlockId, dest: BlockId, flags: EdgeFlags) -> EdgeId {
        let e = self.edges.add(Edge::new(src, dest, flags));
        self.blocks[src.0].succs.push(e);
        self.attach_edge_to_dest(e, dest);
        e
    }

    pub fn remove_edge(&mut self, e: EdgeId) {
        let src = self.edge(e).src;
        self.blocks[src.0].succs.retain(|x| *x != e);
        self.detach_edge_from_dest(e);
        self.pending_phi_args.swap_remove(&e);
        self.edges.remove(e);
    }

    pub fn find_edge(&self, src: BlockId, dest: BlockId) -> Option<EdgeId> {
        self.blocks[src.0]
            .succs
            .iter()
            .copied()
            .find(|e| self.edge(*e).dest == dest)
    }

    pub fn single_pred(&self, bb: BlockId) -> Option<EdgeId> {
        match self.blocks[bb.0].preds.as_slice() {
            [e] => Some(*e),
            _ => None,
        }
    }

    pub fn single_succ(&self, bb: BlockId) -> Option<EdgeId> {
        match self.blocks[bb.0].succs.as_slice() {
            [e] => Some(*e),
            _ => None,
        }
    }

    /// Position of `e` in its destination's predecessor list; phi argument
    /// slots use the same index.
    pub fn pred_index(&self, bb: BlockId, e: EdgeId) -> usize {
        self.blocks[bb.0]
            .preds
            .iter()
            .position(|x| *x == e)
            .expect("edge is not a predecessor of this block")
    }

    pub fn add_phi(&mut self, bb: BlockId, result: Operand) -> usize {
        let arity = self.blocks[bb.0].preds.len();
        self.blocks[bb.0].phis.push(Phi {
            result,
            args: vec![PhiArg::default(); arity],
        });
        self.blocks[bb.0].phis.len() - 1
    }

    pub fn phi_arg(&self, bb: BlockId, phi_index: usize, e: EdgeId) -> PhiArg {
        let slot = self.pred_index(bb, e);
        self.blocks[bb.0].phis[phi_index].args[slot]
    }

    pub fn set_phi_arg(
        &mut self,
        bb: BlockId,
        phi_index: usize,
        e: EdgeId,
        def: Operand,
        location: SourceLocation,
    ) {
        let slot = self.pred_index(bb, e);
        self.blocks[bb.0].phis[phi_index].args[slot] = PhiArg { def, location };
    }

    pub(crate) fn attach_edge_to_dest(&mut self, e: EdgeId, dest: BlockId) {
        self.edge_mut(e).dest = dest;
        self.blocks[dest.0].preds.push(e);
        for phi in &mut self.blocks[dest.0].phis {
            phi.args.push(PhiArg::default());
        }
    }

    /// Removes `e` from its destination, dropping the parallel phi slots.
    pub(crate) fn detach_edge_from_dest(&mut self, e: EdgeId) {
        let dest = self.edge(e).dest;
        let slot = self.pred_index(dest, e);
        self.blocks[dest.0].preds.remove(slot);
        for phi in &mut self.blocks[dest.0].phis {
            phi.args.remove(slot);
        }
    }

    pub fn dominators_or_compute(&mut self) -> &Dominators<Procedure> {
        if self.dominators.is_none() {
            self.dominators = Some(Dominators::new(self));
        }
        self.dominators.as_ref().unwrap()
    }

    pub fn invalidate_dominators(&mut self) {
        self.dominators = None;
    }

    pub fn compute_loops(&mut self) {
        self.dominators_or_compute();
        let tree = LoopTree::compute(self);
        self.loops = Some(tree);
    }

    pub fn loops(&self) -> &LoopTree {
        self.loops.as_ref().expect("loop info not computed")
    }

    pub fn loops_mut(&mut self) -> &mut LoopTree {
        self.loops.as_mut().expect("loop info not computed")
    }

    pub fn has_loops(&self) -> bool {
        self.loops.is_some()
    }

    pub fn loop_father(&self, bb: BlockId) -> LoopId {
        self.blocks[bb.0].loop_father
    }

    /// True if `bb` belongs to `l` or one of its subloops.
    pub fn block_in_loop(&self, bb: BlockId, l: LoopId) -> bool {
        self.loops().chain_contains(self.blocks[bb.0].loop_father, l)
    }

    pub fn is_loop_exit_edge(&self, l: LoopId, e: EdgeId) -> bool {
        let edge = self.edge(e);
        self.block_in_loop(edge.src, l) && !self.block_in_loop(edge.dest, l)
    }

    /// The back edge of `l`, when both its header and latch are intact.
    pub fn latch_edge(&self, l: LoopId) -> Option<EdgeId> {
        let loop_ = self.loops().loop_(l);
        let latch = loop_.latch?;
        let header = loop_.header?;
        self.find_edge(latch, header)
    }

    pub fn add_bb_to_loop(&mut self, bb: BlockId, l: LoopId) {
        self.blocks[bb.0].loop_father = l;
        self.loops_mut().bump_num_nodes(l, 1);
    }

    pub fn remove_bb_from_loop(&mut self, bb: BlockId) {
        let l = self.blocks[bb.0].loop_father;
        self.loops_mut().bump_num_nodes(l, -1);
        self.blocks[bb.0].loop_father = LoopId::root();
    }

    pub fn display(&self) -> ProcedureDisplay<'_> {
        ProcedureDisplay { proc: self }
    }
}

pub struct ProcedureDisplay<'a> {
    proc: &'a Procedure,
}

impl std::fmt::Display for ProcedureDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Procedure {{")?;
        for block in self.proc.blocks.iter() {
            block.fmt(f, self.proc)?;
        }
        writeln!(f, "}}")
    }
}

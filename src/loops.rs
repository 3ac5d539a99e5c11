use bitvec::vec::BitVec;
use indexmap::IndexMap;
use tinyvec::TinyVec;

use crate::{
    block::BlockId, cfg::make_forwarder_block, dominators::Dominators, edge::EdgeId,
    procedure::Procedure,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoopsState: u32 {
        /// Some loop lost its canonical shape; a fixup pass must rebuild the
        /// tree before loop optimizers run again.
        const NEED_FIXUP = 1 << 0;
        /// A header may have gained more than one back edge.
        const MAY_HAVE_MULTIPLE_LATCHES = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub usize);

impl LoopId {
    /// The pseudo-loop covering the whole function.
    pub fn root() -> Self {
        LoopId(0)
    }

    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl Default for LoopId {
    fn default() -> Self {
        Self(usize::MAX)
    }
}

/// One natural loop. `header` and `latch` are nulled when a transform
/// destroys the loop; the record stays in the tree so `loop_father` pointers
/// remain valid until the next fixup.
#[derive(Debug)]
pub struct Loop {
    pub header: Option<BlockId>,
    pub latch: Option<BlockId>,
    pub(crate) outer: Option<LoopId>,
    pub(crate) depth: usize,
    pub num_nodes: usize,
}

pub struct LoopTree {
    loops: Vec<Loop>,
    state: LoopsState,
    /// Where `duplicate_block` should place copies, per source loop.
    copy: IndexMap<LoopId, LoopId>,
}

impl LoopTree {
    /// Discovers natural loops from dominators: every edge whose destination
    /// dominates its source is a back edge, the destination is a header, and
    /// the body is everything that reaches a back-edge source without
    /// passing the header. Loops nest by body inclusion.
    pub fn compute(proc: &mut Procedure) -> LoopTree {
        let n = proc.num_blocks();
        let dominators = proc
            .dominators
            .take()
            .unwrap_or_else(|| Dominators::new(proc));

        let mut loops = vec![Loop {
            header: None,
            latch: None,
            outer: None,
            depth: 0,
            num_nodes: n,
        }];
        let mut state = LoopsState::default();
        let mut bodies: Vec<BitVec> = Vec::new();

        for header_index in 0..n {
            let header = BlockId(header_index);
            if !dominators.is_reachable(header) {
                continue;
            }

            let mut back_srcs: TinyVec<[BlockId; 4]> = TinyVec::new();
            for e in proc.block(header).preds() {
                let src = proc.edge(*e).src;
                if dominators.is_reachable(src) && dominators.dominates(header, src) {
                    back_srcs.push(src);
                }
            }
            if back_srcs.is_empty() {
                continue;
            }

            let mut body: BitVec = BitVec::repeat(false, n);
            body.set(header_index, true);
            let mut worklist: Vec<BlockId> = Vec::new();
            for src in back_srcs.iter() {
                if !body[src.0] {
                    body.set(src.0, true);
                    worklist.push(*src);
                }
            }
            while let Some(block) = worklist.pop() {
                for e in proc.block(block).preds() {
                    let pred = proc.edge(*e).src;
                    if !body[pred.0] {
                        body.set(pred.0, true);
                        worklist.push(pred);
                    }
                }
            }

            let latch = if back_srcs.len() == 1 {
                Some(back_srcs[0])
            } else {
                state |= LoopsState::MAY_HAVE_MULTIPLE_LATCHES;
                None
            };

            loops.push(Loop {
                header: Some(header),
                latch,
                outer: None,
                depth: 0,
                num_nodes: body.count_ones(),
            });
            bodies.push(body);
        }

        // Nest by body size: the smallest body containing a block is its
        // loop father, the smallest body properly containing a header is
        // that loop's outer loop.
        let mut order: Vec<usize> = (1..loops.len()).collect();
        order.sort_by_key(|l| loops[*l].num_nodes);

        for block_index in 0..n {
            let father = order
                .iter()
                .copied()
                .find(|&l| bodies[l - 1][block_index])
                .map(LoopId)
                .unwrap_or(LoopId::root());
            proc.block_mut(BlockId(block_index)).loop_father = father;
        }

        for l in 1..loops.len() {
            let header = loops[l].header.unwrap();
            let outer = order
                .iter()
                .copied()
                .find(|&o| o != l && bodies[o - 1][header.0])
                .map(LoopId)
                .unwrap_or(LoopId::root());
            loops[l].outer = Some(outer);
        }
        for l in 1..loops.len() {
            let mut depth = 0;
            let mut cursor = LoopId(l);
            while let Some(outer) = loops[cursor.0].outer {
                depth += 1;
                cursor = outer;
            }
            loops[l].depth = depth;
        }

        proc.dominators = Some(dominators);

        LoopTree {
            loops,
            state,
            copy: IndexMap::new(),
        }
    }

    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    pub fn loop_(&self, l: LoopId) -> &Loop {
        &self.loops[l.0]
    }

    pub fn loop_mut(&mut self, l: LoopId) -> &mut Loop {
        &mut self.loops[l.0]
    }

    pub fn outer(&self, l: LoopId) -> Option<LoopId> {
        self.loops[l.0].outer
    }

    pub fn depth(&self, l: LoopId) -> usize {
        self.loops[l.0].depth
    }

    /// True if `father` (a block's loop) lies within `l`.
    pub fn chain_contains(&self, father: LoopId, l: LoopId) -> bool {
        let mut cursor = Some(father);
        while let Some(c) = cursor {
            if c == l {
                return true;
            }
            cursor = self.loops[c.0].outer;
        }
        false
    }

    /// Real loops, innermost first. Any linear order that puts a loop before
    /// its outer loop works; depth gives one.
    pub fn innermost_first(&self) -> Vec<LoopId> {
        let mut order: Vec<LoopId> = (1..self.loops.len()).map(LoopId).collect();
        order.sort_by_key(|l| std::cmp::Reverse(self.loops[l.0].depth));
        order
    }

    pub fn state(&self) -> LoopsState {
        self.state
    }

    pub fn state_set(&mut self, flag: LoopsState) {
        self.state |= flag;
    }

    pub fn set_loop_copy(&mut self, l: LoopId, copy: Option<LoopId>) {
        match copy {
            Some(c) => {
                self.copy.insert(l, c);
            }
            None => {
                self.copy.swap_remove(&l);
            }
        }
    }

    pub fn get_loop_copy(&self, l: LoopId) -> Option<LoopId> {
        self.copy.get(&l).copied()
    }

    pub fn clear_copy_table(&mut self) {
        self.copy.clear();
    }

    pub(crate) fn bump_num_nodes(&mut self, l: LoopId, delta: isize) {
        let mut cursor = Some(l);
        while let Some(c) = cursor {
            let n = &mut self.loops[c.0].num_nodes;
            *n = n.saturating_add_signed(delta);
            cursor = self.loops[c.0].outer;
        }
    }
}

/// Gives `l` a dedicated preheader holding all its entry edges, so the
/// header keeps exactly the preheader edge and the latch edge. Returns
/// `None` when a usable preheader already exists.
pub fn create_preheader(proc: &mut Procedure, l: LoopId) -> Option<BlockId> {
    let header = proc.loops().loop_(l).header.expect("loop has no header");
    let latch_e = proc.latch_edge(l).expect("loop has no latch edge");

    let mut entries: TinyVec<[EdgeId; 4]> = TinyVec::new();
    for e in proc.block(header).preds() {
        if !proc.block_in_loop(proc.edge(*e).src, l) {
            entries.push(*e);
        }
    }
    if let [single] = &entries[..] {
        if proc.single_succ(proc.edge(*single).src).is_some() {
            return None;
        }
    }

    let fallthru = make_forwarder_block(proc, header, |_, e| e != latch_e);
    let preheader = proc.edge(fallthru).src;
    let new_header = proc.edge(fallthru).dest;

    proc.loops_mut().loop_mut(l).header = Some(new_header);
    let outer = proc.loops().outer(l).unwrap_or(LoopId::root());
    proc.remove_bb_from_loop(preheader);
    proc.add_bb_to_loop(preheader, outer);

    Some(preheader)
}

use std::borrow::Cow;
use std::fmt::Debug;
use std::hash::Hash;

/// The view of a CFG the dominator and loop analyses need.
pub trait Graph {
    type Node: Copy + Clone + PartialEq + Eq + Hash + Debug + From<usize> + Into<usize>;

    fn num_nodes(&self) -> usize;
    fn node(&self, index: usize) -> Option<Self::Node>;
    fn node_index(&self, node: Self::Node) -> usize;
    fn root(&self) -> Self::Node;
    fn successors(&self, block: Self::Node) -> Cow<[Self::Node]>;
    fn predecessors(&self, block: Self::Node) -> Cow<[Self::Node]>;
}

const NONE: usize = usize::MAX;

struct LtData {
    parent: usize,
    semi_number: usize,
    ancestor: usize,
    label: usize,
    bucket: Vec<usize>,
    dom: usize,
}

/// Lengauer and Tarjan's "A Fast Algorithm for Finding Dominators in a
/// Flowgraph" (TOPLAS 1979), the "simple" LINK/EVAL variant, with the
/// recursive DFS and EVAL converted to explicit worklists. All per-node
/// state is indexed by the graph's node index.
struct LengauerTarjan<'a, G: Graph> {
    graph: &'a G,
    data: Vec<LtData>,
    block_by_pre_number: Vec<usize>,
}

impl<'a, G: Graph> LengauerTarjan<'a, G> {
    fn new(graph: &'a G) -> Self {
        let mut data = Vec::with_capacity(graph.num_nodes());
        for index in 0..graph.num_nodes() {
            data.push(LtData {
                parent: NONE,
                semi_number: NONE,
                ancestor: NONE,
                label: index,
                bucket: Vec::new(),
                dom: NONE,
            });
        }
        Self {
            graph,
            data,
            block_by_pre_number: Vec::new(),
        }
    }

    fn compute(&mut self) {
        self.compute_depth_first_pre_numbering();
        self.compute_semi_dominators_and_implicit_immediate_dominators();
        self.compute_explicit_immediate_dominators();
    }

    fn immediate_dominator(&self, index: usize) -> usize {
        self.data[index].dom
    }

    fn compute_depth_first_pre_numbering(&mut self) {
        // The worklist tracks the index into the successor list so that a
        // successor is not visited until its earlier siblings are fully
        // processed; the first edge that reaches a block decides its parent.
        let mut seen = vec![false; self.graph.num_nodes()];
        let mut stack: Vec<(usize, usize)> = Vec::new();

        let root = self.graph.node_index(self.graph.root());
        seen[root] = true;
        stack.push((root, 0));

        while let Some((block, successor_index)) = stack.pop() {
            if successor_index == 0 {
                self.data[block].semi_number = self.block_by_pre_number.len();
                self.block_by_pre_number.push(block);
            }

            let successors = self.graph.successors(G::Node::from(block));
            if successor_index < successors.len() {
                if successor_index + 1 < successors.len() {
                    stack.push((block, successor_index + 1));
                }
                let successor = self.graph.node_index(successors[successor_index]);
                if !seen[successor] {
                    seen[successor] = true;
                    self.data[successor].parent = block;
                    stack.push((successor, 0));
                }
            }
        }
    }

    fn compute_semi_dominators_and_implicit_immediate_dominators(&mut self) {
        for current_pre_number in (1..self.block_by_pre_number.len()).rev() {
            let block = self.block_by_pre_number[current_pre_number];

            for predecessor in self
                .graph
                .predecessors(G::Node::from(block))
                .iter()
                .map(|p| self.graph.node_index(*p))
                .collect::<Vec<_>>()
            {
                if self.data[predecessor].semi_number == NONE {
                    continue;
                }
                let intermediate = self.eval(predecessor);
                let min = self.data[intermediate]
                    .semi_number
                    .min(self.data[block].semi_number);
                self.data[block].semi_number = min;
            }

            let bucket_pre_number = self.data[block].semi_number;
            let semi_block = self.block_by_pre_number[bucket_pre_number];
            self.data[semi_block].bucket.push(block);

            let parent = self.data[block].parent;
            self.data[block].ancestor = parent;

            for semi_dominee in std::mem::take(&mut self.data[parent].bucket) {
                let possible_dominator = self.eval(semi_dominee);
                if self.data[possible_dominator].semi_number < self.data[semi_dominee].semi_number {
                    self.data[semi_dominee].dom = possible_dominator;
                } else {
                    self.data[semi_dominee].dom = parent;
                }
            }
        }
    }

    fn compute_explicit_immediate_dominators(&mut self) {
        for current_pre_number in 1..self.block_by_pre_number.len() {
            let block = self.block_by_pre_number[current_pre_number];
            let semi_block = self.block_by_pre_number[self.data[block].semi_number];
            if self.data[block].dom != semi_block {
                self.data[block].dom = self.data[self.data[block].dom].dom;
            }
        }
    }

    fn eval(&mut self, block: usize) -> usize {
        if self.data[block].ancestor == NONE {
            return block;
        }
        self.compress(block);
        self.data[block].label
    }

    fn compress(&mut self, initial_block: usize) {
        let ancestor = self.data[initial_block].ancestor;
        if self.data[ancestor].ancestor == NONE {
            return;
        }

        let mut stack = Vec::with_capacity(16);
        let mut block = initial_block;
        while block != NONE {
            stack.push(block);
            block = self.data[block].ancestor;
        }

        // The top two entries are already up to date.
        let mut i = stack.len().saturating_sub(2);
        while i > 0 {
            i -= 1;
            let block = stack[i];
            let ancestor_of_block = self.data[block].ancestor;
            let label_of_ancestor = self.data[ancestor_of_block].label;
            if self.data[label_of_ancestor].semi_number < self.data[self.data[block].label].semi_number
            {
                self.data[block].label = label_of_ancestor;
            }
            self.data[block].ancestor = self.data[ancestor_of_block].ancestor;
        }
    }
}

struct DomData {
    idom_kids: Vec<usize>,
    idom_parent: usize,
    pre_number: usize,
    post_number: usize,
}

/// Immediate dominators plus the Dietz pre/post-number range trick for O(1)
/// dominance queries.
pub struct Dominators<G: Graph> {
    data: Vec<DomData>,
    marker: std::marker::PhantomData<fn(&G)>,
}

impl<G: Graph> Dominators<G> {
    pub fn new(graph: &G) -> Self {
        let mut lengauer_tarjan = LengauerTarjan::new(graph);
        lengauer_tarjan.compute();

        let mut data = Vec::with_capacity(graph.num_nodes());
        for index in 0..graph.num_nodes() {
            data.push(DomData {
                idom_kids: Vec::new(),
                idom_parent: lengauer_tarjan.immediate_dominator(index),
                pre_number: NONE,
                post_number: NONE,
            });
        }
        for index in 0..graph.num_nodes() {
            let idom = data[index].idom_parent;
            if idom != NONE {
                data[idom].idom_kids.push(index);
            }
        }

        let mut next_pre_number = 0;
        let mut next_post_number = 0;
        let mut worklist = vec![(graph.node_index(graph.root()), false)];
        while let Some((node, is_post)) = worklist.pop() {
            if is_post {
                data[node].post_number = next_post_number;
                next_post_number += 1;
            } else {
                data[node].pre_number = next_pre_number;
                next_pre_number += 1;
                worklist.push((node, true));
                for kid in data[node].idom_kids.clone() {
                    worklist.push((kid, false));
                }
            }
        }

        Self {
            data,
            marker: std::marker::PhantomData,
        }
    }

    pub fn strictly_dominates(&self, from: G::Node, to: G::Node) -> bool {
        let from = &self.data[from.into()];
        let to = &self.data[to.into()];
        to.pre_number > from.pre_number && to.post_number < from.post_number
    }

    pub fn dominates(&self, from: G::Node, to: G::Node) -> bool {
        from == to || self.strictly_dominates(from, to)
    }

    /// The immediate dominator; `None` for the root and unreachable blocks.
    pub fn idom(&self, block: G::Node) -> Option<G::Node> {
        let idom = self.data[block.into()].idom_parent;
        (idom != NONE).then(|| G::Node::from(idom))
    }

    pub fn is_reachable(&self, block: G::Node) -> bool {
        self.data[block.into()].pre_number != NONE
    }
}

use crate::{
    edge::{EdgeFlags, EdgeId},
    loops::LoopId,
    procedure::Procedure,
    profile::BRANCH_PROB_BASE,
    stmt::{Operand, SourceLocation, Stmt},
};

/// A phi argument: the value flowing in along one predecessor edge, plus the
/// source location of the assignment it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhiArg {
    pub def: Operand,
    pub location: SourceLocation,
}

/// A phi node. `args` is parallel to the owning block's predecessor list;
/// every structural CFG update preserves that bijection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub result: Operand,
    pub args: Vec<PhiArg>,
}

pub struct BasicBlock {
    pub(crate) index: usize,
    pub(crate) stmts: Vec<Stmt>,
    pub(crate) phis: Vec<Phi>,
    pub(crate) preds: Vec<EdgeId>,
    pub(crate) succs: Vec<EdgeId>,
    /// 0..=BB_FREQ_MAX, estimated execution frequency.
    pub(crate) frequency: i64,
    pub(crate) count: i64,
    pub(crate) loop_father: LoopId,
}

impl BasicBlock {
    pub fn new(index: usize, frequency: i64) -> Self {
        Self {
            index,
            stmts: Vec::new(),
            phis: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            frequency,
            count: 0,
            loop_father: LoopId::root(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.stmts
    }

    pub fn stmts_mut(&mut self) -> &mut Vec<Stmt> {
        &mut self.stmts
    }

    pub fn phis(&self) -> &[Phi] {
        &self.phis
    }

    pub fn preds(&self) -> &[EdgeId] {
        &self.preds
    }

    pub fn succs(&self) -> &[EdgeId] {
        &self.succs
    }

    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn loop_father(&self) -> LoopId {
        self.loop_father
    }

    /// The terminating control statement, if the block has one.
    pub fn ctrl_stmt(&self) -> Option<&Stmt> {
        self.stmts.last().filter(|s| s.is_ctrl())
    }

    pub(crate) fn fmt<W: std::fmt::Write>(&self, f: &mut W, proc: &Procedure) -> std::fmt::Result {
        writeln!(f, "BB{}: ; frequency = {}, count = {}", self.index, self.frequency, self.count)?;
        if !self.preds.is_empty() {
            write!(f, "  Predecessors:")?;
            for pred in &self.preds {
                write!(f, " BB{}", proc.edge(*pred).src.0)?;
            }
            writeln!(f)?;
        }
        for phi in &self.phis {
            write!(f, "    {} = phi(", phi.result)?;
            for (i, arg) in phi.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg.def)?;
            }
            writeln!(f, ")")?;
        }
        for stmt in &self.stmts {
            writeln!(f, "    {:?}", stmt)?;
        }
        if !self.succs.is_empty() {
            write!(f, "  Successors:")?;
            for succ in &self.succs {
                write!(f, " BB{}", proc.edge(*succ).dest.0)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl Default for BlockId {
    fn default() -> Self {
        Self(usize::MAX)
    }
}

impl From<usize> for BlockId {
    fn from(x: usize) -> Self {
        BlockId(x)
    }
}

impl From<BlockId> for usize {
    fn from(x: BlockId) -> usize {
        x.0
    }
}

/// Appends statements and terminators to one block.
pub struct BasicBlockBuilder<'a> {
    pub proc: &'a mut Procedure,
    pub block: BlockId,
}

impl<'a> BasicBlockBuilder<'a> {
    pub fn new(proc: &'a mut Procedure, block: BlockId) -> Self {
        Self { proc, block }
    }

    pub fn add_label(&mut self, n: u32) -> &mut Self {
        self.proc.block_mut(self.block).stmts.push(Stmt::Label(n));
        self
    }

    pub fn add_assign(&mut self, lhs: Operand, rhs: Operand) -> &mut Self {
        self.proc
            .block_mut(self.block)
            .stmts
            .push(Stmt::Assign { lhs, rhs });
        self
    }

    pub fn add_nop(&mut self) -> &mut Self {
        self.proc.block_mut(self.block).stmts.push(Stmt::Nop);
        self
    }

    pub fn add_debug(&mut self) -> &mut Self {
        self.proc.block_mut(self.block).stmts.push(Stmt::DebugMarker);
        self
    }

    /// Terminate with a two-way branch; the probability mass is split evenly.
    pub fn add_cond(
        &mut self,
        lhs: Operand,
        rhs: Operand,
        taken: BlockId,
        not_taken: BlockId,
    ) -> (EdgeId, EdgeId) {
        self.proc
            .block_mut(self.block)
            .stmts
            .push(Stmt::Cond { lhs, rhs });
        let t = self.proc.make_edge(self.block, taken, EdgeFlags::TRUE_VALUE);
        let f = self
            .proc
            .make_edge(self.block, not_taken, EdgeFlags::FALSE_VALUE);
        self.proc.edge_mut(t).probability = BRANCH_PROB_BASE / 2;
        self.proc.edge_mut(f).probability = BRANCH_PROB_BASE / 2;
        (t, f)
    }

    pub fn add_goto(&mut self, dest: BlockId) -> EdgeId {
        self.proc.block_mut(self.block).stmts.push(Stmt::Goto);
        let e = self.proc.make_edge(self.block, dest, EdgeFlags::empty());
        self.proc.edge_mut(e).probability = BRANCH_PROB_BASE;
        e
    }

    /// Terminate without a statement; control falls through.
    pub fn add_fallthru(&mut self, dest: BlockId) -> EdgeId {
        let e = self.proc.make_edge(self.block, dest, EdgeFlags::FALLTHRU);
        self.proc.edge_mut(e).probability = BRANCH_PROB_BASE;
        e
    }

    pub fn add_switch(&mut self, index: Operand, dests: &[BlockId]) -> Vec<EdgeId> {
        self.proc
            .block_mut(self.block)
            .stmts
            .push(Stmt::Switch { index });
        let share = BRANCH_PROB_BASE / dests.len() as i64;
        dests
            .iter()
            .map(|dest| {
                let e = self.proc.make_edge(self.block, *dest, EdgeFlags::empty());
                self.proc.edge_mut(e).probability = share;
                e
            })
            .collect()
    }

    pub fn add_phi(&mut self, result: Operand) -> usize {
        self.proc.add_phi(self.block, result)
    }
}

use crate::{jump_threading::ThreadPath, sparse_collection::SparseElement, BlockId};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EdgeFlags: u32 {
        const FALLTHRU = 1 << 0;
        const TRUE_VALUE = 1 << 1;
        const FALSE_VALUE = 1 << 2;
        const ABNORMAL = 1 << 3;
    }
}

/// A directed CFG edge. Edges have stable identity: redirecting one mutates
/// its `dest` in place, so a registered thread path keeps referring to the
/// same edge across splits and redirects.
pub struct Edge {
    pub(crate) index: usize,
    pub src: BlockId,
    pub dest: BlockId,
    pub flags: EdgeFlags,
    /// 0..=BRANCH_PROB_BASE, the share of `src`'s outgoing flow.
    pub probability: i64,
    pub count: i64,
    /// The one annotation slot: the thread path starting at this edge.
    pub aux: Option<ThreadPath>,
}

impl Edge {
    pub fn new(src: BlockId, dest: BlockId, flags: EdgeFlags) -> Self {
        Self {
            index: usize::MAX,
            src,
            dest,
            flags,
            probability: 0,
            count: 0,
            aux: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

impl Default for EdgeId {
    fn default() -> Self {
        Self(usize::MAX)
    }
}

impl EdgeId {
    /// The "destination unknown" sentinel upstream producers may leave in a
    /// path step; such paths are cancelled at registration.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_invalid(self) -> bool {
        self.0 == usize::MAX
    }
}

impl From<usize> for EdgeId {
    fn from(x: usize) -> Self {
        EdgeId(x)
    }
}

impl From<EdgeId> for usize {
    fn from(x: EdgeId) -> usize {
        x.0
    }
}

impl SparseElement for Edge {
    type Id = EdgeId;

    fn id(&self) -> Self::Id {
        EdgeId(self.index)
    }

    fn set_id(&mut self, id: Self::Id) {
        self.index = id.0;
    }
}

/// An SSA operand. `Unset` marks a phi argument slot that has been allocated
/// for a new predecessor edge but not written yet; no slot stays `Unset` once
/// a structural update finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    #[default]
    Unset,
    Ssa(u32),
    Const(i64),
}

impl Operand {
    pub fn is_set(self) -> bool {
        self != Operand::Unset
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Unset => write!(f, "_"),
            Operand::Ssa(n) => write!(f, "v{}", n),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceLocation(pub u32);

impl SourceLocation {
    pub const UNKNOWN: SourceLocation = SourceLocation(0);
}

/// The statement forms the engine can observe. A block holds at most one
/// control statement, and only as its last statement; a block whose last
/// statement is not a control statement falls through along its single
/// outgoing edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Label(u32),
    DebugMarker,
    Nop,
    Assign { lhs: Operand, rhs: Operand },
    Cond { lhs: Operand, rhs: Operand },
    Goto,
    Switch { index: Operand },
}

impl Stmt {
    pub fn is_ctrl(&self) -> bool {
        matches!(self, Stmt::Cond { .. } | Stmt::Goto | Stmt::Switch { .. })
    }

    /// Labels, debug markers and nops never need to be duplicated.
    pub fn is_filler(&self) -> bool {
        matches!(self, Stmt::Label(_) | Stmt::DebugMarker | Stmt::Nop)
    }
}

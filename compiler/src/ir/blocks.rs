//! Scheduled Blocks
//!
//! A block is an ordered schedule of fixed nodes with a single entry. Phis sit
//! at the top of a merge block, one input per predecessor, in predecessor
//! order. Control transfer nodes (`If`, `Return`) are the last entry of the
//! schedule; a block without one falls through to its single successor.

use super::{BlockId, NodeId};
use std::fmt;

/// A scheduled block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Unique identifier for this block
    pub id: BlockId,

    /// Human-readable label (for debugging)
    pub label: Option<String>,

    /// Fixed nodes in execution order
    pub nodes: Vec<NodeId>,

    /// Phi nodes at the beginning of this block
    pub phis: Vec<NodeId>,

    /// Predecessors in the CFG; phi input `i` flows in from `predecessors[i]`
    pub predecessors: Vec<BlockId>,

    /// Successors in the CFG
    pub successors: Vec<BlockId>,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            label: None,
            nodes: Vec::new(),
            phis: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn with_label(id: BlockId, label: impl Into<String>) -> Self {
        let mut block = Self::new(id);
        block.label = Some(label.into());
        block
    }

    pub fn is_merge(&self) -> bool {
        self.predecessors.len() > 1
    }

    /// Index of `pred` among this block's predecessors.
    pub fn predecessor_index(&self, pred: BlockId) -> Option<usize> {
        self.predecessors.iter().position(|p| *p == pred)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", self.id, label),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Insertion point for nodes synthesized by the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// Immediately before a scheduled node
    Before(NodeId),
    /// At the end of a block, before its control transfer node if any
    BlockEnd(BlockId),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Before(node) => write!(f, "before {}", node),
            Position::BlockEnd(block) => write!(f, "end of {}", block),
        }
    }
}

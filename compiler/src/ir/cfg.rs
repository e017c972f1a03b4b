//! Control flow metadata
//!
//! [`ControlFlowGraph`] is the scheduling information the escape analysis
//! walks: predecessor and successor lists, dominators and loop nesting. It
//! only refers to blocks by id, so the block iterator never touches nodes.

use super::{BlockId, DominatorTree, Graph, Loop, LoopNestInfo};
use std::fmt;

/// Shapes of control flow the analysis cannot walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    /// The graph has no blocks
    MissingEntryBlock,

    /// Block references a block that does not exist
    InvalidSuccessor { block: BlockId, successor: BlockId },

    /// Edge into a merge from a block with several successors
    CriticalEdge { from: BlockId, to: BlockId },

    /// Loop exit entered from more than one block
    LoopExitWithMultiplePredecessors { exit: BlockId },

    /// Loop header whose first predecessor is not the single forward entry
    MalformedLoopHeader { header: BlockId },

    /// Retreating edge to a block that does not dominate its source
    IrreducibleEdge { from: BlockId, to: BlockId },

    /// Blocks not reachable from the entry
    UnreachableBlocks { blocks: Vec<BlockId> },
}

impl fmt::Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfgError::MissingEntryBlock => write!(f, "CFG missing entry block"),
            CfgError::InvalidSuccessor { block, successor } => {
                write!(f, "Block {} references invalid successor {}", block, successor)
            }
            CfgError::CriticalEdge { from, to } => {
                write!(f, "Critical edge from {} to {} must be split", from, to)
            }
            CfgError::LoopExitWithMultiplePredecessors { exit } => {
                write!(f, "Loop exit {} has more than one predecessor", exit)
            }
            CfgError::MalformedLoopHeader { header } => write!(
                f,
                "Loop header {} must have its forward entry as the only first predecessor",
                header
            ),
            CfgError::IrreducibleEdge { from, to } => {
                write!(f, "Irreducible control flow edge from {} to {}", from, to)
            }
            CfgError::UnreachableBlocks { blocks } => {
                write!(f, "CFG contains unreachable blocks: {:?}", blocks)
            }
        }
    }
}

impl std::error::Error for CfgError {}

/// Block-level control flow of one graph
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    entry: BlockId,
    predecessors: Vec<Vec<BlockId>>,
    successors: Vec<Vec<BlockId>>,
    dominators: DominatorTree,
    loops: LoopNestInfo,
}

impl ControlFlowGraph {
    /// Compute and verify the control flow metadata of `graph`.
    pub fn compute(graph: &Graph) -> Result<Self, CfgError> {
        if graph.block_count() == 0 {
            return Err(CfgError::MissingEntryBlock);
        }
        for block in graph.blocks() {
            for &succ in &block.successors {
                if graph.block(succ).is_none() {
                    return Err(CfgError::InvalidSuccessor {
                        block: block.id,
                        successor: succ,
                    });
                }
            }
        }

        let dominators = DominatorTree::compute(graph);
        let (loops, irreducible) = LoopNestInfo::analyze(graph, &dominators);
        if let Some(&(from, to)) = irreducible.first() {
            return Err(CfgError::IrreducibleEdge { from, to });
        }

        let cfg = Self {
            entry: graph.entry(),
            predecessors: graph.blocks().iter().map(|b| b.predecessors.clone()).collect(),
            successors: graph.blocks().iter().map(|b| b.successors.clone()).collect(),
            dominators,
            loops,
        };
        cfg.verify()?;
        Ok(cfg)
    }

    /// Checks the shape the block iterator relies on.
    pub fn verify(&self) -> Result<(), CfgError> {
        let unreachable: Vec<BlockId> = (0..self.block_count())
            .map(|i| BlockId::new(i as u32))
            .filter(|b| !self.dominators.is_reachable(*b))
            .collect();
        if !unreachable.is_empty() {
            return Err(CfgError::UnreachableBlocks {
                blocks: unreachable,
            });
        }

        for index in 0..self.block_count() {
            let block = BlockId::new(index as u32);
            let preds = self.predecessors(block);
            if preds.len() > 1 {
                if let Some(&from) = preds.iter().find(|p| self.successors(**p).len() != 1) {
                    return Err(CfgError::CriticalEdge { from, to: block });
                }
            }
        }

        for l in self.loops.loops.values() {
            let preds = self.predecessors(l.header);
            let forward_ok = preds.first().map_or(false, |p| !l.contains(*p))
                && preds[1..].iter().all(|p| l.contains(*p));
            if !forward_ok {
                return Err(CfgError::MalformedLoopHeader { header: l.header });
            }
            for &exit in &l.exits {
                if self.predecessors(exit).len() != 1 {
                    return Err(CfgError::LoopExitWithMultiplePredecessors { exit });
                }
            }
        }
        Ok(())
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn block_count(&self) -> usize {
        self.successors.len()
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.predecessors
            .get(block.index())
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.successors
            .get(block.index())
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn dominators(&self) -> &DominatorTree {
        &self.dominators
    }

    /// Loop headed by `block`, if any.
    pub fn loop_at(&self, header: BlockId) -> Option<&Loop> {
        self.loops.loops.get(&header)
    }

    pub fn innermost_loop(&self, block: BlockId) -> Option<&Loop> {
        self.loops.innermost_loop(block)
    }

    pub fn loops(&self) -> impl Iterator<Item = &Loop> {
        self.loops.loops.values()
    }

    pub fn max_loop_depth(&self) -> usize {
        self.loops.max_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, ValueKind};

    #[test]
    fn test_rejects_critical_edge() {
        let mut b = GraphBuilder::new();
        let cond = b.build_parameter(0, ValueKind::Bool);
        let then_block = b.create_block("then");
        let merge = b.create_block("merge");
        let entry = b.entry();
        b.build_if(cond, then_block, merge).unwrap();
        b.switch_to_block(then_block);
        b.build_goto(merge).unwrap();

        let graph = b.finish();
        assert_eq!(
            ControlFlowGraph::compute(&graph).unwrap_err(),
            CfgError::CriticalEdge {
                from: entry,
                to: merge
            }
        );
    }

    #[test]
    fn test_rejects_unreachable_block() {
        let mut b = GraphBuilder::new();
        let orphan = b.create_block("orphan");
        b.build_return(None).unwrap();

        let graph = b.finish();
        assert_eq!(
            ControlFlowGraph::compute(&graph).unwrap_err(),
            CfgError::UnreachableBlocks {
                blocks: vec![orphan]
            }
        );
    }

    #[test]
    fn test_accepts_split_diamond() {
        let mut b = GraphBuilder::new();
        let cond = b.build_parameter(0, ValueKind::Bool);
        let left = b.create_block("left");
        let right = b.create_block("right");
        let merge = b.create_block("merge");
        b.build_if(cond, left, right).unwrap();
        for arm in [left, right] {
            b.switch_to_block(arm);
            b.build_goto(merge).unwrap();
        }
        b.switch_to_block(merge);
        b.build_return(None).unwrap();

        let cfg = ControlFlowGraph::compute(&b.finish()).unwrap();
        assert_eq!(cfg.predecessors(merge), &[left, right]);
        assert!(cfg.loops().next().is_none());
    }
}

//! The partial escape analysis as a block iterator closure

use super::block_iterator::{self, BlockIteratorClosure, MergeableBlockState};
use super::context::AnalysisContext;
use super::effects::EffectList;
use super::state::BlockState;
use super::{EscapeAnalysisConfig, EscapeAnalysisError};
use crate::ir::{BlockId, ControlFlowGraph, Graph, Loop};

/// Drives [`AnalysisContext`] over the blocks of one graph and collects the
/// resulting effects.
pub struct PartialEscapeClosure<'g> {
    pub(super) ctx: AnalysisContext<'g>,
    pub(super) effects: EffectList,
    pub(super) cfg: &'g ControlFlowGraph,
}

impl<'g> PartialEscapeClosure<'g> {
    pub fn new(graph: &'g Graph, cfg: &'g ControlFlowGraph, config: &'g EscapeAnalysisConfig) -> Self {
        Self {
            ctx: AnalysisContext::new(graph, config),
            effects: EffectList::new(),
            cfg,
        }
    }

    /// Walk the whole graph from its entry block.
    pub fn run(mut self) -> Result<(EffectList, AnalysisContext<'g>), EscapeAnalysisError> {
        let cfg = self.cfg;
        block_iterator::apply(&mut self, cfg, cfg.entry(), BlockState::new(), None)?;
        Ok((self.effects, self.ctx))
    }
}

impl<'g> BlockIteratorClosure for PartialEscapeClosure<'g> {
    type State = BlockState;

    fn process_block(&mut self, block: BlockId, state: &mut BlockState) -> Result<(), EscapeAnalysisError> {
        let graph = self.ctx.graph;
        let Some(b) = graph.block(block) else {
            return Err(EscapeAnalysisError::InvalidGraph(format!("missing block {}", block)));
        };
        self.ctx.stats.blocks_processed += 1;
        for &node in &b.nodes {
            self.ctx.process_node(node, state, &mut self.effects)?;
        }
        Ok(())
    }

    fn merge(
        &mut self,
        merge: BlockId,
        states: &mut [BlockState],
    ) -> Result<Option<BlockState>, EscapeAnalysisError> {
        let predecessors = self.cfg.predecessors(merge);
        let merged = self
            .ctx
            .merge_states(merge, predecessors, states, &mut self.effects)?;
        Ok(Some(merged))
    }

    fn after_split(&mut self, _block: BlockId, state: &BlockState) -> BlockState {
        state.clone_state()
    }

    fn process_loop(&mut self, l: &Loop, initial: BlockState) -> Result<Vec<BlockState>, EscapeAnalysisError> {
        self.process_loop_until_stable(l, initial)
    }
}

//! Partial escape analysis phase
//!
//! Entry points that run the analysis over whole graphs: [`PartialEscapePhase::analyze`]
//! only computes the effects, [`PartialEscapePhase::run`] also applies them
//! and removes the nodes they made obsolete.

use super::closure::PartialEscapeClosure;
use super::effects::EffectList;
use super::{EscapeAnalysisConfig, EscapeAnalysisError, EscapeAnalysisStats};
use crate::ir::{
    ControlFlowGraph, DeadCodeEliminationPass, Graph, NodeId, OptimizationPass, OptimizationResult,
    PassError,
};
use rayon::prelude::*;
use tracing::debug;

/// Everything one analysis run produced
#[derive(Debug, Clone, Default)]
pub struct EscapeAnalysisReport {
    /// Graph edits, in the order they must be applied
    pub effects: EffectList,
    pub stats: EscapeAnalysisStats,
    /// A node without an escape rule consumed a tracked object
    pub unclassified_usage: bool,
    /// Nodes the applied effects made obsolete; empty until applied
    pub obsolete: Vec<NodeId>,
}

impl EscapeAnalysisReport {
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartialEscapePhase {
    config: EscapeAnalysisConfig,
}

impl PartialEscapePhase {
    pub fn new(config: EscapeAnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscapeAnalysisConfig {
        &self.config
    }

    /// Analyze `graph` without changing it.
    pub fn analyze(&self, graph: &Graph) -> Result<EscapeAnalysisReport, EscapeAnalysisError> {
        if !self.config.enabled {
            return Ok(EscapeAnalysisReport::default());
        }
        let cfg = ControlFlowGraph::compute(graph)?;
        let closure = PartialEscapeClosure::new(graph, &cfg, &self.config);
        let (effects, ctx) = closure.run()?;

        let mut stats = ctx.stats.clone();
        stats.record_effects(graph, &effects);
        if self.config.trace_effects {
            effects.trace();
        }
        Ok(EscapeAnalysisReport {
            effects,
            stats,
            unclassified_usage: ctx.unclassified_usage,
            obsolete: Vec::new(),
        })
    }

    /// Analyze `graph`, apply the effects and remove dead nodes.
    pub fn run(&self, graph: &mut Graph) -> Result<EscapeAnalysisReport, EscapeAnalysisError> {
        let mut report = self.analyze(graph)?;
        if report.is_empty() {
            return Ok(report);
        }
        report.obsolete = report.effects.apply(graph)?;
        let dce = DeadCodeEliminationPass::new().eliminate(graph, &report.obsolete);
        debug!(
            "partial escape analysis: {} effects, {}; {} nodes removed",
            report.effects.len(),
            report.stats,
            dce.removed.len()
        );
        Ok(report)
    }

    /// Run the phase on independent graphs in parallel.
    pub fn run_batch(&self, graphs: &mut [Graph]) -> Vec<Result<EscapeAnalysisReport, EscapeAnalysisError>> {
        graphs.par_iter_mut().map(|graph| self.run(graph)).collect()
    }
}

impl OptimizationPass for PartialEscapePhase {
    fn name(&self) -> &'static str {
        "partial-escape-analysis"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<OptimizationResult, PassError> {
        let before = graph.node_count();
        let report = self.run(graph)?;
        if report.is_empty() {
            return Ok(OptimizationResult::unchanged());
        }
        let mut result = OptimizationResult::changed();
        result.nodes_eliminated = before.saturating_sub(graph.node_count());
        result.stats = report.stats.to_map();
        Ok(result)
    }
}

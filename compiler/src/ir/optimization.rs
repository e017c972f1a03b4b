//! Optimization Passes
//!
//! This module defines the pass interface shared by graph optimizations, the
//! pass manager that sequences them, and dead-code elimination, which cleans
//! up the nodes other passes make obsolete.

use super::{Graph, NodeId};
use fxhash::FxHashSet;
use log::{debug, warn};
use std::collections::HashMap;

/// Error returned by a failing pass; aborts the compilation.
pub type PassError = Box<dyn std::error::Error + Send + Sync>;

/// Optimization pass trait
pub trait OptimizationPass {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on one graph
    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<OptimizationResult, PassError>;
}

/// Result of an optimization pass
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Number of nodes eliminated
    pub nodes_eliminated: usize,

    /// Other statistics
    pub stats: HashMap<String, usize>,
}

impl OptimizationResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Create a result indicating changes
    pub fn changed() -> Self {
        Self {
            modified: true,
            ..Self::default()
        }
    }

    /// Combine results
    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        self.nodes_eliminated += other.nodes_eliminated;

        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }

        self
    }
}

/// Optimization pass manager
///
/// Runs every pass once, in insertion order. The escape analysis is not
/// idempotent on materialized allocations, so there is no fixpoint loop.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn OptimizationPass + Send>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pass to the manager
    pub fn add_pass<P: OptimizationPass + Send + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run all passes on a graph, stopping at the first failure.
    pub fn run(&mut self, graph: &mut Graph) -> Result<OptimizationResult, PassError> {
        let mut total_result = OptimizationResult::unchanged();
        for pass in &mut self.passes {
            debug!("running pass {}", pass.name());
            let result = pass.run_on_graph(graph)?;
            total_result = total_result.combine(result);
        }
        Ok(total_result)
    }
}

/// Outcome of a dead-code elimination run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadCodeReport {
    /// Nodes deleted from the arena
    pub removed: Vec<NodeId>,

    /// Obsolete nodes that still have live users; unscheduled but kept
    pub dangling: Vec<NodeId>,
}

/// Dead code elimination pass
///
/// Deletes obsolete nodes and every side-effect-free node left without
/// usages, iterating until nothing more becomes unused.
#[derive(Debug, Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self
    }

    /// References made by live nodes outside `dead`.
    fn find_used_nodes(graph: &Graph, dead: &FxHashSet<NodeId>) -> FxHashSet<NodeId> {
        graph
            .live_nodes()
            .filter(|(id, _)| !dead.contains(id))
            .flat_map(|(_, node)| node.references().collect::<Vec<_>>())
            .collect()
    }

    /// Remove `obsolete` nodes plus everything that becomes unused.
    pub fn eliminate(&self, graph: &mut Graph, obsolete: &[NodeId]) -> DeadCodeReport {
        let mut dead: FxHashSet<NodeId> = obsolete
            .iter()
            .copied()
            .filter(|n| graph.contains(*n))
            .collect();

        let used = loop {
            let used = Self::find_used_nodes(graph, &dead);
            let newly_dead: Vec<NodeId> = graph
                .live_nodes()
                .filter(|(id, node)| {
                    !dead.contains(id) && !used.contains(id) && node.kind.is_removable_when_unused()
                })
                .map(|(id, _)| id)
                .collect();
            if newly_dead.is_empty() {
                break used;
            }
            dead.extend(newly_dead);
        };

        let mut dead: Vec<NodeId> = dead.into_iter().collect();
        dead.sort();

        let mut report = DeadCodeReport::default();
        for id in dead {
            if used.contains(&id) {
                warn!("obsolete node {} still has usages, keeping it", id);
                let _ = graph.unschedule(id);
                report.dangling.push(id);
            } else if graph.remove_node(id).is_ok() {
                report.removed.push(id);
            }
        }
        debug!(
            "dead code elimination removed {} nodes ({} dangling)",
            report.removed.len(),
            report.dangling.len()
        );
        report
    }
}

impl OptimizationPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<OptimizationResult, PassError> {
        let report = self.eliminate(graph, &[]);
        let mut result = OptimizationResult::unchanged();
        if !report.removed.is_empty() {
            result.modified = true;
            result.nodes_eliminated = report.removed.len();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArithmeticOp, GraphBuilder, ValueKind};

    #[test]
    fn test_removes_unused_pure_nodes() {
        let mut b = GraphBuilder::new();
        let one = b.build_int(1);
        let two = b.build_int(2);
        let sum = b.build_arithmetic(ArithmeticOp::Add, one, two).unwrap();
        let kept = b.build_int(3);
        b.build_return(Some(kept)).unwrap();
        let mut graph = b.finish();

        let mut dce = DeadCodeEliminationPass::new();
        let result = dce.run_on_graph(&mut graph).unwrap();

        assert!(result.modified);
        assert!(!graph.contains(sum));
        assert!(!graph.contains(one));
        assert!(!graph.contains(two));
        assert!(graph.contains(kept));
    }

    #[test]
    fn test_obsolete_node_with_users_is_dangling() {
        let mut b = GraphBuilder::new();
        let value = b.build_parameter(0, ValueKind::Object);
        let call = b.build_invoke("consume", &[value], ValueKind::Void).unwrap();
        let user = b.build_invoke("consume", &[call], ValueKind::Void).unwrap();
        let mut graph = b.finish();

        let report = DeadCodeEliminationPass::new().eliminate(&mut graph, &[call]);
        assert_eq!(report.dangling, vec![call]);
        assert!(report.removed.is_empty());
        assert!(graph.contains(user));
        assert_eq!(graph.node(call).unwrap().block, None);
    }

    #[test]
    fn test_result_combine() {
        let mut a = OptimizationResult::changed();
        a.stats.insert("loads".into(), 2);
        let mut b = OptimizationResult::unchanged();
        b.nodes_eliminated = 3;
        b.stats.insert("loads".into(), 1);

        let combined = a.combine(b);
        assert!(combined.modified);
        assert_eq!(combined.nodes_eliminated, 3);
        assert_eq!(combined.stats["loads"], 3);
    }
}

//! Counters collected while the analysis runs

use super::effects::{Effect, EffectList};
use crate::ir::{Graph, NodeKind};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscapeAnalysisStats {
    /// Allocations replaced by virtual objects
    pub allocations_virtualized: usize,
    /// Fields and elements tracked for virtual objects
    pub fields_virtualized: usize,
    /// Materializations recorded in the final effect list
    pub materializations: usize,
    /// Field patches closing materialization cycles
    pub patched_fields: usize,
    pub loads_removed: usize,
    pub stores_removed: usize,
    pub monitors_removed: usize,
    /// Type checks, null checks, identity comparisons and hub or length
    /// reads folded to a constant or to their input
    pub checks_folded: usize,
    /// Loop bodies processed, counting retries
    pub loop_attempts: usize,
    pub loop_retries: usize,
    /// Merges processed, counting those of discarded loop attempts
    pub merges: usize,
    /// Phis added for merged fields, loop-carried fields and mixed objects
    pub phis_created: usize,
    pub blocks_processed: usize,
}

impl EscapeAnalysisStats {
    /// Count what the final effect list does to `graph`. Discarded loop
    /// attempts are not part of the list and do not show up here.
    pub fn record_effects(&mut self, graph: &Graph, effects: &EffectList) {
        for effect in effects.iter() {
            match effect {
                Effect::AddMaterialization { .. } => self.materializations += 1,
                Effect::AddFloatingNode {
                    kind: NodeKind::Phi { .. },
                    ..
                } => self.phis_created += 1,
                Effect::PatchField { .. } => self.patched_fields += 1,
                Effect::EliminateMonitor { .. } => self.monitors_removed += 1,
                Effect::DeleteNode { node } => match graph.node(*node) {
                    Some(n) => match n.kind {
                        NodeKind::NewInstance { .. } | NodeKind::NewArray { .. } => {
                            self.allocations_virtualized += 1;
                            self.fields_virtualized += n.inputs.len();
                        }
                        NodeKind::LoadField { .. } | NodeKind::LoadIndexed { .. } => {
                            self.loads_removed += 1
                        }
                        NodeKind::StoreField { .. } | NodeKind::StoreIndexed { .. } => {
                            self.stores_removed += 1
                        }
                        _ => self.checks_folded += 1,
                    },
                    None => {}
                },
                _ => {}
            }
        }
    }

    pub fn combine(&mut self, other: &EscapeAnalysisStats) {
        self.allocations_virtualized += other.allocations_virtualized;
        self.fields_virtualized += other.fields_virtualized;
        self.materializations += other.materializations;
        self.patched_fields += other.patched_fields;
        self.loads_removed += other.loads_removed;
        self.stores_removed += other.stores_removed;
        self.monitors_removed += other.monitors_removed;
        self.checks_folded += other.checks_folded;
        self.loop_attempts += other.loop_attempts;
        self.loop_retries += other.loop_retries;
        self.merges += other.merges;
        self.phis_created += other.phis_created;
        self.blocks_processed += other.blocks_processed;
    }

    /// Named counters, as reported through the pass manager.
    pub fn to_map(&self) -> HashMap<String, usize> {
        [
            ("allocations_virtualized", self.allocations_virtualized),
            ("fields_virtualized", self.fields_virtualized),
            ("materializations", self.materializations),
            ("patched_fields", self.patched_fields),
            ("loads_removed", self.loads_removed),
            ("stores_removed", self.stores_removed),
            ("monitors_removed", self.monitors_removed),
            ("checks_folded", self.checks_folded),
            ("loop_attempts", self.loop_attempts),
            ("loop_retries", self.loop_retries),
            ("merges", self.merges),
            ("phis_created", self.phis_created),
            ("blocks_processed", self.blocks_processed),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

impl fmt::Display for EscapeAnalysisStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} virtualized, {} materialized, {} loads / {} stores removed, {} loop attempts",
            self.allocations_virtualized,
            self.materializations,
            self.loads_removed,
            self.stores_removed,
            self.loop_attempts
        )
    }
}

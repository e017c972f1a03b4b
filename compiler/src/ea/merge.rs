//! Joining states at control-flow merges

use super::context::AnalysisContext;
use super::effects::EffectList;
use super::state::{BlockState, ObjectState};
use super::EscapeAnalysisError;
use crate::ir::{BlockId, NodeId, Position, ValueKind, VirtualObjectId};
use fxhash::{FxHashMap, FxHashSet};
use log::trace;
use std::collections::BTreeSet;

/// Field phis created while merging one block, reused across fixpoint rounds
#[derive(Default)]
struct FieldPhis {
    phis: FxHashMap<(VirtualObjectId, usize), NodeId>,
    /// Phis of objects that later rounds merged as real objects
    superseded: FxHashSet<NodeId>,
}

impl FieldPhis {
    fn get(&self, object: VirtualObjectId, index: usize) -> Option<NodeId> {
        self.phis.get(&(object, index)).copied()
    }

    fn insert(&mut self, object: VirtualObjectId, index: usize, phi: NodeId) {
        self.phis.insert((object, index), phi);
    }

    /// `object` is no longer merged field by field.
    fn supersede(&mut self, object: VirtualObjectId) {
        let superseded = &mut self.superseded;
        self.phis.retain(|(o, _), phi| {
            if *o == object {
                superseded.insert(*phi);
                false
            } else {
                true
            }
        });
    }
}

impl<'g> AnalysisContext<'g> {
    /// Combine the states reaching `merge`, one per entry of `predecessors`.
    ///
    /// Materializing an object on one path can turn a phi or another object
    /// into a mixed virtual/real value, so merging repeats until a round
    /// materializes nothing.
    pub fn merge_states(
        &mut self,
        merge: BlockId,
        predecessors: &[BlockId],
        states: &mut [BlockState],
        effects: &mut EffectList,
    ) -> Result<BlockState, EscapeAnalysisError> {
        self.stats.merges += 1;
        let mut merged = BlockState::new();
        let Some((first, rest)) = states.split_first() else {
            return Ok(merged);
        };
        if predecessors.len() != states.len() {
            return Err(EscapeAnalysisError::InvalidGraph(format!(
                "{} has {} predecessors but {} states",
                merge,
                predecessors.len(),
                states.len()
            )));
        }

        let aliases: Vec<(NodeId, VirtualObjectId)> = first
            .aliases()
            .filter(|(node, object)| rest.iter().all(|s| s.alias_of(*node) == Some(*object)))
            .collect();
        let scalars: Vec<(NodeId, NodeId)> = first
            .scalar_aliases()
            .filter(|(node, value)| rest.iter().all(|s| s.scalar_alias_of(*node) == Some(*value)))
            .collect();
        for (node, value) in scalars {
            merged.add_scalar_alias(node, value);
        }
        let objects: BTreeSet<VirtualObjectId> = aliases.iter().map(|(_, o)| *o).collect();

        let graph = self.graph;
        let phis: Vec<NodeId> = graph
            .block(merge)
            .map(|b| b.phis.clone())
            .unwrap_or_default();
        let mut field_phis = FieldPhis::default();

        let mut round = 0;
        loop {
            round += 1;
            let mut materialized = false;
            for &object in &objects {
                if merged.materialized_value(object).is_some() {
                    continue;
                }
                materialized |= self.merge_object(
                    merge,
                    predecessors,
                    object,
                    states,
                    &mut merged,
                    &mut field_phis,
                    effects,
                )?;
            }
            for &(node, object) in &aliases {
                if merged.object_state(object).is_some() {
                    merged.add_alias(node, object);
                }
            }
            for &phi in &phis {
                if self.is_marked(phi) {
                    materialized |= self.merge_phi(predecessors, phi, states, &mut merged, effects)?;
                }
            }
            if !materialized {
                break;
            }
        }
        if !field_phis.superseded.is_empty() {
            effects.discard_phis(&field_phis.superseded);
        }
        trace!("merged {} states at {} in {} rounds", states.len(), merge, round);
        Ok(merged)
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_object(
        &mut self,
        merge: BlockId,
        predecessors: &[BlockId],
        object: VirtualObjectId,
        states: &mut [BlockState],
        merged: &mut BlockState,
        field_phis: &mut FieldPhis,
        effects: &mut EffectList,
    ) -> Result<bool, EscapeAnalysisError> {
        let mut lock_count = None;
        let mut virtual_count = 0;
        let mut single_value = None;
        let mut values_agree = true;
        for state in states.iter() {
            let object_state = state.object_state(object).ok_or_else(|| {
                EscapeAnalysisError::InvalidGraph(format!("{} is aliased but untracked at {}", object, merge))
            })?;
            match lock_count {
                None => lock_count = Some(object_state.lock_count),
                Some(count) if count != object_state.lock_count => {
                    return Err(EscapeAnalysisError::LockCountMismatch { merge, object })
                }
                Some(_) => {}
            }
            match object_state.materialized_value() {
                None => virtual_count += 1,
                Some(value) => match single_value {
                    None => single_value = Some(value),
                    Some(single) if single != value => values_agree = false,
                    Some(_) => {}
                },
            }
        }
        let lock_count = lock_count.unwrap_or(0);

        if virtual_count < states.len() {
            if let (0, true, Some(value)) = (virtual_count, values_agree, single_value) {
                merged.add_object(object, ObjectState::new_materialized(value, lock_count));
                return Ok(false);
            }
            // Virtual on some paths only: allocate it on those and merge
            // the real objects.
            field_phis.supersede(object);
            let phi = self.new_phi(effects, merge, ValueKind::Object);
            let mut materialized = false;
            for (state, pred) in states.iter_mut().zip(predecessors) {
                materialized |= state.is_virtual(object);
                let value = self.ensure_materialized(state, object, Position::BlockEnd(*pred), effects)?;
                effects.add_phi_input(phi, value);
            }
            merged.add_object(object, ObjectState::new_materialized(phi, lock_count));
            return Ok(materialized);
        }

        let field_kinds = self.descriptor(object)?.fields.clone();
        let mut values: Vec<NodeId> = states[0].fields(object).map(<[NodeId]>::to_vec).unwrap_or_default();
        let mut materialized = false;
        for index in 0..values.len() {
            if states.iter().any(|s| !s.is_virtual(object)) {
                // A field materialization reached back to this object; the
                // next round merges it as a real object.
                return Ok(true);
            }
            let differs = states[1..]
                .iter()
                .any(|s| s.fields(object).and_then(|f| f.get(index)) != Some(&values[index]));
            if let Some(phi) = field_phis.get(object, index) {
                values[index] = phi;
                continue;
            }
            if !differs {
                continue;
            }

            let stamp = field_kinds
                .get(index)
                .copied()
                .unwrap_or_else(|| self.stamp_of(values[index]));
            let phi = self.new_phi(effects, merge, stamp);
            for (state, pred) in states.iter_mut().zip(predecessors) {
                let field = state
                    .fields(object)
                    .and_then(|f| f.get(index).copied())
                    .ok_or_else(|| {
                        EscapeAnalysisError::InvalidGraph(format!("{} lost field {} at {}", object, index, merge))
                    })?;
                let input = match state.object_for(field) {
                    Some(target) => {
                        materialized |= state.is_virtual(target);
                        let value =
                            self.ensure_materialized(state, target, Position::BlockEnd(*pred), effects)?;
                        state.set_field(object, index, value);
                        value
                    }
                    None => state.resolve(field),
                };
                effects.add_phi_input(phi, input);
            }
            field_phis.insert(object, index, phi);
            values[index] = phi;
        }
        merged.add_object(object, ObjectState::new_virtual(values, lock_count));
        Ok(materialized)
    }

    /// Handle a graph phi of the merge that may carry tracked objects.
    /// Returns true if an object had to be materialized on some path.
    fn merge_phi(
        &mut self,
        predecessors: &[BlockId],
        phi: NodeId,
        states: &mut [BlockState],
        merged: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<bool, EscapeAnalysisError> {
        let graph = self.graph;
        let node = graph
            .node(phi)
            .ok_or_else(|| EscapeAnalysisError::InvalidGraph(format!("missing phi {}", phi)))?;
        if node.inputs.len() != states.len() {
            return Err(EscapeAnalysisError::InvalidGraph(format!(
                "phi {} has {} inputs for {} predecessors",
                phi,
                node.inputs.len(),
                states.len()
            )));
        }

        let objects: Vec<Option<VirtualObjectId>> = node
            .inputs
            .iter()
            .zip(states.iter())
            .map(|(value, state)| state.object_for(*value))
            .collect();
        let virtual_inputs = objects
            .iter()
            .zip(states.iter())
            .filter(|(object, state)| object.is_some_and(|o| state.is_virtual(o)))
            .count();

        if virtual_inputs == states.len() {
            let first = objects[0];
            if let Some(object) = first {
                if objects.iter().all(|o| *o == first) && merged.is_virtual(object) {
                    merged.add_alias(phi, object);
                    self.mark_usages(phi);
                    return Ok(false);
                }
            }
        }

        for (index, (value, object)) in node.inputs.iter().zip(&objects).enumerate() {
            let Some(object) = *object else {
                continue;
            };
            let state = &mut states[index];
            let materialized =
                self.ensure_materialized(state, object, Position::BlockEnd(predecessors[index]), effects)?;
            if materialized != *value {
                effects.set_phi_input(phi, index, materialized);
            }
        }
        Ok(virtual_inputs > 0)
    }
}

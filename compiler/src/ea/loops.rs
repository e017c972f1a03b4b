//! Loop processing
//!
//! A loop body is analyzed under the assumption that the state at the header
//! is the state on entry, with a phi for every field known to change. The
//! back-edge states then decide whether that assumption held. If an object
//! has to be real on some back edge, it is materialized before the loop and
//! the body is analyzed again; if a field turned out to change, a phi is
//! added for it. Effects of a failed attempt are discarded by backtracking.

use super::block_iterator::{self, MergeableBlockState};
use super::closure::PartialEscapeClosure;
use super::effects::EffectList;
use super::state::{BlockState, ObjectContents};
use super::EscapeAnalysisError;
use crate::ir::{BlockId, Loop, NodeId, NodeKind, Position, ValueKind, VirtualObjectId};
use fxhash::FxHashMap;
use log::{debug, trace};
use smallvec::smallvec;
use std::collections::BTreeSet;

/// A field of a virtual object that needs a phi at the loop header
type PhiDesc = (VirtualObjectId, usize);

impl<'g> PartialEscapeClosure<'g> {
    pub(super) fn process_loop_until_stable(
        &mut self,
        l: &Loop,
        initial: BlockState,
    ) -> Result<Vec<BlockState>, EscapeAnalysisError> {
        let cfg = self.cfg;
        let graph = self.ctx.graph;
        let mut initial = initial;
        let predecessors = cfg.predecessors(l.header);
        let forward_end = predecessors
            .first()
            .copied()
            .ok_or(EscapeAnalysisError::MissingLoopState {
                header: l.header,
                block: l.header,
            })?;
        let header_phis: Vec<NodeId> = graph
            .block(l.header)
            .map(|b| b.phis.clone())
            .unwrap_or_default();
        let mut phi_descs: BTreeSet<PhiDesc> = BTreeSet::new();
        let max_attempts = self.ctx.config.max_loop_iterations;

        for attempt in 1..=max_attempts {
            self.ctx.stats.loop_attempts += 1;
            let checkpoint = self.effects.checkpoint();
            let mut state = initial.clone_state();
            let mut success = EffectList::new();

            for &(object, index) in &phi_descs {
                let Some(value) = state.fields(object).and_then(|f| f.get(index).copied()) else {
                    continue;
                };
                let value = match state.object_for(value) {
                    Some(target) => state.materialized_value(target).ok_or_else(|| {
                        EscapeAnalysisError::InvalidGraph(format!(
                            "{} is virtual in a field phi of loop {}",
                            target, l.header
                        ))
                    })?,
                    None => state.resolve(value),
                };
                let stamp = self
                    .ctx
                    .descriptor(object)?
                    .fields
                    .get(index)
                    .copied()
                    .unwrap_or(ValueKind::Object);
                let phi = self.ctx.new_phi(&mut self.effects, l.header, stamp);
                self.effects.add_phi_input(phi, value);
                state.set_field(object, index, phi);
            }

            for &phi in &header_phis {
                if !self.ctx.is_marked(phi) {
                    continue;
                }
                let Some(entry) = graph.node(phi).and_then(|n| n.inputs.first().copied()) else {
                    continue;
                };
                if let Some(object) = initial.object_for(entry) {
                    match initial.materialized_value(object) {
                        None => {
                            state.add_alias(phi, object);
                            self.ctx.mark_usages(phi);
                        }
                        Some(value) => success.set_phi_input(phi, 0, value),
                    }
                }
            }

            self.effects.inc_level();
            let mut info = block_iterator::process_loop(self, cfg, l, state.clone_state())?;

            let mut additional: BTreeSet<VirtualObjectId> = BTreeSet::new();
            let known_phis = phi_descs.len();
            for (back_edge, end_state) in l.back_edges.iter().zip(info.end_states.iter_mut()) {
                let pred_index = predecessors
                    .iter()
                    .position(|p| p == back_edge)
                    .ok_or(EscapeAnalysisError::MissingLoopState {
                        header: l.header,
                        block: *back_edge,
                    })?;
                let end = LoopEnd {
                    header: l.header,
                    back_edge: *back_edge,
                    pred_index,
                    header_phis: &header_phis,
                };
                self.process_loop_end(&end, &state, end_state, &mut success, &mut additional, &mut phi_descs)?;
            }

            if additional.is_empty() && phi_descs.len() == known_phis {
                self.effects.append(success);
                for (exit, exit_state) in l.exits.iter().zip(info.exit_states.iter_mut()) {
                    self.process_loop_exit(l.header, *exit, &state, exit_state)?;
                }
                self.effects.dec_level();
                debug!("loop {} stable after {} attempt(s)", l.header, attempt);
                return Ok(info.exit_states);
            }

            trace!(
                "loop {} attempt {}: {} objects to materialize, {} field phis",
                l.header,
                attempt,
                additional.len(),
                phi_descs.len()
            );
            self.effects.backtrack(checkpoint);
            self.effects.dec_level();
            self.ctx.stats.loop_retries += 1;
            for object in additional {
                if initial.is_virtual(object) {
                    self.ctx.materialize_before(
                        &mut initial,
                        Position::BlockEnd(forward_end),
                        object,
                        &mut self.effects,
                    )?;
                }
            }
        }

        Err(EscapeAnalysisError::LoopIterationLimit {
            header: l.header,
            attempts: max_attempts,
        })
    }

    /// Compare the state at one back edge with the state assumed at the
    /// header. Objects that must be real before the loop go to
    /// `additional`; fields that change get a [`PhiDesc`].
    fn process_loop_end(
        &mut self,
        end: &LoopEnd<'_>,
        initial: &BlockState,
        end_state: &mut BlockState,
        success: &mut EffectList,
        additional: &mut BTreeSet<VirtualObjectId>,
        phi_descs: &mut BTreeSet<PhiDesc>,
    ) -> Result<(), EscapeAnalysisError> {
        let graph = self.ctx.graph;
        let position = Position::BlockEnd(end.back_edge);

        loop {
            let mut materialized = false;
            for (object, object_state) in initial.objects() {
                let Some(fields) = object_state.fields() else {
                    continue;
                };
                let Some(end_fields) = end_state.fields(object).map(<[NodeId]>::to_vec) else {
                    additional.insert(object);
                    continue;
                };
                for (value, end_value) in fields.iter().zip(&end_fields) {
                    let end_object = end_state.object_for(*end_value);
                    match initial.object_for(*value) {
                        Some(value_object) => {
                            let still_same = end_object == Some(value_object) && end_state.is_virtual(value_object);
                            if initial.is_virtual(value_object) && !still_same {
                                additional.insert(value_object);
                            }
                        }
                        None => {
                            if self.ctx.phi_block(*value) != Some(end.header) {
                                continue;
                            }
                            if let Some(end_object) = end_object {
                                if end_state.is_virtual(end_object) {
                                    self.ctx.materialize_before(end_state, position, end_object, success)?;
                                    materialized = true;
                                }
                            }
                        }
                    }
                }
            }

            for &phi in end.header_phis {
                if !self.ctx.is_marked(phi) {
                    continue;
                }
                let Some(node) = graph.node(phi) else {
                    continue;
                };
                let (Some(entry), Some(back)) = (node.inputs.first(), node.inputs.get(end.pred_index)) else {
                    continue;
                };
                let initial_object = initial.object_for(*entry);
                let initial_materialized = initial_object.map_or(true, |o| !initial.is_virtual(o));
                let end_object = end_state.object_for(*back);

                match end_object {
                    Some(end_object) if end_state.is_virtual(end_object) => {
                        if initial_materialized {
                            self.ctx.materialize_before(end_state, position, end_object, success)?;
                            materialized = true;
                        } else if let Some(initial_object) = initial_object {
                            if initial_object != end_object {
                                additional.insert(initial_object);
                            }
                        }
                    }
                    _ => {
                        if let Some(value) = end_object.and_then(|o| end_state.materialized_value(o)) {
                            success.set_phi_input(phi, end.pred_index, value);
                        }
                        if let (false, Some(initial_object)) = (initial_materialized, initial_object) {
                            additional.insert(initial_object);
                        }
                    }
                }
            }

            if !materialized {
                break;
            }
        }

        for (object, object_state) in initial.objects() {
            let Some(fields) = object_state.fields() else {
                continue;
            };
            let Some(end_fields) = end_state.fields(object) else {
                continue;
            };
            for (index, (value, end_value)) in fields.iter().zip(end_fields).enumerate() {
                let end_object = end_state.object_for(*end_value);
                match initial.object_for(*value) {
                    Some(value_object) => {
                        let Some(materialized) = initial.materialized_value(value_object) else {
                            continue;
                        };
                        let unchanged = match end_object {
                            Some(end_object) => end_state.materialized_value(end_object) == Some(materialized),
                            None => end_state.resolve(*end_value) == materialized,
                        };
                        if !unchanged {
                            phi_descs.insert((object, index));
                        }
                    }
                    None => {
                        if self.ctx.phi_block(*value) == Some(end.header) {
                            let input = match end_object {
                                Some(end_object) => end_state.materialized_value(end_object),
                                None => Some(end_state.resolve(*end_value)),
                            };
                            if let Some(input) = input {
                                success.add_phi_input(*value, input);
                            }
                        } else if value != end_value {
                            phi_descs.insert((object, index));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert value proxies for everything that leaves the loop through
    /// `exit` and was computed inside it.
    fn process_loop_exit(
        &mut self,
        header: BlockId,
        exit: BlockId,
        initial: &BlockState,
        exit_state: &mut BlockState,
    ) -> Result<(), EscapeAnalysisError> {
        let graph = self.ctx.graph;
        let mut proxies: FxHashMap<VirtualObjectId, (NodeId, NodeId)> = FxHashMap::default();
        if let Some(block) = graph.block(exit) {
            for &node_id in &block.nodes {
                let Some(node) = graph.node(node_id) else {
                    continue;
                };
                if !matches!(node.kind, NodeKind::ValueProxy { exit: e } if e == exit) {
                    continue;
                }
                if let Some(&value) = node.inputs.first() {
                    if let Some(object) = exit_state.object_for(value) {
                        proxies.insert(object, (node_id, value));
                    }
                }
            }
        }

        for object in exit_state.object_ids() {
            let initial_object = initial.object_state(object);
            let Some(contents) = exit_state.object_state(object).map(|s| s.contents.clone()) else {
                continue;
            };
            match contents {
                ObjectContents::Virtual { fields } => {
                    for (index, value) in fields.into_iter().enumerate() {
                        if exit_state.object_for(value).is_some() {
                            continue;
                        }
                        let defined_in_loop = self.ctx.phi_block(value) == Some(header)
                            || initial_object
                                .and_then(|s| s.fields())
                                .map_or(true, |f| f.get(index) != Some(&value));
                        if defined_in_loop {
                            let stamp = self.ctx.stamp_of(value);
                            let proxy = self.ctx.add_floating(
                                &mut self.effects,
                                NodeKind::ValueProxy { exit },
                                smallvec![value],
                                stamp,
                            );
                            exit_state.set_field(object, index, proxy);
                        }
                    }
                }
                ObjectContents::Materialized { value } => {
                    if initial_object.is_some_and(|s| !s.is_virtual()) {
                        continue;
                    }
                    let proxy = match proxies.get(&object) {
                        Some(&(proxy, old)) => {
                            if old != value {
                                self.effects.replace_input(proxy, old, value);
                            }
                            proxy
                        }
                        None => self.ctx.add_floating(
                            &mut self.effects,
                            NodeKind::ValueProxy { exit },
                            smallvec![value],
                            ValueKind::Object,
                        ),
                    };
                    exit_state.set_materialized(object, proxy);
                }
            }
        }
        Ok(())
    }
}

/// The back edge a loop-end comparison is about
struct LoopEnd<'a> {
    header: BlockId,
    back_edge: BlockId,
    /// Index of the back edge among the header's predecessors
    pred_index: usize,
    header_phis: &'a [NodeId],
}

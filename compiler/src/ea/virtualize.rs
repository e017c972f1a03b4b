//! Per-node transfer rules
//!
//! Every scheduled node is classified into a [`NodeCategory`]. Allocations
//! within the size limits become virtual objects; nodes that touch a tracked
//! object either operate on the abstract state or force the object to be
//! materialized first.

use super::context::AnalysisContext;
use super::effects::{Effect, EffectList};
use super::state::{BlockState, ObjectState};
use super::EscapeAnalysisError;
use crate::ir::{Constant, FieldRef, Node, NodeId, NodeKind, TypeRef, VirtualObjectId};
use indexmap::IndexSet;
use log::{debug, trace};

/// How the analysis treats a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCategory {
    /// Instance or array allocation
    Allocation,
    /// Forwards its first input (`Pi`, `ValueProxy`)
    Identity,
    TypeCheck(TypeRef),
    NullCheck,
    MonitorEnter,
    MonitorExit,
    LoadField(FieldRef),
    StoreField(FieldRef),
    LoadIndexed,
    StoreIndexed,
    ArrayLength,
    LoadHub,
    ReferenceEquals,
    /// Finalizer registration, removable for classes without finalizers
    RegisterFinalizer,
    /// Known consumer that lets its inputs escape
    Escaping,
    /// Anything the analysis has no rule for
    Unclassified,
    /// Never has a tracked object as input
    Inert,
}

pub fn classify(kind: &NodeKind) -> NodeCategory {
    match kind {
        NodeKind::NewInstance { .. } | NodeKind::NewArray { .. } => NodeCategory::Allocation,
        NodeKind::Pi | NodeKind::ValueProxy { .. } => NodeCategory::Identity,
        NodeKind::CheckCast { target } => NodeCategory::TypeCheck(*target),
        NodeKind::IsNull => NodeCategory::NullCheck,
        NodeKind::MonitorEnter => NodeCategory::MonitorEnter,
        NodeKind::MonitorExit => NodeCategory::MonitorExit,
        NodeKind::LoadField { field } => NodeCategory::LoadField(*field),
        NodeKind::StoreField { field } => NodeCategory::StoreField(*field),
        NodeKind::LoadIndexed { .. } => NodeCategory::LoadIndexed,
        NodeKind::StoreIndexed { .. } => NodeCategory::StoreIndexed,
        NodeKind::ArrayLength => NodeCategory::ArrayLength,
        NodeKind::LoadHub => NodeCategory::LoadHub,
        NodeKind::ObjectEquals => NodeCategory::ReferenceEquals,
        NodeKind::RegisterFinalizer => NodeCategory::RegisterFinalizer,
        NodeKind::Invoke { .. }
        | NodeKind::Return
        | NodeKind::UnsafeLoad
        | NodeKind::UnsafeStore
        | NodeKind::CompareAndSwap
        | NodeKind::Materialize { .. }
        | NodeKind::PatchField { .. } => NodeCategory::Escaping,
        NodeKind::Arithmetic(_)
        | NodeKind::Compare(_)
        | NodeKind::If
        | NodeKind::Opaque { .. } => NodeCategory::Unclassified,
        NodeKind::Start
        | NodeKind::Parameter { .. }
        | NodeKind::Constant(_)
        | NodeKind::Phi { .. }
        | NodeKind::FrameState { .. }
        | NodeKind::VirtualObject { .. }
        | NodeKind::VirtualObjectState { .. }
        | NodeKind::MaterializedObjectState => NodeCategory::Inert,
    }
}

impl<'g> AnalysisContext<'g> {
    /// Apply the transfer rule of scheduled node `id` to `state`.
    pub fn process_node(
        &mut self,
        id: NodeId,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let graph = self.graph;
        let node = graph
            .node(id)
            .ok_or_else(|| EscapeAnalysisError::InvalidGraph(format!("scheduled {} is missing", id)))?;
        let category = classify(&node.kind);

        let handled = category == NodeCategory::Allocation && self.try_virtualize(id, node, state, effects)?;
        if !handled && self.is_marked(id) {
            trace!("{} {}", id, node.kind);
            self.process_marked(id, node, category, state, effects)?;
        }

        if let Some(snapshot) = node.state_after {
            if self.is_marked(snapshot) || state.has_locked_virtual_objects() {
                self.process_snapshot(snapshot, state, effects)?;
            }
        }
        Ok(())
    }

    fn try_virtualize(
        &mut self,
        id: NodeId,
        node: &Node,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<bool, EscapeAnalysisError> {
        let (ty, fields) = match node.kind {
            NodeKind::NewInstance { class } => {
                let ty = TypeRef::Class(class);
                let fields = self.graph.layout_of(ty, 0);
                if fields.len() > self.config.max_virtual_fields {
                    return Ok(false);
                }
                (ty, fields)
            }
            NodeKind::NewArray { component, length } => {
                if length > self.config.max_virtual_array_length {
                    return Ok(false);
                }
                let ty = TypeRef::Array(component);
                (ty, self.graph.layout_of(ty, length))
            }
            _ => return Ok(false),
        };
        if fields.len() != node.inputs.len() {
            debug!("{} has {} initial values for {} fields", id, node.inputs.len(), fields.len());
            return Ok(false);
        }

        let values = node
            .inputs
            .iter()
            .map(|v| self.field_value(state, *v))
            .collect::<Result<Vec<NodeId>, _>>()?;
        let object = self.create_virtual_object(effects, id, ty, fields);
        state.add_object(object, ObjectState::new_virtual(values, 0));
        state.add_alias(id, object);
        self.mark_usages(id);
        effects.delete_node(id);
        trace!("{} virtualized as {}", id, object);
        Ok(true)
    }

    fn process_marked(
        &mut self,
        id: NodeId,
        node: &Node,
        category: NodeCategory,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        match category {
            NodeCategory::Identity => self.process_identity(id, node, state, effects),
            NodeCategory::TypeCheck(target) => self.process_type_check(id, node, target, state, effects),
            NodeCategory::NullCheck => {
                if input(node, 0).and_then(|v| state.object_for(v)).is_some() {
                    self.fold_to_constant(state, id, Constant::Bool(false), effects);
                }
                Ok(())
            }
            NodeCategory::MonitorEnter | NodeCategory::MonitorExit => {
                self.process_monitor(id, node, category == NodeCategory::MonitorEnter, state, effects)
            }
            NodeCategory::LoadField(field) => {
                let index = self.field_index(node, field, state)?;
                self.process_load(id, node, index, state, effects)
            }
            NodeCategory::StoreField(field) => {
                let index = self.field_index(node, field, state)?;
                self.process_store(id, node, index, state, effects)
            }
            NodeCategory::LoadIndexed => {
                let index = self.element_index(node, state)?;
                self.process_load(id, node, index, state, effects)
            }
            NodeCategory::StoreIndexed => {
                let index = self.element_index(node, state)?;
                self.process_store(id, node, index, state, effects)
            }
            NodeCategory::ArrayLength => {
                if let Some(object) = input(node, 0).and_then(|v| state.object_for(v)) {
                    let descriptor = self.descriptor(object)?;
                    if let TypeRef::Array(_) = descriptor.ty {
                        let length = descriptor.field_count() as i64;
                        self.fold_to_constant(state, id, Constant::Int(length), effects);
                        return Ok(());
                    }
                }
                self.process_escaping(id, node, false, state, effects)
            }
            NodeCategory::LoadHub => {
                if let Some(object) = input(node, 0).and_then(|v| state.object_for(v)) {
                    let ty = self.descriptor(object)?.ty;
                    self.fold_to_constant(state, id, Constant::Type(ty), effects);
                }
                Ok(())
            }
            NodeCategory::ReferenceEquals => self.process_reference_equals(id, node, state, effects),
            NodeCategory::RegisterFinalizer => {
                if let Some(object) = input(node, 0).and_then(|v| state.object_for(v)) {
                    if state.is_virtual(object) && !self.needs_finalizer(object)? {
                        effects.delete_node(id);
                        return Ok(());
                    }
                }
                self.process_escaping(id, node, false, state, effects)
            }
            NodeCategory::Escaping | NodeCategory::Allocation => {
                self.process_escaping(id, node, false, state, effects)
            }
            NodeCategory::Unclassified => self.process_escaping(id, node, true, state, effects),
            NodeCategory::Inert => Ok(()),
        }
    }

    fn needs_finalizer(&self, object: VirtualObjectId) -> Result<bool, EscapeAnalysisError> {
        Ok(match self.descriptor(object)?.ty {
            TypeRef::Class(class) => self.graph.class(class).is_some_and(|c| c.has_finalizer),
            TypeRef::Array(_) => false,
        })
    }

    /// Field index addressed by a field access on a tracked receiver, if the
    /// receiver's type has that field.
    fn field_index(
        &self,
        node: &Node,
        field: FieldRef,
        state: &BlockState,
    ) -> Result<Option<usize>, EscapeAnalysisError> {
        let Some(object) = input(node, 0).and_then(|v| state.object_for(v)) else {
            return Ok(None);
        };
        Ok(match self.descriptor(object)?.ty {
            TypeRef::Class(class) => self.graph.field_offset(class, field),
            TypeRef::Array(_) => None,
        })
    }

    /// Element index of an indexed access with a constant, in-range index.
    fn element_index(&self, node: &Node, state: &BlockState) -> Result<Option<usize>, EscapeAnalysisError> {
        let Some(object) = input(node, 0).and_then(|v| state.object_for(v)) else {
            return Ok(None);
        };
        let descriptor = self.descriptor(object)?;
        if !matches!(descriptor.ty, TypeRef::Array(_)) {
            return Ok(None);
        }
        let index = input(node, 1).and_then(|i| self.constant_index(state.resolve(i)));
        Ok(index.filter(|i| *i < descriptor.field_count()))
    }

    fn process_identity(
        &mut self,
        id: NodeId,
        node: &Node,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let Some(value) = input(node, 0) else {
            return Ok(());
        };
        let Some(object) = state.object_for(value) else {
            return Ok(());
        };
        match state.materialized_value(object) {
            None => {
                state.add_alias(id, object);
                self.mark_usages(id);
            }
            // A loop exit proxy may already be the materialized value.
            Some(materialized) if materialized != id && materialized != value => {
                effects.replace_input(id, value, materialized);
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn process_type_check(
        &mut self,
        id: NodeId,
        node: &Node,
        target: TypeRef,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let Some(value) = input(node, 0) else {
            return Ok(());
        };
        let Some(object) = state.object_for(value) else {
            return Ok(());
        };
        if state.is_virtual(object) {
            let ty = self.descriptor(object)?.ty;
            if self.graph.is_subtype(ty, target) {
                state.add_alias(id, object);
                self.mark_usages(id);
                effects.delete_node(id);
                return Ok(());
            }
        }
        self.replace_with_materialized(state, id, value, object, effects)
    }

    fn process_monitor(
        &mut self,
        id: NodeId,
        node: &Node,
        enter: bool,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let Some(value) = input(node, 0) else {
            return Ok(());
        };
        let Some(object) = state.object_for(value) else {
            return Ok(());
        };
        if !state.is_virtual(object) {
            return self.replace_with_materialized(state, id, value, object, effects);
        }
        if let Some(object_state) = state.object_state_mut(object) {
            object_state.lock_count = if enter {
                object_state.lock_count + 1
            } else {
                object_state
                    .lock_count
                    .checked_sub(1)
                    .ok_or(EscapeAnalysisError::MonitorUnderflow { node: id, object })?
            };
        }
        effects.eliminate_monitor(id);
        Ok(())
    }

    fn process_load(
        &mut self,
        id: NodeId,
        node: &Node,
        index: Option<usize>,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let Some(receiver) = input(node, 0) else {
            return Ok(());
        };
        let Some(object) = state.object_for(receiver) else {
            return Ok(());
        };
        let field = match (state.fields(object), index) {
            (Some(fields), Some(index)) => fields.get(index).copied(),
            _ => None,
        };
        let Some(value) = field else {
            return self.replace_with_materialized(state, id, receiver, object, effects);
        };

        match state.object_for(value) {
            Some(target) => {
                state.add_alias(id, target);
                self.mark_usages(id);
            }
            None => {
                let value = state.resolve(value);
                self.replace_at_usages(state, id, value, effects);
            }
        }
        effects.delete_node(id);
        Ok(())
    }

    fn process_store(
        &mut self,
        id: NodeId,
        node: &Node,
        index: Option<usize>,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let value_slot = node.inputs.len().saturating_sub(1);
        let (Some(receiver), Some(value)) = (input(node, 0), input(node, value_slot)) else {
            return Ok(());
        };

        if let Some(object) = state.object_for(receiver) {
            if state.is_virtual(object) {
                if let Some(index) = index {
                    let stored = self.field_value(state, value)?;
                    if state.set_field(object, index, stored) {
                        effects.delete_node(id);
                        return Ok(());
                    }
                }
            }
            self.replace_with_materialized(state, id, receiver, object, effects)?;
        }

        // The receiver is real, so the stored value escapes into it.
        if let Some(stored) = state.object_for(value) {
            self.replace_with_materialized(state, id, value, stored, effects)?;
        }
        Ok(())
    }

    fn process_reference_equals(
        &mut self,
        id: NodeId,
        node: &Node,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let (Some(x), Some(y)) = (input(node, 0), input(node, 1)) else {
            return Ok(());
        };
        let x_object = state.object_for(x);
        let y_object = state.object_for(y);
        let x_virtual = x_object.is_some_and(|o| state.is_virtual(o));
        let y_virtual = y_object.is_some_and(|o| state.is_virtual(o));

        if x_virtual || y_virtual {
            // A virtual object is only equal to itself.
            let same = x_virtual && y_virtual && x_object == y_object;
            self.fold_to_constant(state, id, Constant::Bool(same), effects);
            return Ok(());
        }
        for (value, object) in [(x, x_object), (y, y_object)] {
            if let Some(object) = object {
                self.replace_with_materialized(state, id, value, object, effects)?;
            }
        }
        Ok(())
    }

    /// Materialize every tracked input of `id` right before it.
    fn process_escaping(
        &mut self,
        id: NodeId,
        node: &Node,
        unclassified: bool,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let mut escaped = false;
        for &value in &node.inputs {
            if let Some(object) = state.object_for(value) {
                escaped = true;
                self.replace_with_materialized(state, id, value, object, effects)?;
            }
        }
        if escaped && unclassified {
            debug!("{} ({}) has no escape rule, materializing its inputs", id, node.kind);
            self.unclassified_usage = true;
        }
        Ok(())
    }

    /// Describe the tracked objects a snapshot can observe, so the frame can
    /// be rebuilt on deoptimization.
    fn process_snapshot(
        &mut self,
        snapshot: NodeId,
        state: &BlockState,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let graph = self.graph;
        let node = graph
            .node(snapshot)
            .ok_or_else(|| EscapeAnalysisError::InvalidGraph(format!("missing snapshot {}", snapshot)))?;

        let mut objects: IndexSet<VirtualObjectId> = IndexSet::new();
        for &value in &node.inputs {
            if let Some(object) = state.object_for(value) {
                objects.insert(object);
                let stand_in = self.descriptor(object)?.node;
                effects.replace_input(snapshot, value, stand_in);
            }
        }
        objects.extend(state.locked_virtual_objects());

        // Objects reachable through fields of virtual objects are described too.
        let mut next = 0;
        while next < objects.len() {
            let object = objects[next];
            next += 1;
            if let Some(fields) = state.fields(object) {
                let reachable: Vec<VirtualObjectId> =
                    fields.iter().filter_map(|f| state.object_for(*f)).collect();
                objects.extend(reachable);
            }
        }

        for object in objects {
            let Some(object_state) = state.object_state(object) else {
                continue;
            };
            let stand_in = self.descriptor(object)?.node;
            let (kind, rest) = match object_state.fields() {
                Some(fields) => {
                    let mut values = Vec::with_capacity(fields.len());
                    for field in fields {
                        values.push(match state.object_for(*field) {
                            Some(target) => self.descriptor(target)?.node,
                            None => state.resolve(*field),
                        });
                    }
                    (
                        NodeKind::VirtualObjectState {
                            lock_count: object_state.lock_count,
                        },
                        values,
                    )
                }
                None => (
                    NodeKind::MaterializedObjectState,
                    object_state.materialized_value().into_iter().collect(),
                ),
            };
            let mapping = self.new_node_id();
            effects.add(Effect::AddVirtualMapping {
                state: snapshot,
                mapping,
                kind,
                inputs: self.mapping_inputs(stand_in, &rest),
            });
        }
        Ok(())
    }
}

fn input(node: &Node, index: usize) -> Option<NodeId> {
    node.inputs.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ClassId, CompareOp};

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&NodeKind::NewInstance {
                class: ClassId::new(0)
            }),
            NodeCategory::Allocation
        );
        assert_eq!(
            classify(&NodeKind::ValueProxy {
                exit: crate::ir::BlockId::new(2)
            }),
            NodeCategory::Identity
        );
        assert_eq!(
            classify(&NodeKind::Invoke {
                target: "f".into()
            }),
            NodeCategory::Escaping
        );
        assert_eq!(classify(&NodeKind::Compare(CompareOp::Eq)), NodeCategory::Unclassified);
        assert_eq!(
            classify(&NodeKind::Opaque { name: "x".into() }),
            NodeCategory::Unclassified
        );
        assert_eq!(
            classify(&NodeKind::Constant(Constant::Int(1))),
            NodeCategory::Inert
        );
    }
}

//! Shared bookkeeping of one analysis run
//!
//! [`AnalysisContext`] owns everything that outlives a single block state:
//! the usage marks, the virtual object descriptors, and the id factory for
//! nodes the effects will create. It also implements materialization, which
//! every transfer rule falls back to.

use super::effects::{Effect, EffectList};
use super::state::{BlockState, ObjectContents, ObjectState, VirtualObjectDescriptor};
use super::{EscapeAnalysisConfig, EscapeAnalysisError, EscapeAnalysisStats};
use crate::ir::{
    BlockId, Constant, Graph, Inputs, NodeId, NodeKind, Position, TypeRef, ValueKind,
    VirtualObjectId,
};
use fxhash::{FxHashMap, FxHashSet};
use log::trace;
use smallvec::smallvec;

/// Node that exists only in the effect list so far
#[derive(Debug, Clone, Copy)]
struct PendingNode {
    stamp: ValueKind,
    phi_block: Option<BlockId>,
}

pub struct AnalysisContext<'g> {
    pub graph: &'g Graph,
    pub config: &'g EscapeAnalysisConfig,
    usages: FxHashMap<NodeId, Vec<NodeId>>,
    marked: FxHashSet<NodeId>,
    descriptors: Vec<VirtualObjectDescriptor>,
    next_node: u32,
    pending: FxHashMap<NodeId, PendingNode>,
    pub stats: EscapeAnalysisStats,
    /// A node of unknown category consumed a tracked object
    pub unclassified_usage: bool,
}

impl<'g> AnalysisContext<'g> {
    pub fn new(graph: &'g Graph, config: &'g EscapeAnalysisConfig) -> Self {
        Self {
            graph,
            config,
            usages: graph.compute_usages(),
            marked: FxHashSet::default(),
            descriptors: Vec::new(),
            next_node: graph.next_node_id(),
            pending: FxHashMap::default(),
            stats: EscapeAnalysisStats::default(),
            unclassified_usage: false,
        }
    }

    // ---------------------------------------------------------------
    // Node factory
    // ---------------------------------------------------------------

    /// Reserve an id for a node an effect will create.
    pub fn new_node_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn add_floating(
        &mut self,
        effects: &mut EffectList,
        kind: NodeKind,
        inputs: Inputs,
        stamp: ValueKind,
    ) -> NodeId {
        let id = self.new_node_id();
        let phi_block = match kind {
            NodeKind::Phi { block } => Some(block),
            _ => None,
        };
        self.pending.insert(id, PendingNode { stamp, phi_block });
        effects.add_floating_node(id, kind, inputs, stamp);
        id
    }

    /// New phi in `block` without inputs; callers add one per predecessor.
    pub fn new_phi(&mut self, effects: &mut EffectList, block: BlockId, stamp: ValueKind) -> NodeId {
        self.add_floating(effects, NodeKind::Phi { block }, Inputs::new(), stamp)
    }

    pub fn constant(&mut self, effects: &mut EffectList, value: Constant) -> NodeId {
        self.add_floating(effects, NodeKind::Constant(value), Inputs::new(), value.kind())
    }

    pub fn stamp_of(&self, node: NodeId) -> ValueKind {
        match self.graph.node(node) {
            Some(n) => n.stamp,
            None => self
                .pending
                .get(&node)
                .map_or(ValueKind::Object, |p| p.stamp),
        }
    }

    /// Block of `node` if it is a phi, existing or pending.
    pub fn phi_block(&self, node: NodeId) -> Option<BlockId> {
        match self.graph.kind(node) {
            Some(NodeKind::Phi { block }) => Some(*block),
            Some(_) => None,
            None => self.pending.get(&node).and_then(|p| p.phi_block),
        }
    }

    /// Integer value of `node` if it is a constant of the input graph.
    pub fn constant_index(&self, node: NodeId) -> Option<usize> {
        self.graph
            .as_constant(node)
            .and_then(|c| c.as_int())
            .and_then(|i| usize::try_from(i).ok())
    }

    // ---------------------------------------------------------------
    // Usage marks
    // ---------------------------------------------------------------

    pub fn is_marked(&self, node: NodeId) -> bool {
        self.marked.contains(&node)
    }

    /// Mark every user of `node` as needing a visit.
    pub fn mark_usages(&mut self, node: NodeId) {
        if let Some(users) = self.usages.get(&node) {
            self.marked.extend(users.iter().copied());
        }
    }

    // ---------------------------------------------------------------
    // Virtual objects
    // ---------------------------------------------------------------

    pub fn descriptor(&self, id: VirtualObjectId) -> Result<&VirtualObjectDescriptor, EscapeAnalysisError> {
        self.descriptors
            .get(id.index())
            .ok_or_else(|| EscapeAnalysisError::InvalidGraph(format!("unknown virtual object {}", id)))
    }

    pub fn descriptors(&self) -> &[VirtualObjectDescriptor] {
        &self.descriptors
    }

    /// Register a virtual object for `allocation`, along with the
    /// `VirtualObject` node that stands for it in snapshots.
    pub fn create_virtual_object(
        &mut self,
        effects: &mut EffectList,
        allocation: NodeId,
        ty: TypeRef,
        fields: Vec<ValueKind>,
    ) -> VirtualObjectId {
        let id = VirtualObjectId::new(self.descriptors.len() as u32);
        let node = self.add_floating(
            effects,
            NodeKind::VirtualObject { object: id, ty },
            Inputs::new(),
            ValueKind::Object,
        );
        self.descriptors.push(VirtualObjectDescriptor {
            id,
            ty,
            fields,
            node,
            allocation,
        });
        id
    }

    /// Form of `value` kept in a field of a virtual object. A tracked object
    /// is always recorded through its allocation node, so fields holding
    /// the same object compare equal whichever alias was stored.
    pub fn field_value(&self, state: &BlockState, value: NodeId) -> Result<NodeId, EscapeAnalysisError> {
        let resolved = state.resolve(value);
        let Some(object) = state.object_for(resolved) else {
            return Ok(resolved);
        };
        let allocation = self.descriptor(object)?.allocation;
        if state.alias_of(allocation) == Some(object) {
            Ok(allocation)
        } else {
            Ok(resolved)
        }
    }

    // ---------------------------------------------------------------
    // Materialization
    // ---------------------------------------------------------------

    /// Allocate `object` for real at `position`, along with every virtual
    /// object reachable from its fields. Does nothing if it is already
    /// materialized in `state`.
    pub fn materialize_before(
        &mut self,
        state: &mut BlockState,
        position: Position,
        object: VirtualObjectId,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let mut in_progress = FxHashSet::default();
        let mut deferred_stores = EffectList::new();
        self.materialize_changed_before(
            state,
            position,
            object,
            &mut in_progress,
            &mut deferred_stores,
            effects,
        )?;
        effects.append(deferred_stores);
        Ok(())
    }

    fn materialize_changed_before(
        &mut self,
        state: &mut BlockState,
        position: Position,
        object: VirtualObjectId,
        in_progress: &mut FxHashSet<VirtualObjectId>,
        deferred_stores: &mut EffectList,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let (fields, lock_count) = match state.object_state(object) {
            Some(ObjectState {
                contents: ObjectContents::Virtual { fields },
                lock_count,
            }) => (fields.clone(), *lock_count),
            Some(_) => return Ok(()),
            None => {
                return Err(EscapeAnalysisError::InvalidGraph(format!(
                    "materializing untracked {}",
                    object
                )))
            }
        };
        let descriptor = self.descriptor(object)?;
        let ty = descriptor.ty;
        let field_kinds = descriptor.fields.clone();

        let node = self.new_node_id();
        self.pending.insert(
            node,
            PendingNode {
                stamp: ValueKind::Object,
                phi_block: None,
            },
        );
        // Marked as materialized before the fields are visited so a cycle
        // back to this object sees the new node.
        state.set_materialized(object, node);
        in_progress.insert(object);

        let mut values = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            let Some(target) = state.object_for(*field) else {
                values.push(state.resolve(*field));
                continue;
            };
            if state.is_virtual(target) {
                self.materialize_changed_before(
                    state,
                    position,
                    target,
                    in_progress,
                    deferred_stores,
                    effects,
                )?;
            }
            let target_value = state
                .materialized_value(target)
                .ok_or(EscapeAnalysisError::UnresolvedMaterializationCycle { object: target })?;
            if in_progress.contains(&target) {
                // The target is allocated after this object; store it later.
                let kind = field_kinds.get(index).copied().unwrap_or(ValueKind::Object);
                values.push(self.constant(effects, Constant::default_for(kind)));
                let patch = self.new_node_id();
                deferred_stores.add(Effect::PatchField {
                    node: patch,
                    object: node,
                    index,
                    value: target_value,
                    position,
                });
            } else {
                values.push(target_value);
            }
        }
        in_progress.remove(&object);

        trace!("materializing {} as {} before {}", object, node, position);
        effects.add(Effect::AddMaterialization {
            node,
            object,
            ty,
            lock_count,
            position,
            values,
        });
        Ok(())
    }

    /// Materialized value of `object`, materializing it first if needed.
    pub fn ensure_materialized(
        &mut self,
        state: &mut BlockState,
        object: VirtualObjectId,
        position: Position,
        effects: &mut EffectList,
    ) -> Result<NodeId, EscapeAnalysisError> {
        if state.is_virtual(object) {
            self.materialize_before(state, position, object, effects)?;
        }
        state
            .materialized_value(object)
            .ok_or(EscapeAnalysisError::UnresolvedMaterializationCycle { object })
    }

    /// Make `user` consume the real object instead of `input`.
    pub fn replace_with_materialized(
        &mut self,
        state: &mut BlockState,
        user: NodeId,
        input: NodeId,
        object: VirtualObjectId,
        effects: &mut EffectList,
    ) -> Result<(), EscapeAnalysisError> {
        let value = self.ensure_materialized(state, object, Position::Before(user), effects)?;
        if value != input {
            effects.replace_input(user, input, value);
        }
        Ok(())
    }

    /// `node` is replaced by `replacement` from here on.
    pub fn replace_at_usages(
        &mut self,
        state: &mut BlockState,
        node: NodeId,
        replacement: NodeId,
        effects: &mut EffectList,
    ) {
        effects.replace_at_usages(node, replacement);
        state.add_scalar_alias(node, replacement);
    }

    /// Fold `node` to `value` and delete it.
    pub fn fold_to_constant(
        &mut self,
        state: &mut BlockState,
        node: NodeId,
        value: Constant,
        effects: &mut EffectList,
    ) {
        let constant = self.constant(effects, value);
        self.replace_at_usages(state, node, constant, effects);
        effects.delete_node(node);
    }

    /// Input list for a `VirtualObjectState` or `MaterializedObjectState`.
    pub fn mapping_inputs(&self, head: NodeId, rest: &[NodeId]) -> Inputs {
        let mut inputs: Inputs = smallvec![head];
        inputs.extend(rest.iter().copied());
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    fn point_graph() -> (Graph, crate::ir::ClassId) {
        let mut b = GraphBuilder::new();
        let class = b.add_class("Point", None, &[("x", ValueKind::Int), ("y", ValueKind::Int)]);
        b.build_return(None).unwrap();
        (b.finish(), class)
    }

    #[test]
    fn test_node_ids_continue_after_graph() {
        let (graph, _) = point_graph();
        let config = EscapeAnalysisConfig::default();
        let mut ctx = AnalysisContext::new(&graph, &config);
        let mut effects = EffectList::new();

        let first = ctx.new_node_id();
        assert_eq!(first.as_u32(), graph.next_node_id());
        let phi = ctx.new_phi(&mut effects, graph.entry(), ValueKind::Int);
        assert_eq!(ctx.phi_block(phi), Some(graph.entry()));
        assert_eq!(ctx.stamp_of(phi), ValueKind::Int);
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn test_materialization_cycle_is_patched() {
        let (graph, class) = point_graph();
        let config = EscapeAnalysisConfig::default();
        let mut ctx = AnalysisContext::new(&graph, &config);
        let mut effects = EffectList::new();
        let ret = *graph.block(graph.entry()).unwrap().nodes.last().unwrap();

        let a_alloc = NodeId::new(100);
        let b_alloc = NodeId::new(101);
        let ty = TypeRef::Class(class);
        let kinds = vec![ValueKind::Object, ValueKind::Object];
        let a = ctx.create_virtual_object(&mut effects, a_alloc, ty, kinds.clone());
        let b = ctx.create_virtual_object(&mut effects, b_alloc, ty, kinds);

        let mut state = BlockState::new();
        state.add_object(a, ObjectState::new_virtual(vec![b_alloc, b_alloc], 0));
        state.add_object(b, ObjectState::new_virtual(vec![a_alloc, a_alloc], 0));
        state.add_alias(a_alloc, a);
        state.add_alias(b_alloc, b);

        let start = effects.len();
        ctx.materialize_before(&mut state, Position::Before(ret), a, &mut effects)
            .unwrap();

        let recorded: Vec<&Effect> = effects.iter().skip(start).collect();
        let materializations = recorded
            .iter()
            .filter(|e| matches!(e, Effect::AddMaterialization { .. }))
            .count();
        let patches = recorded
            .iter()
            .filter(|e| matches!(e, Effect::PatchField { .. }))
            .count();
        assert_eq!(materializations, 2);
        assert_eq!(patches, 2);
        assert!(matches!(recorded.last(), Some(Effect::PatchField { .. })));
        assert!(!state.is_virtual(a));
        assert!(!state.is_virtual(b));
    }
}

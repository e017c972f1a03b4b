//! Abstract state of the partial escape analysis
//!
//! A [`BlockState`] describes, at one program point, which allocations are
//! still virtual, what their fields hold, and which graph values stand for
//! them. States are copied at every control-flow split, so object states are
//! shared behind `Rc` and only copied when one path changes them.

use super::block_iterator::MergeableBlockState;
use crate::ir::{NodeId, TypeRef, ValueKind, VirtualObjectId};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Static description of one tracked allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualObjectDescriptor {
    pub id: VirtualObjectId,
    pub ty: TypeRef,
    /// Kind of every field or array element, in layout order
    pub fields: Vec<ValueKind>,
    /// `VirtualObject` node standing for the allocation in snapshots
    pub node: NodeId,
    /// The allocation that was virtualized
    pub allocation: NodeId,
}

impl VirtualObjectDescriptor {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectContents {
    /// Not allocated; one value per field
    Virtual { fields: Vec<NodeId> },
    /// Allocated; `value` is the node producing the real object
    Materialized { value: NodeId },
}

/// What is known about one object at a program point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectState {
    pub contents: ObjectContents,
    /// Monitors held on the object
    pub lock_count: u32,
}

impl ObjectState {
    pub fn new_virtual(fields: Vec<NodeId>, lock_count: u32) -> Self {
        Self {
            contents: ObjectContents::Virtual { fields },
            lock_count,
        }
    }

    pub fn new_materialized(value: NodeId, lock_count: u32) -> Self {
        Self {
            contents: ObjectContents::Materialized { value },
            lock_count,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.contents, ObjectContents::Virtual { .. })
    }

    pub fn fields(&self) -> Option<&[NodeId]> {
        match &self.contents {
            ObjectContents::Virtual { fields } => Some(fields),
            ObjectContents::Materialized { .. } => None,
        }
    }

    pub fn materialized_value(&self) -> Option<NodeId> {
        match self.contents {
            ObjectContents::Materialized { value } => Some(value),
            ObjectContents::Virtual { .. } => None,
        }
    }
}

/// Analysis state flowing along one control-flow path
///
/// Every object an alias points to has an entry in the object map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockState {
    objects: BTreeMap<VirtualObjectId, Rc<ObjectState>>,
    object_aliases: BTreeMap<NodeId, VirtualObjectId>,
    scalar_aliases: BTreeMap<NodeId, NodeId>,
}

impl MergeableBlockState for BlockState {}

impl BlockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, id: VirtualObjectId, state: ObjectState) {
        self.objects.insert(id, Rc::new(state));
    }

    pub fn object_state(&self, id: VirtualObjectId) -> Option<&ObjectState> {
        self.objects.get(&id).map(|s| s.as_ref())
    }

    /// Mutable access; copies the object state if another path shares it.
    pub fn object_state_mut(&mut self, id: VirtualObjectId) -> Option<&mut ObjectState> {
        self.objects.get_mut(&id).map(Rc::make_mut)
    }

    pub fn objects(&self) -> impl Iterator<Item = (VirtualObjectId, &ObjectState)> {
        self.objects.iter().map(|(id, s)| (*id, s.as_ref()))
    }

    pub fn object_ids(&self) -> Vec<VirtualObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn add_alias(&mut self, node: NodeId, object: VirtualObjectId) {
        debug_assert!(self.objects.contains_key(&object), "alias to untracked {}", object);
        self.object_aliases.insert(node, object);
    }

    pub fn add_scalar_alias(&mut self, node: NodeId, value: NodeId) {
        self.scalar_aliases.insert(node, value);
    }

    pub fn aliases(&self) -> impl Iterator<Item = (NodeId, VirtualObjectId)> + '_ {
        self.object_aliases.iter().map(|(n, o)| (*n, *o))
    }

    pub fn alias_of(&self, node: NodeId) -> Option<VirtualObjectId> {
        self.object_aliases.get(&node).copied()
    }

    pub fn scalar_aliases(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.scalar_aliases.iter().map(|(n, v)| (*n, *v))
    }

    pub fn scalar_alias_of(&self, node: NodeId) -> Option<NodeId> {
        self.scalar_aliases.get(&node).copied()
    }

    /// Follow scalar aliases from `node` to the value it was replaced by.
    pub fn resolve(&self, node: NodeId) -> NodeId {
        let mut current = node;
        // Chains are acyclic; the bound only guards against corrupt states.
        for _ in 0..=self.scalar_aliases.len() {
            match self.scalar_aliases.get(&current) {
                Some(next) if *next != current => current = *next,
                _ => break,
            }
        }
        current
    }

    /// The tracked object `node` stands for, after scalar resolution.
    pub fn object_for(&self, node: NodeId) -> Option<VirtualObjectId> {
        self.object_aliases.get(&self.resolve(node)).copied()
    }

    pub fn is_virtual(&self, id: VirtualObjectId) -> bool {
        self.object_state(id).is_some_and(ObjectState::is_virtual)
    }

    pub fn materialized_value(&self, id: VirtualObjectId) -> Option<NodeId> {
        self.object_state(id).and_then(ObjectState::materialized_value)
    }

    pub fn lock_count(&self, id: VirtualObjectId) -> Option<u32> {
        self.object_state(id).map(|s| s.lock_count)
    }

    pub fn fields(&self, id: VirtualObjectId) -> Option<&[NodeId]> {
        self.object_state(id).and_then(ObjectState::fields)
    }

    /// Overwrite field `index` of a virtual object. Returns false if the
    /// object is not virtual or the index is out of range.
    pub fn set_field(&mut self, id: VirtualObjectId, index: usize, value: NodeId) -> bool {
        match self.object_state_mut(id).map(|s| &mut s.contents) {
            Some(ObjectContents::Virtual { fields }) if index < fields.len() => {
                fields[index] = value;
                true
            }
            _ => false,
        }
    }

    /// Turn a virtual object into a materialized one, keeping its lock count.
    pub fn set_materialized(&mut self, id: VirtualObjectId, value: NodeId) {
        if let Some(state) = self.object_state_mut(id) {
            state.contents = ObjectContents::Materialized { value };
        }
    }

    /// Virtual objects currently holding at least one monitor.
    pub fn locked_virtual_objects(&self) -> impl Iterator<Item = VirtualObjectId> + '_ {
        self.objects
            .iter()
            .filter(|(_, s)| s.is_virtual() && s.lock_count > 0)
            .map(|(id, _)| *id)
    }

    pub fn has_locked_virtual_objects(&self) -> bool {
        self.locked_virtual_objects().next().is_some()
    }

    /// Every alias points to a tracked object.
    pub fn is_consistent(&self) -> bool {
        self.object_aliases
            .values()
            .all(|o| self.objects.contains_key(o))
    }
}

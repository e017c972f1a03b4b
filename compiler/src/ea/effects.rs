//! Deferred graph edits
//!
//! The analysis never mutates the graph while it runs. Every decision is
//! recorded as an [`Effect`] in an [`EffectList`]; speculative loop attempts
//! take a [`Checkpoint`] and [`EffectList::backtrack`] to it when the attempt
//! is discarded. The list is applied once, in order, after the traversal.

use crate::ir::{Graph, GraphError, Inputs, Node, NodeId, NodeKind, Position, TypeRef, ValueKind, VirtualObjectId};
use fxhash::FxHashSet;
use log::trace;
use std::fmt;

/// One recorded graph edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create a floating node under a preallocated id. Phis are also
    /// registered with their block.
    AddFloatingNode {
        node: NodeId,
        kind: NodeKind,
        inputs: Inputs,
        stamp: ValueKind,
    },

    /// Unschedule a fixed node; it becomes obsolete
    DeleteNode { node: NodeId },

    /// Replace the first input of `node` equal to `old`
    ReplaceInput {
        node: NodeId,
        old: NodeId,
        new: NodeId,
    },

    /// Redirect every user of `node` to `replacement`
    ReplaceAtUsages { node: NodeId, replacement: NodeId },

    AddPhiInput { phi: NodeId, value: NodeId },

    SetPhiInput {
        phi: NodeId,
        index: usize,
        value: NodeId,
    },

    /// Allocate a virtual object for real at `position`
    AddMaterialization {
        node: NodeId,
        object: VirtualObjectId,
        ty: TypeRef,
        lock_count: u32,
        position: Position,
        values: Vec<NodeId>,
    },

    /// Store `value` into field `index` of the materialized `object`,
    /// closing a cycle between materializations
    PatchField {
        node: NodeId,
        object: NodeId,
        index: usize,
        value: NodeId,
        position: Position,
    },

    /// Drop a monitor operation on a virtual object
    EliminateMonitor { node: NodeId },

    /// Attach an object description to a snapshot, replacing an earlier
    /// description of the same object
    AddVirtualMapping {
        state: NodeId,
        mapping: NodeId,
        kind: NodeKind,
        inputs: Inputs,
    },
}

impl Effect {
    fn apply(&self, graph: &mut Graph, obsolete: &mut Vec<NodeId>) -> Result<(), GraphError> {
        match self {
            Effect::AddFloatingNode {
                node,
                kind,
                inputs,
                stamp,
            } => {
                graph.insert_node_with_id(*node, Node::new(kind.clone(), inputs.clone(), *stamp))?;
                if matches!(kind, NodeKind::Phi { .. }) {
                    graph.attach_phi(*node)?;
                }
            }
            Effect::DeleteNode { node } | Effect::EliminateMonitor { node } => {
                graph.unschedule(*node)?;
                obsolete.push(*node);
            }
            Effect::ReplaceInput { node, old, new } => {
                if !graph.replace_first_input(*node, *old, *new)? {
                    trace!("{} no longer uses {}", node, old);
                }
            }
            Effect::ReplaceAtUsages { node, replacement } => {
                graph.replace_at_usages(*node, *replacement);
            }
            Effect::AddPhiInput { phi, value } => graph.add_phi_input(*phi, *value)?,
            Effect::SetPhiInput { phi, index, value } => graph.set_phi_input(*phi, *index, *value)?,
            Effect::AddMaterialization {
                node,
                object,
                ty,
                lock_count,
                position,
                values,
            } => {
                let kind = NodeKind::Materialize {
                    object: *object,
                    ty: *ty,
                    lock_count: *lock_count,
                };
                graph.insert_node_with_id(
                    *node,
                    Node::new(kind, values.iter().copied().collect(), ValueKind::Object),
                )?;
                graph.schedule_at(*position, *node)?;
            }
            Effect::PatchField {
                node,
                object,
                index,
                value,
                position,
            } => {
                let inputs: Inputs = [*object, *value].into_iter().collect();
                graph.insert_node_with_id(
                    *node,
                    Node::new(NodeKind::PatchField { index: *index }, inputs, ValueKind::Void),
                )?;
                graph.schedule_at(*position, *node)?;
            }
            Effect::AddVirtualMapping {
                state,
                mapping,
                kind,
                inputs,
            } => {
                graph.insert_node_with_id(
                    *mapping,
                    Node::new(kind.clone(), inputs.clone(), ValueKind::Void),
                )?;
                graph.add_virtual_mapping(*state, *mapping)?;
            }
        }
        Ok(())
    }
}

fn write_ids(f: &mut fmt::Formatter<'_>, ids: &[NodeId]) -> fmt::Result {
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", id)?;
    }
    Ok(())
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::AddFloatingNode {
                node, kind, inputs, ..
            } => {
                write!(f, "add {} = {} [", node, kind)?;
                write_ids(f, inputs)?;
                write!(f, "]")
            }
            Effect::DeleteNode { node } => write!(f, "delete {}", node),
            Effect::ReplaceInput { node, old, new } => {
                write!(f, "replace input {} of {} with {}", old, node, new)
            }
            Effect::ReplaceAtUsages { node, replacement } => {
                write!(f, "replace usages of {} with {}", node, replacement)
            }
            Effect::AddPhiInput { phi, value } => write!(f, "add input {} to {}", value, phi),
            Effect::SetPhiInput { phi, index, value } => {
                write!(f, "set input {} of {} to {}", index, phi, value)
            }
            Effect::AddMaterialization {
                node,
                object,
                position,
                values,
                ..
            } => {
                write!(f, "materialize {} as {} {} [", object, node, position)?;
                write_ids(f, values)?;
                write!(f, "]")
            }
            Effect::PatchField {
                object,
                index,
                value,
                position,
                ..
            } => write!(f, "patch {}.{} = {} {}", object, index, value, position),
            Effect::EliminateMonitor { node } => write!(f, "eliminate monitor {}", node),
            Effect::AddVirtualMapping { state, mapping, .. } => {
                write!(f, "add mapping {} to {}", mapping, state)
            }
        }
    }
}

/// Position in an [`EffectList`] to backtrack to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// Ordered log of deferred graph edits, each tagged with the loop nesting
/// level it was recorded at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectList {
    entries: Vec<(u32, Effect)>,
    level: u32,
}

impl EffectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, effect: Effect) {
        self.entries.push((self.level, effect));
    }

    pub fn add_floating_node(&mut self, node: NodeId, kind: NodeKind, inputs: Inputs, stamp: ValueKind) {
        self.add(Effect::AddFloatingNode {
            node,
            kind,
            inputs,
            stamp,
        });
    }

    pub fn delete_node(&mut self, node: NodeId) {
        self.add(Effect::DeleteNode { node });
    }

    pub fn replace_input(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        self.add(Effect::ReplaceInput { node, old, new });
    }

    pub fn replace_at_usages(&mut self, node: NodeId, replacement: NodeId) {
        self.add(Effect::ReplaceAtUsages { node, replacement });
    }

    pub fn add_phi_input(&mut self, phi: NodeId, value: NodeId) {
        self.add(Effect::AddPhiInput { phi, value });
    }

    pub fn set_phi_input(&mut self, phi: NodeId, index: usize, value: NodeId) {
        self.add(Effect::SetPhiInput { phi, index, value });
    }

    pub fn eliminate_monitor(&mut self, node: NodeId) {
        self.add(Effect::EliminateMonitor { node });
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.entries.len())
    }

    /// Drop every entry recorded after `checkpoint`.
    pub fn backtrack(&mut self, checkpoint: Checkpoint) {
        self.entries.truncate(checkpoint.0);
    }

    pub fn inc_level(&mut self) {
        self.level += 1;
    }

    pub fn dec_level(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Move the entries of `other` to the end of this list.
    pub fn append(&mut self, other: EffectList) {
        self.entries.extend(other.entries);
    }

    /// Drop `phis` and their inputs. They must have been recorded after
    /// every checkpoint that is still live, since entries shift.
    pub fn discard_phis(&mut self, phis: &FxHashSet<NodeId>) {
        self.entries.retain(|(_, effect)| match effect {
            Effect::AddFloatingNode { node, .. } => !phis.contains(node),
            Effect::AddPhiInput { phi, .. } | Effect::SetPhiInput { phi, .. } => !phis.contains(phi),
            _ => true,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Effect> {
        self.entries.iter().map(|(_, effect)| effect)
    }

    /// Entries together with their nesting level.
    pub fn entries(&self) -> &[(u32, Effect)] {
        &self.entries
    }

    /// Log the list at trace level, indented by nesting level.
    pub fn trace(&self) {
        for (level, effect) in &self.entries {
            trace!("{:indent$}{}", "", effect, indent = *level as usize * 2);
        }
    }

    /// Perform the recorded edits in order. Returns the nodes that became
    /// obsolete, for dead-code elimination.
    pub fn apply(&self, graph: &mut Graph) -> Result<Vec<NodeId>, GraphError> {
        let mut obsolete = Vec::new();
        for (_, effect) in &self.entries {
            effect.apply(graph, &mut obsolete)?;
        }
        Ok(obsolete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, GraphBuilder};
    use smallvec::smallvec;

    #[test]
    fn test_backtrack_restores_list() {
        let mut effects = EffectList::new();
        effects.delete_node(NodeId::new(1));
        let before = effects.clone();

        let checkpoint = effects.checkpoint();
        effects.inc_level();
        effects.replace_input(NodeId::new(2), NodeId::new(3), NodeId::new(4));
        effects.add_phi_input(NodeId::new(5), NodeId::new(6));
        effects.eliminate_monitor(NodeId::new(7));
        effects.dec_level();
        effects.backtrack(checkpoint);

        assert_eq!(effects, before);
    }

    #[test]
    fn test_discard_phis_keeps_other_entries() {
        let block = crate::ir::BlockId::new(1);
        let mut effects = EffectList::new();
        effects.delete_node(NodeId::new(1));
        let (kept, dropped) = (NodeId::new(10), NodeId::new(11));
        for phi in [kept, dropped] {
            effects.add_floating_node(phi, NodeKind::Phi { block }, smallvec![], ValueKind::Int);
            effects.add_phi_input(phi, NodeId::new(2));
        }
        effects.set_phi_input(dropped, 0, NodeId::new(3));

        effects.discard_phis(&FxHashSet::from_iter([dropped]));

        assert_eq!(effects.len(), 3);
        let mut expected = EffectList::new();
        expected.delete_node(NodeId::new(1));
        expected.add_floating_node(kept, NodeKind::Phi { block }, smallvec![], ValueKind::Int);
        expected.add_phi_input(kept, NodeId::new(2));
        assert_eq!(effects, expected);
    }

    #[test]
    fn test_levels_and_append() {
        let mut effects = EffectList::new();
        effects.inc_level();
        let mut success = EffectList::new();
        success.inc_level();
        success.inc_level();
        success.delete_node(NodeId::new(1));

        effects.delete_node(NodeId::new(2));
        effects.append(success);

        let levels: Vec<u32> = effects.entries().iter().map(|(l, _)| *l).collect();
        assert_eq!(levels, vec![1, 2]);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn test_apply_materialization_and_delete() {
        let mut b = GraphBuilder::new();
        let point = b.add_class("Point", None, &[("x", ValueKind::Int)]);
        let alloc = b.build_new_instance(point).unwrap();
        let call = b.build_invoke("escape", &[alloc], ValueKind::Void).unwrap();
        let mut graph = b.finish();

        let one = NodeId::new(graph.next_node_id());
        let materialized = NodeId::new(graph.next_node_id() + 1);
        let mut effects = EffectList::new();
        effects.add_floating_node(
            one,
            NodeKind::Constant(Constant::Int(1)),
            smallvec![],
            ValueKind::Int,
        );
        effects.add(Effect::AddMaterialization {
            node: materialized,
            object: VirtualObjectId::new(0),
            ty: TypeRef::Class(point),
            lock_count: 0,
            position: Position::Before(call),
            values: vec![one],
        });
        effects.replace_input(call, alloc, materialized);
        effects.delete_node(alloc);

        let obsolete = effects.apply(&mut graph).unwrap();
        assert_eq!(obsolete, vec![alloc]);

        let entry = graph.block(graph.entry()).unwrap();
        let position = entry.nodes.iter().position(|n| *n == materialized).unwrap();
        assert_eq!(entry.nodes[position + 1], call);
        assert!(!entry.nodes.contains(&alloc));
        assert_eq!(graph.node(call).unwrap().inputs.as_slice(), &[materialized]);
        assert_eq!(graph.node(materialized).unwrap().inputs.as_slice(), &[one]);
    }
}

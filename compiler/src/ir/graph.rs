//! Node arena and graph mutation primitives
//!
//! The graph owns every node and block. Fixed nodes are scheduled in exactly
//! one block; floating nodes (constants, phis, proxies, snapshots and their
//! virtual object descriptions) live only in the arena and are kept alive by
//! their usages.

use super::{
    ArithmeticOp, Block, BlockId, ClassId, ClassInfo, CompareOp, Constant, FieldInfo, FieldRef,
    NodeId, Position, TypeRef, ValueKind, VirtualObjectId,
};
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

/// Node inputs; most nodes have at most four.
pub type Inputs = SmallVec<[NodeId; 4]>;

/// Node catalogue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    Parameter { index: u32 },
    Constant(Constant),
    /// `[lhs, rhs]`
    Arithmetic(ArithmeticOp),
    /// `[lhs, rhs]`
    Compare(CompareOp),

    /// Inputs are the initial field values, one per field of the class layout
    NewInstance { class: ClassId },
    /// Inputs are the initial element values, one per element
    NewArray { component: ValueKind, length: usize },

    /// `[object]`
    LoadField { field: FieldRef },
    /// `[object, value]`
    StoreField { field: FieldRef },
    /// `[array, index]`
    LoadIndexed { component: ValueKind },
    /// `[array, index, value]`
    StoreIndexed { component: ValueKind },
    /// `[array]`
    ArrayLength,
    /// `[object]`
    LoadHub,

    /// `[object]`
    IsNull,
    /// `[object]`, throws when the object is not an instance of `target`
    CheckCast { target: TypeRef },
    /// `[object]`, non-null guard that keeps the object identity
    Pi,
    /// `[value]`, makes a loop-defined value available at a loop exit
    ValueProxy { exit: BlockId },
    /// `[x, y]`
    ObjectEquals,

    /// `[object]`
    MonitorEnter,
    /// `[object]`
    MonitorExit,

    /// Call with its arguments as inputs
    Invoke { target: String },
    /// `[object]`
    RegisterFinalizer,
    /// `[object, offset]`
    UnsafeLoad,
    /// `[object, offset, value]`
    UnsafeStore,
    /// `[object, offset, expected, new]`
    CompareAndSwap,

    /// `[condition]`, ends a block with two successors
    If,
    /// `[value]` or `[]`
    Return,

    /// One input per predecessor of `block`
    Phi { block: BlockId },

    /// Deoptimization snapshot; inputs are the captured values
    FrameState {
        bci: u32,
        /// `VirtualObjectState` / `MaterializedObjectState` descriptions
        virtual_mappings: Vec<NodeId>,
    },
    /// Stand-in for a tracked allocation inside snapshots
    VirtualObject { object: VirtualObjectId, ty: TypeRef },
    /// `[virtual object, field values...]`
    VirtualObjectState { lock_count: u32 },
    /// `[virtual object, materialized value]`
    MaterializedObjectState,

    /// Real allocation of a previously virtual object; inputs are the field values
    Materialize { object: VirtualObjectId, ty: TypeRef, lock_count: u32 },
    /// `[object, value]`, deferred store closing a materialized cycle
    PatchField { index: usize },

    /// Node whose category the analysis does not know
    Opaque { name: String },
}

impl NodeKind {
    /// True for control transfer nodes that must stay last in a block.
    pub fn is_control_transfer(&self) -> bool {
        matches!(self, NodeKind::If | NodeKind::Return)
    }

    /// Nodes that may be dropped once nothing uses them.
    pub fn is_removable_when_unused(&self) -> bool {
        matches!(
            self,
            NodeKind::Constant(_)
                | NodeKind::Arithmetic(_)
                | NodeKind::Compare(_)
                | NodeKind::IsNull
                | NodeKind::ObjectEquals
                | NodeKind::Pi
                | NodeKind::ValueProxy { .. }
                | NodeKind::Phi { .. }
                | NodeKind::LoadHub
                | NodeKind::FrameState { .. }
                | NodeKind::VirtualObject { .. }
                | NodeKind::VirtualObjectState { .. }
                | NodeKind::MaterializedObjectState
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Start => write!(f, "Start"),
            NodeKind::Parameter { index } => write!(f, "Parameter({})", index),
            NodeKind::Constant(c) => write!(f, "Constant({})", c),
            NodeKind::Arithmetic(op) => write!(f, "Arithmetic({})", op),
            NodeKind::Compare(op) => write!(f, "Compare({})", op),
            NodeKind::NewInstance { class } => write!(f, "NewInstance({})", class),
            NodeKind::NewArray { component, length } => {
                write!(f, "NewArray({}[{}])", component, length)
            }
            NodeKind::LoadField { field } => write!(f, "LoadField({})", field),
            NodeKind::StoreField { field } => write!(f, "StoreField({})", field),
            NodeKind::LoadIndexed { .. } => write!(f, "LoadIndexed"),
            NodeKind::StoreIndexed { .. } => write!(f, "StoreIndexed"),
            NodeKind::ArrayLength => write!(f, "ArrayLength"),
            NodeKind::LoadHub => write!(f, "LoadHub"),
            NodeKind::IsNull => write!(f, "IsNull"),
            NodeKind::CheckCast { target } => write!(f, "CheckCast({})", target),
            NodeKind::Pi => write!(f, "Pi"),
            NodeKind::ValueProxy { exit } => write!(f, "ValueProxy({})", exit),
            NodeKind::ObjectEquals => write!(f, "ObjectEquals"),
            NodeKind::MonitorEnter => write!(f, "MonitorEnter"),
            NodeKind::MonitorExit => write!(f, "MonitorExit"),
            NodeKind::Invoke { target } => write!(f, "Invoke({})", target),
            NodeKind::RegisterFinalizer => write!(f, "RegisterFinalizer"),
            NodeKind::UnsafeLoad => write!(f, "UnsafeLoad"),
            NodeKind::UnsafeStore => write!(f, "UnsafeStore"),
            NodeKind::CompareAndSwap => write!(f, "CompareAndSwap"),
            NodeKind::If => write!(f, "If"),
            NodeKind::Return => write!(f, "Return"),
            NodeKind::Phi { block } => write!(f, "Phi({})", block),
            NodeKind::FrameState { bci, .. } => write!(f, "FrameState(@{})", bci),
            NodeKind::VirtualObject { object, ty } => write!(f, "VirtualObject({} {})", object, ty),
            NodeKind::VirtualObjectState { lock_count } => {
                write!(f, "VirtualObjectState(locks={})", lock_count)
            }
            NodeKind::MaterializedObjectState => write!(f, "MaterializedObjectState"),
            NodeKind::Materialize {
                object,
                ty,
                lock_count,
            } => write!(f, "Materialize({} {} locks={})", object, ty, lock_count),
            NodeKind::PatchField { index } => write!(f, "PatchField({})", index),
            NodeKind::Opaque { name } => write!(f, "Opaque({})", name),
        }
    }
}

/// A node in the graph arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Inputs,
    /// Kind of the value this node produces
    pub stamp: ValueKind,
    /// Snapshot describing the frame after this node executes
    pub state_after: Option<NodeId>,
    /// Block this node is scheduled in; `None` for floating nodes
    pub block: Option<BlockId>,
}

impl Node {
    pub fn new(kind: NodeKind, inputs: Inputs, stamp: ValueKind) -> Self {
        Self {
            kind,
            inputs,
            stamp,
            state_after: None,
            block: None,
        }
    }

    /// Every node id this node refers to: inputs, its snapshot, and the
    /// virtual mappings of a snapshot.
    pub fn references(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mappings: &[NodeId] = match &self.kind {
            NodeKind::FrameState {
                virtual_mappings, ..
            } => virtual_mappings,
            _ => &[],
        };
        self.inputs
            .iter()
            .copied()
            .chain(self.state_after)
            .chain(mappings.iter().copied())
    }
}

/// Errors raised by graph mutation primitives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A node id does not refer to a live node
    MissingNode(NodeId),
    /// A block id does not refer to a block
    MissingBlock(BlockId),
    /// A preallocated id is already taken
    NodeIdInUse(NodeId),
    /// A node expected in a block schedule is not scheduled
    NotScheduled(NodeId),
    /// The node has the wrong kind for the operation
    UnexpectedKind { node: NodeId, expected: &'static str },
    /// A phi input index is out of range
    PhiInputOutOfRange { phi: NodeId, index: usize },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::MissingNode(node) => write!(f, "Node {} does not exist", node),
            GraphError::MissingBlock(block) => write!(f, "Block {} does not exist", block),
            GraphError::NodeIdInUse(node) => write!(f, "Node id {} is already in use", node),
            GraphError::NotScheduled(node) => write!(f, "Node {} is not scheduled", node),
            GraphError::UnexpectedKind { node, expected } => {
                write!(f, "Node {} is not a {}", node, expected)
            }
            GraphError::PhiInputOutOfRange { phi, index } => {
                write!(f, "Phi {} has no input {}", phi, index)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Scheduled graph of one compilation unit
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    blocks: Vec<Block>,
    classes: Vec<ClassInfo>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------
    // Classes
    // ---------------------------------------------------------------

    /// Declare a class. The flat layout is the superclass layout followed by
    /// `fields`.
    pub fn add_class(
        &mut self,
        name: impl Into<String>,
        superclass: Option<ClassId>,
        fields: &[(&str, ValueKind)],
    ) -> ClassId {
        let id = ClassId::new(self.classes.len() as u32);
        let mut layout: Vec<FieldInfo> = superclass
            .and_then(|s| self.classes.get(s.index()))
            .map(|s| s.fields.clone())
            .unwrap_or_default();
        layout.extend(fields.iter().map(|(name, kind)| FieldInfo {
            name: name.to_string(),
            kind: *kind,
        }));
        self.classes.push(ClassInfo {
            id,
            name: name.into(),
            superclass,
            fields: layout,
            has_finalizer: false,
        });
        id
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassInfo> {
        self.classes.get(id.index())
    }

    pub fn class_mut(&mut self, id: ClassId) -> Option<&mut ClassInfo> {
        self.classes.get_mut(id.index())
    }

    pub fn classes(&self) -> &[ClassInfo] {
        &self.classes
    }

    /// Walks the superclass chain of `sub` looking for `sup`.
    pub fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        let mut current = Some(sub);
        while let Some(class) = current {
            if class == sup {
                return true;
            }
            current = self.class(class).and_then(|c| c.superclass);
        }
        false
    }

    pub fn is_subtype(&self, sub: TypeRef, sup: TypeRef) -> bool {
        match (sub, sup) {
            (TypeRef::Class(a), TypeRef::Class(b)) => self.is_subclass(a, b),
            (TypeRef::Array(a), TypeRef::Array(b)) => a == b,
            _ => false,
        }
    }

    /// Offset of `field` inside instances of `class`, if instances of
    /// `class` have that field.
    pub fn field_offset(&self, class: ClassId, field: FieldRef) -> Option<usize> {
        if !self.is_subclass(class, field.class) {
            return None;
        }
        let declaring = self.class(field.class)?;
        (field.index < declaring.fields.len()).then_some(field.index)
    }

    /// Field kinds of an allocation of type `ty` with `length` elements.
    pub fn layout_of(&self, ty: TypeRef, length: usize) -> Vec<ValueKind> {
        match ty {
            TypeRef::Class(class) => self
                .class(class)
                .map(|c| c.fields.iter().map(|f| f.kind).collect())
                .unwrap_or_default(),
            TypeRef::Array(component) => vec![component; length],
        }
    }

    // ---------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------

    pub fn add_block(&mut self, label: Option<&str>) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        let block = match label {
            Some(label) => Block::with_label(id, label),
            None => Block::new(id),
        };
        self.blocks.push(block);
        id
    }

    /// Adds a control edge. Predecessor order follows call order.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) -> Result<(), GraphError> {
        self.block_mut(from)?.successors.push(to);
        self.block_mut(to)?.predecessors.push(from);
        Ok(())
    }

    /// The first block is the entry.
    pub fn entry(&self) -> BlockId {
        BlockId::new(0)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    pub fn block_mut(&mut self, id: BlockId) -> Result<&mut Block, GraphError> {
        self.blocks
            .get_mut(id.index())
            .ok_or(GraphError::MissingBlock(id))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    // ---------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------

    /// Id the next node added to the arena will get.
    pub fn next_node_id(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Adds a floating node.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    /// Adds a node at the end of `block`'s schedule.
    pub fn append_node(&mut self, block: BlockId, mut node: Node) -> Result<NodeId, GraphError> {
        if self.block(block).is_none() {
            return Err(GraphError::MissingBlock(block));
        }
        node.block = Some(block);
        let id = self.add_node(node);
        self.block_mut(block)?.nodes.push(id);
        Ok(id)
    }

    /// Adds a phi to `block`.
    pub fn add_phi(
        &mut self,
        block: BlockId,
        stamp: ValueKind,
        inputs: &[NodeId],
    ) -> Result<NodeId, GraphError> {
        if self.block(block).is_none() {
            return Err(GraphError::MissingBlock(block));
        }
        let id = self.add_node(Node::new(
            NodeKind::Phi { block },
            inputs.iter().copied().collect(),
            stamp,
        ));
        self.block_mut(block)?.phis.push(id);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.index())
            .and_then(|n| n.as_mut())
            .ok_or(GraphError::MissingNode(id))
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.node(id).map(|n| &n.kind)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Constant value of `id`, if it is a constant node.
    pub fn as_constant(&self, id: NodeId) -> Option<Constant> {
        match self.kind(id) {
            Some(NodeKind::Constant(c)) => Some(*c),
            _ => None,
        }
    }

    /// Live nodes in id order.
    pub fn live_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId::new(i as u32), n)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Users of every live node, in id order of the user.
    pub fn compute_usages(&self) -> FxHashMap<NodeId, Vec<NodeId>> {
        let mut usages: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for (id, node) in self.live_nodes() {
            for referenced in node.references() {
                let users = usages.entry(referenced).or_default();
                if users.last() != Some(&id) {
                    users.push(id);
                }
            }
        }
        usages
    }

    /// Users of `id`.
    pub fn usages(&self, id: NodeId) -> Vec<NodeId> {
        self.live_nodes()
            .filter(|(_, node)| node.references().any(|r| r == id))
            .map(|(user, _)| user)
            .collect()
    }

    // ---------------------------------------------------------------
    // Mutation primitives
    // ---------------------------------------------------------------

    /// Adds a node under an id reserved earlier. Skipped ids stay empty.
    pub fn insert_node_with_id(&mut self, id: NodeId, node: Node) -> Result<(), GraphError> {
        if self.contains(id) {
            return Err(GraphError::NodeIdInUse(id));
        }
        if self.nodes.len() <= id.index() {
            self.nodes.resize(id.index() + 1, None);
        }
        self.nodes[id.index()] = Some(node);
        Ok(())
    }

    /// Schedules an existing floating node at `position`.
    pub fn schedule_at(&mut self, position: Position, id: NodeId) -> Result<(), GraphError> {
        let (block, index) = match position {
            Position::Before(anchor) => {
                let block = self
                    .node(anchor)
                    .ok_or(GraphError::MissingNode(anchor))?
                    .block
                    .ok_or(GraphError::NotScheduled(anchor))?;
                let index = self
                    .block(block)
                    .and_then(|b| b.nodes.iter().position(|n| *n == anchor))
                    .ok_or(GraphError::NotScheduled(anchor))?;
                (block, index)
            }
            Position::BlockEnd(block) => {
                let nodes = &self.block(block).ok_or(GraphError::MissingBlock(block))?.nodes;
                let index = match nodes.last() {
                    Some(last)
                        if self
                            .kind(*last)
                            .map_or(false, |k| k.is_control_transfer()) =>
                    {
                        nodes.len() - 1
                    }
                    _ => nodes.len(),
                };
                (block, index)
            }
        };
        self.node_mut(id)?.block = Some(block);
        self.block_mut(block)?.nodes.insert(index, id);
        Ok(())
    }

    /// Removes a fixed node from its block schedule. The node stays in the
    /// arena until dead-code elimination removes it.
    pub fn unschedule(&mut self, id: NodeId) -> Result<(), GraphError> {
        let block = self.node_mut(id)?.block.take();
        if let Some(block) = block {
            self.block_mut(block)?.nodes.retain(|n| *n != id);
        }
        Ok(())
    }

    /// Replaces the first input of `node` equal to `old`. Returns whether an
    /// input was replaced.
    pub fn replace_first_input(
        &mut self,
        node: NodeId,
        old: NodeId,
        new: NodeId,
    ) -> Result<bool, GraphError> {
        let node = self.node_mut(node)?;
        match node.inputs.iter_mut().find(|i| **i == old) {
            Some(input) => {
                *input = new;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Redirects every input referring to `old` to `new`.
    pub fn replace_at_usages(&mut self, old: NodeId, new: NodeId) {
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs.iter_mut() {
                if *input == old {
                    *input = new;
                }
            }
        }
    }

    pub fn add_phi_input(&mut self, phi: NodeId, value: NodeId) -> Result<(), GraphError> {
        let node = self.node_mut(phi)?;
        if !matches!(node.kind, NodeKind::Phi { .. }) {
            return Err(GraphError::UnexpectedKind {
                node: phi,
                expected: "phi",
            });
        }
        node.inputs.push(value);
        Ok(())
    }

    pub fn set_phi_input(
        &mut self,
        phi: NodeId,
        index: usize,
        value: NodeId,
    ) -> Result<(), GraphError> {
        let node = self.node_mut(phi)?;
        if !matches!(node.kind, NodeKind::Phi { .. }) {
            return Err(GraphError::UnexpectedKind {
                node: phi,
                expected: "phi",
            });
        }
        let input = node
            .inputs
            .get_mut(index)
            .ok_or(GraphError::PhiInputOutOfRange { phi, index })?;
        *input = value;
        Ok(())
    }

    /// Registers a floating phi with its block.
    pub fn attach_phi(&mut self, phi: NodeId) -> Result<(), GraphError> {
        let block = match self.kind(phi) {
            Some(NodeKind::Phi { block }) => *block,
            Some(_) => {
                return Err(GraphError::UnexpectedKind {
                    node: phi,
                    expected: "phi",
                })
            }
            None => return Err(GraphError::MissingNode(phi)),
        };
        self.block_mut(block)?.phis.push(phi);
        Ok(())
    }

    /// Adds `mapping` to snapshot `state`, replacing an existing mapping
    /// that describes the same virtual object.
    pub fn add_virtual_mapping(&mut self, state: NodeId, mapping: NodeId) -> Result<(), GraphError> {
        let object = self
            .node(mapping)
            .ok_or(GraphError::MissingNode(mapping))?
            .inputs
            .first()
            .copied();
        let existing: Vec<NodeId> = match self.kind(state) {
            Some(NodeKind::FrameState {
                virtual_mappings, ..
            }) => virtual_mappings.clone(),
            Some(_) => {
                return Err(GraphError::UnexpectedKind {
                    node: state,
                    expected: "frame state",
                })
            }
            None => return Err(GraphError::MissingNode(state)),
        };
        let replaced = existing.iter().position(|m| {
            self.node(*m).and_then(|n| n.inputs.first().copied()) == object
        });
        if let NodeKind::FrameState {
            virtual_mappings, ..
        } = &mut self.node_mut(state)?.kind
        {
            match replaced {
                Some(index) => virtual_mappings[index] = mapping,
                None => virtual_mappings.push(mapping),
            }
        }
        Ok(())
    }

    /// Deletes a node from the arena, its block schedule and its block's phi list.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        let node = self
            .nodes
            .get_mut(id.index())
            .and_then(|n| n.take())
            .ok_or(GraphError::MissingNode(id))?;
        if let Some(block) = node.block {
            self.block_mut(block)?.nodes.retain(|n| *n != id);
        }
        if let NodeKind::Phi { block } = node.kind {
            self.block_mut(block)?.phis.retain(|n| *n != id);
        }
        Ok(node)
    }
}

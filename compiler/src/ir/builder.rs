//! Graph Builder
//!
//! Provides a convenient API for constructing scheduled graphs. Fixed nodes
//! are appended to the current block; constants, parameters and snapshots are
//! floating. Predecessor order follows the order in which edges are built, so
//! build the forward edge into a loop header before its back edges.

use super::{
    ArithmeticOp, BlockId, ClassId, CompareOp, Constant, FieldRef, Graph, Inputs, Node, NodeId,
    NodeKind, TypeRef, ValueKind,
};
use smallvec::smallvec;

/// Builder for graphs
pub struct GraphBuilder {
    graph: Graph,
    current_block: Option<BlockId>,
    next_bci: u32,
}

impl GraphBuilder {
    /// Create a builder whose entry block holds the start node.
    pub fn new() -> Self {
        let mut graph = Graph::new();
        let entry = graph.add_block(Some("entry"));
        let start = Node::new(NodeKind::Start, Inputs::new(), ValueKind::Void);
        let _ = graph.append_node(entry, start);
        Self {
            graph,
            current_block: Some(entry),
            next_bci: 0,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    pub fn entry(&self) -> BlockId {
        self.graph.entry()
    }

    // ---------------------------------------------------------------
    // Classes
    // ---------------------------------------------------------------

    pub fn add_class(
        &mut self,
        name: &str,
        superclass: Option<ClassId>,
        fields: &[(&str, ValueKind)],
    ) -> ClassId {
        self.graph.add_class(name, superclass, fields)
    }

    pub fn set_has_finalizer(&mut self, class: ClassId) {
        if let Some(info) = self.graph.class_mut(class) {
            info.has_finalizer = true;
        }
    }

    /// Look up a field of `class` (inherited fields included) by name.
    pub fn field(&self, class: ClassId, name: &str) -> Option<FieldRef> {
        let index = self
            .graph
            .class(class)?
            .fields
            .iter()
            .position(|f| f.name == name)?;
        Some(FieldRef { class, index })
    }

    // ---------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------

    pub fn create_block(&mut self, label: &str) -> BlockId {
        self.graph.add_block(Some(label))
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = self.graph.block(block).map(|b| b.id);
    }

    pub fn current_block(&self) -> Option<BlockId> {
        self.current_block
    }

    fn append(&mut self, kind: NodeKind, inputs: Inputs, stamp: ValueKind) -> Option<NodeId> {
        let block = self.current_block?;
        self.graph
            .append_node(block, Node::new(kind, inputs, stamp))
            .ok()
    }

    // ---------------------------------------------------------------
    // Floating values
    // ---------------------------------------------------------------

    pub fn build_const(&mut self, value: Constant) -> NodeId {
        self.graph.add_node(Node::new(
            NodeKind::Constant(value),
            Inputs::new(),
            value.kind(),
        ))
    }

    pub fn build_int(&mut self, value: i64) -> NodeId {
        self.build_const(Constant::Int(value))
    }

    pub fn build_bool(&mut self, value: bool) -> NodeId {
        self.build_const(Constant::Bool(value))
    }

    pub fn build_null(&mut self) -> NodeId {
        self.build_const(Constant::Null)
    }

    pub fn build_parameter(&mut self, index: u32, stamp: ValueKind) -> NodeId {
        self.graph
            .add_node(Node::new(NodeKind::Parameter { index }, Inputs::new(), stamp))
    }

    /// Snapshot capturing `values`. Attach it with [`Self::attach_state`].
    pub fn build_frame_state(&mut self, values: &[NodeId]) -> NodeId {
        let bci = self.next_bci;
        self.next_bci += 1;
        self.graph.add_node(Node::new(
            NodeKind::FrameState {
                bci,
                virtual_mappings: Vec::new(),
            },
            values.iter().copied().collect(),
            ValueKind::Void,
        ))
    }

    pub fn attach_state(&mut self, node: NodeId, state: NodeId) -> Option<()> {
        self.graph.node_mut(node).ok()?.state_after = Some(state);
        Some(())
    }

    /// Phi in `block`. Inputs for back edges may be added later with
    /// [`Self::add_phi_input`].
    pub fn build_phi(&mut self, block: BlockId, stamp: ValueKind, inputs: &[NodeId]) -> Option<NodeId> {
        self.graph.add_phi(block, stamp, inputs).ok()
    }

    pub fn add_phi_input(&mut self, phi: NodeId, value: NodeId) -> Option<()> {
        self.graph.add_phi_input(phi, value).ok()
    }

    // ---------------------------------------------------------------
    // Allocations
    // ---------------------------------------------------------------

    /// Allocation with every field set to its default value.
    pub fn build_new_instance(&mut self, class: ClassId) -> Option<NodeId> {
        let kinds = self.graph.layout_of(TypeRef::Class(class), 0);
        let values: Vec<NodeId> = kinds
            .into_iter()
            .map(|k| self.build_const(Constant::default_for(k)))
            .collect();
        self.build_new_instance_with(class, &values)
    }

    pub fn build_new_instance_with(&mut self, class: ClassId, values: &[NodeId]) -> Option<NodeId> {
        self.append(
            NodeKind::NewInstance { class },
            values.iter().copied().collect(),
            ValueKind::Object,
        )
    }

    pub fn build_new_array(&mut self, component: ValueKind, length: usize) -> Option<NodeId> {
        let default = self.build_const(Constant::default_for(component));
        let values = vec![default; length];
        self.append(
            NodeKind::NewArray { component, length },
            values.into_iter().collect(),
            ValueKind::Object,
        )
    }

    // ---------------------------------------------------------------
    // Memory access
    // ---------------------------------------------------------------

    pub fn build_load_field(&mut self, object: NodeId, field: FieldRef) -> Option<NodeId> {
        let stamp = self.graph.class(field.class)?.fields.get(field.index)?.kind;
        self.append(NodeKind::LoadField { field }, smallvec![object], stamp)
    }

    pub fn build_store_field(&mut self, object: NodeId, field: FieldRef, value: NodeId) -> Option<NodeId> {
        self.append(
            NodeKind::StoreField { field },
            smallvec![object, value],
            ValueKind::Void,
        )
    }

    pub fn build_load_indexed(&mut self, array: NodeId, index: NodeId, component: ValueKind) -> Option<NodeId> {
        self.append(
            NodeKind::LoadIndexed { component },
            smallvec![array, index],
            component,
        )
    }

    pub fn build_store_indexed(
        &mut self,
        array: NodeId,
        index: NodeId,
        value: NodeId,
        component: ValueKind,
    ) -> Option<NodeId> {
        self.append(
            NodeKind::StoreIndexed { component },
            smallvec![array, index, value],
            ValueKind::Void,
        )
    }

    pub fn build_array_length(&mut self, array: NodeId) -> Option<NodeId> {
        self.append(NodeKind::ArrayLength, smallvec![array], ValueKind::Int)
    }

    pub fn build_load_hub(&mut self, object: NodeId) -> Option<NodeId> {
        self.append(NodeKind::LoadHub, smallvec![object], ValueKind::Object)
    }

    pub fn build_unsafe_load(&mut self, object: NodeId, offset: NodeId, stamp: ValueKind) -> Option<NodeId> {
        self.append(NodeKind::UnsafeLoad, smallvec![object, offset], stamp)
    }

    pub fn build_unsafe_store(&mut self, object: NodeId, offset: NodeId, value: NodeId) -> Option<NodeId> {
        self.append(
            NodeKind::UnsafeStore,
            smallvec![object, offset, value],
            ValueKind::Void,
        )
    }

    pub fn build_compare_and_swap(
        &mut self,
        object: NodeId,
        offset: NodeId,
        expected: NodeId,
        new: NodeId,
    ) -> Option<NodeId> {
        self.append(
            NodeKind::CompareAndSwap,
            smallvec![object, offset, expected, new],
            ValueKind::Bool,
        )
    }

    // ---------------------------------------------------------------
    // Checks and guards
    // ---------------------------------------------------------------

    pub fn build_is_null(&mut self, object: NodeId) -> Option<NodeId> {
        self.append(NodeKind::IsNull, smallvec![object], ValueKind::Bool)
    }

    pub fn build_check_cast(&mut self, object: NodeId, target: TypeRef) -> Option<NodeId> {
        self.append(NodeKind::CheckCast { target }, smallvec![object], ValueKind::Object)
    }

    pub fn build_pi(&mut self, object: NodeId) -> Option<NodeId> {
        self.append(NodeKind::Pi, smallvec![object], ValueKind::Object)
    }

    /// Proxy for `value` at the loop exit `exit`.
    pub fn build_value_proxy(&mut self, value: NodeId, exit: BlockId) -> Option<NodeId> {
        let stamp = self.graph.node(value)?.stamp;
        self.append(NodeKind::ValueProxy { exit }, smallvec![value], stamp)
    }

    pub fn build_object_equals(&mut self, x: NodeId, y: NodeId) -> Option<NodeId> {
        self.append(NodeKind::ObjectEquals, smallvec![x, y], ValueKind::Bool)
    }

    pub fn build_monitor_enter(&mut self, object: NodeId) -> Option<NodeId> {
        self.append(NodeKind::MonitorEnter, smallvec![object], ValueKind::Void)
    }

    pub fn build_monitor_exit(&mut self, object: NodeId) -> Option<NodeId> {
        self.append(NodeKind::MonitorExit, smallvec![object], ValueKind::Void)
    }

    // ---------------------------------------------------------------
    // Calls and scalar operations
    // ---------------------------------------------------------------

    pub fn build_invoke(&mut self, target: &str, args: &[NodeId], stamp: ValueKind) -> Option<NodeId> {
        self.append(
            NodeKind::Invoke {
                target: target.to_string(),
            },
            args.iter().copied().collect(),
            stamp,
        )
    }

    pub fn build_register_finalizer(&mut self, object: NodeId) -> Option<NodeId> {
        self.append(NodeKind::RegisterFinalizer, smallvec![object], ValueKind::Void)
    }

    pub fn build_arithmetic(&mut self, op: ArithmeticOp, lhs: NodeId, rhs: NodeId) -> Option<NodeId> {
        self.append(NodeKind::Arithmetic(op), smallvec![lhs, rhs], ValueKind::Int)
    }

    pub fn build_compare(&mut self, op: CompareOp, lhs: NodeId, rhs: NodeId) -> Option<NodeId> {
        self.append(NodeKind::Compare(op), smallvec![lhs, rhs], ValueKind::Bool)
    }

    pub fn build_opaque(&mut self, name: &str, inputs: &[NodeId], stamp: ValueKind) -> Option<NodeId> {
        self.append(
            NodeKind::Opaque {
                name: name.to_string(),
            },
            inputs.iter().copied().collect(),
            stamp,
        )
    }

    // ---------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------

    pub fn build_goto(&mut self, target: BlockId) -> Option<()> {
        let block = self.current_block?;
        self.graph.add_edge(block, target).ok()
    }

    pub fn build_if(&mut self, condition: NodeId, then_block: BlockId, else_block: BlockId) -> Option<NodeId> {
        let block = self.current_block?;
        let node = self.append(NodeKind::If, smallvec![condition], ValueKind::Void)?;
        self.graph.add_edge(block, then_block).ok()?;
        self.graph.add_edge(block, else_block).ok()?;
        Some(node)
    }

    pub fn build_return(&mut self, value: Option<NodeId>) -> Option<NodeId> {
        let inputs: Inputs = value.into_iter().collect();
        self.append(NodeKind::Return, inputs, ValueKind::Void)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

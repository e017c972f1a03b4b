use pea_compiler::ea::{EscapeAnalysisConfig, EscapeAnalysisReport, PartialEscapePhase};
use pea_compiler::ir::validation::validate_graph;
use pea_compiler::ir::{
    ArithmeticOp, BlockId, ClassId, Constant, FieldRef, Graph, GraphBuilder, NodeId, NodeKind,
    TypeRef, ValueKind,
};
use pea_compiler::logging;

fn point_class(b: &mut GraphBuilder) -> (ClassId, FieldRef, FieldRef) {
    let class = b.add_class("Point", None, &[("x", ValueKind::Int), ("y", ValueKind::Int)]);
    let x = b.field(class, "x").unwrap();
    let y = b.field(class, "y").unwrap();
    (class, x, y)
}

fn run(graph: &mut Graph) -> EscapeAnalysisReport {
    logging::init_test();
    let report = PartialEscapePhase::default().run(graph).unwrap();
    if let Err(errors) = validate_graph(graph) {
        panic!("graph invalid after escape analysis: {:?}", errors);
    }
    report
}

fn scheduled(graph: &Graph, block: BlockId, pred: impl Fn(&NodeKind) -> bool) -> Vec<NodeId> {
    graph
        .block(block)
        .unwrap()
        .nodes
        .iter()
        .copied()
        .filter(|n| pred(graph.kind(*n).unwrap()))
        .collect()
}

fn all_scheduled(graph: &Graph, pred: impl Fn(&NodeKind) -> bool) -> Vec<NodeId> {
    graph
        .blocks()
        .iter()
        .flat_map(|b| b.nodes.iter().copied())
        .filter(|n| pred(graph.kind(*n).unwrap()))
        .collect()
}

fn is_materialize(kind: &NodeKind) -> bool {
    matches!(kind, NodeKind::Materialize { .. })
}

fn input(graph: &Graph, node: NodeId, index: usize) -> NodeId {
    graph.node(node).unwrap().inputs[index]
}

#[test]
fn test_non_escaping_allocation_is_removed() {
    let mut b = GraphBuilder::new();
    let (point, x, _) = point_class(&mut b);
    let seven = b.build_int(7);
    let alloc = b.build_new_instance(point).unwrap();
    b.build_store_field(alloc, x, seven).unwrap();
    let load = b.build_load_field(alloc, x).unwrap();
    let ret = b.build_return(Some(load)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.allocations_virtualized, 1);
    assert_eq!(report.stats.loads_removed, 1);
    assert_eq!(report.stats.stores_removed, 1);
    assert_eq!(report.stats.materializations, 0);
    assert!(!graph.contains(alloc));
    assert_eq!(input(&graph, ret, 0), seven);
    assert_eq!(graph.block(graph.entry()).unwrap().nodes.len(), 2);
}

#[test]
fn test_branch_stores_merge_into_phi() {
    let mut b = GraphBuilder::new();
    let (point, x, _) = point_class(&mut b);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let one = b.build_int(1);
    let two = b.build_int(2);
    let alloc = b.build_new_instance(point).unwrap();
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.build_if(cond, left, right).unwrap();

    b.switch_to_block(left);
    b.build_store_field(alloc, x, one).unwrap();
    b.build_goto(merge).unwrap();
    b.switch_to_block(right);
    b.build_store_field(alloc, x, two).unwrap();
    b.build_goto(merge).unwrap();

    b.switch_to_block(merge);
    let load = b.build_load_field(alloc, x).unwrap();
    let ret = b.build_return(Some(load)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 0);
    assert_eq!(report.stats.merges, 1);
    // Field y agrees on both paths and gets no phi.
    assert_eq!(report.stats.phis_created, 1);
    assert!(all_scheduled(&graph, is_materialize).is_empty());

    let phi = input(&graph, ret, 0);
    assert_eq!(graph.kind(phi), Some(&NodeKind::Phi { block: merge }));
    assert!(graph.block(merge).unwrap().phis.contains(&phi));
    let values: Vec<Option<Constant>> = graph
        .node(phi)
        .unwrap()
        .inputs
        .iter()
        .map(|v| graph.as_constant(*v))
        .collect();
    assert_eq!(values, vec![Some(Constant::Int(1)), Some(Constant::Int(2))]);
}

#[test]
fn test_materializes_only_on_escaping_branch() {
    let mut b = GraphBuilder::new();
    let (point, x, _) = point_class(&mut b);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let alloc = b.build_new_instance(point).unwrap();
    let escapes = b.create_block("escapes");
    let stays = b.create_block("stays");
    b.build_if(cond, escapes, stays).unwrap();

    b.switch_to_block(escapes);
    let call = b.build_invoke("publish", &[alloc], ValueKind::Void).unwrap();
    b.build_return(None).unwrap();

    b.switch_to_block(stays);
    let load = b.build_load_field(alloc, x).unwrap();
    let ret = b.build_return(Some(load)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 1);
    let materialized = scheduled(&graph, escapes, is_materialize);
    assert_eq!(materialized.len(), 1);
    assert!(scheduled(&graph, stays, is_materialize).is_empty());

    // The allocation happens right before the call that publishes it.
    let nodes = &graph.block(escapes).unwrap().nodes;
    let at = nodes.iter().position(|n| *n == materialized[0]).unwrap();
    assert_eq!(nodes[at + 1], call);
    assert_eq!(input(&graph, call, 0), materialized[0]);

    assert_eq!(graph.as_constant(input(&graph, ret, 0)), Some(Constant::Int(0)));
}

#[test]
fn test_object_live_after_merge_gets_object_phi() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let alloc = b.build_new_instance(point).unwrap();
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.build_if(cond, left, right).unwrap();

    b.switch_to_block(left);
    b.build_invoke("publish", &[alloc], ValueKind::Void).unwrap();
    b.build_goto(merge).unwrap();
    b.switch_to_block(right);
    b.build_goto(merge).unwrap();

    b.switch_to_block(merge);
    let ret = b.build_return(Some(alloc)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 2);
    assert_eq!(scheduled(&graph, left, is_materialize).len(), 1);
    assert_eq!(scheduled(&graph, right, is_materialize).len(), 1);

    let phi = input(&graph, ret, 0);
    assert_eq!(graph.kind(phi), Some(&NodeKind::Phi { block: merge }));
    for value in &graph.node(phi).unwrap().inputs {
        assert!(is_materialize(graph.kind(*value).unwrap()));
    }
}

#[test]
fn test_phi_of_distinct_objects_materializes_both() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.build_if(cond, left, right).unwrap();

    b.switch_to_block(left);
    let first = b.build_new_instance(point).unwrap();
    b.build_goto(merge).unwrap();
    b.switch_to_block(right);
    let second = b.build_new_instance(point).unwrap();
    b.build_goto(merge).unwrap();

    b.switch_to_block(merge);
    let phi = b.build_phi(merge, ValueKind::Object, &[first, second]).unwrap();
    b.build_invoke("consume", &[phi], ValueKind::Void).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.allocations_virtualized, 2);
    assert_eq!(report.stats.materializations, 2);
    let inputs = &graph.node(phi).unwrap().inputs;
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0], scheduled(&graph, left, is_materialize)[0]);
    assert_eq!(inputs[1], scheduled(&graph, right, is_materialize)[0]);
}

#[test]
fn test_field_phis_of_object_turned_real_are_dropped() {
    let mut b = GraphBuilder::new();
    let (point, x, _) = point_class(&mut b);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let one = b.build_int(1);
    let two = b.build_int(2);
    let first = b.build_new_instance(point).unwrap();
    let second = b.build_new_instance(point).unwrap();
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.build_if(cond, left, right).unwrap();

    b.switch_to_block(left);
    b.build_store_field(first, x, one).unwrap();
    b.build_goto(merge).unwrap();
    b.switch_to_block(right);
    b.build_store_field(first, x, two).unwrap();
    b.build_goto(merge).unwrap();

    // The phi forces `first` to be real on the left path after its field x
    // was already merged into a phi.
    b.switch_to_block(merge);
    let phi = b.build_phi(merge, ValueKind::Object, &[first, second]).unwrap();
    b.build_invoke("consume", &[phi], ValueKind::Void).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 4);
    // One object phi per allocation, no phi for the abandoned field merge.
    assert_eq!(report.stats.phis_created, 2);
    let int_phis = graph
        .block(merge)
        .unwrap()
        .phis
        .iter()
        .filter(|p| graph.node(**p).unwrap().stamp == ValueKind::Int)
        .count();
    assert_eq!(int_phis, 0);

    let inputs = &graph.node(phi).unwrap().inputs;
    let left_real = scheduled(&graph, left, is_materialize);
    let right_real = scheduled(&graph, right, is_materialize);
    assert_eq!(left_real.len(), 2);
    assert_eq!(right_real.len(), 2);
    assert!(left_real.contains(&inputs[0]));
    assert!(right_real.contains(&inputs[1]));
}

#[test]
fn test_same_object_stored_through_alias_merges_without_phi() {
    let mut b = GraphBuilder::new();
    let holder = b.add_class("Holder", None, &[("item", ValueKind::Object)]);
    let item = b.field(holder, "item").unwrap();
    let (point, x, _) = point_class(&mut b);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let seven = b.build_int(7);
    let inner = b.build_new_instance_with(point, &[seven, seven]).unwrap();
    let outer = b.build_new_instance(holder).unwrap();
    let narrowed = b.build_pi(inner).unwrap();
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.build_if(cond, left, right).unwrap();

    b.switch_to_block(left);
    b.build_store_field(outer, item, inner).unwrap();
    b.build_goto(merge).unwrap();
    b.switch_to_block(right);
    b.build_store_field(outer, item, narrowed).unwrap();
    b.build_goto(merge).unwrap();

    b.switch_to_block(merge);
    let loaded = b.build_load_field(outer, item).unwrap();
    let value = b.build_load_field(loaded, x).unwrap();
    let ret = b.build_return(Some(value)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.allocations_virtualized, 2);
    assert_eq!(report.stats.materializations, 0);
    assert_eq!(report.stats.phis_created, 0);
    assert_eq!(input(&graph, ret, 0), seven);
    assert!(!graph.contains(narrowed));
}

#[test]
fn test_materialization_cycle_is_closed_with_patch() {
    let mut b = GraphBuilder::new();
    let node_class = b.add_class("Node", None, &[("next", ValueKind::Object)]);
    let next = b.field(node_class, "next").unwrap();
    let a = b.build_new_instance(node_class).unwrap();
    let c = b.build_new_instance(node_class).unwrap();
    b.build_store_field(a, next, c).unwrap();
    b.build_store_field(c, next, a).unwrap();
    let call = b.build_invoke("publish", &[a], ValueKind::Void).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 2);
    assert_eq!(report.stats.patched_fields, 1);

    let entry = graph.entry();
    let materialized = scheduled(&graph, entry, is_materialize);
    let patches = scheduled(&graph, entry, |k| matches!(k, NodeKind::PatchField { .. }));
    assert_eq!(materialized.len(), 2);
    assert_eq!(patches.len(), 1);

    let published = input(&graph, call, 0);
    assert!(materialized.contains(&published));
    let other = *materialized.iter().find(|m| **m != published).unwrap();
    // a.next holds the other object directly, the back reference is patched.
    assert_eq!(input(&graph, published, 0), other);
    assert_eq!(graph.node(patches[0]).unwrap().inputs.as_slice(), &[other, published]);
}

#[test]
fn test_checks_on_virtual_objects_fold() {
    let mut b = GraphBuilder::new();
    let (point, x, _) = point_class(&mut b);
    let nine = b.build_int(9);
    let a = b.build_new_instance_with(point, &[nine, nine]).unwrap();
    let other = b.build_new_instance(point).unwrap();
    let cast = b.build_check_cast(a, TypeRef::Class(point)).unwrap();
    let load = b.build_load_field(cast, x).unwrap();
    let is_null = b.build_is_null(a).unwrap();
    let same = b.build_object_equals(a, cast).unwrap();
    let different = b.build_object_equals(a, other).unwrap();
    let hub = b.build_load_hub(a).unwrap();
    let call = b
        .build_invoke("observe", &[load, is_null, same, different, hub], ValueKind::Void)
        .unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 0);
    let args: Vec<Option<Constant>> = graph
        .node(call)
        .unwrap()
        .inputs
        .iter()
        .map(|v| graph.as_constant(*v))
        .collect();
    assert_eq!(
        args,
        vec![
            Some(Constant::Int(9)),
            Some(Constant::Bool(false)),
            Some(Constant::Bool(true)),
            Some(Constant::Bool(false)),
            Some(Constant::Type(TypeRef::Class(point))),
        ]
    );
    assert_eq!(graph.block(graph.entry()).unwrap().nodes.len(), 3);
}

#[test]
fn test_failing_type_check_materializes() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let shape = b.add_class("Shape", None, &[]);
    let a = b.build_new_instance(point).unwrap();
    let cast = b.build_check_cast(a, TypeRef::Class(shape)).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 1);
    let materialized = input(&graph, cast, 0);
    assert!(is_materialize(graph.kind(materialized).unwrap()));
}

#[test]
fn test_array_elements_are_scalar_replaced() {
    let mut b = GraphBuilder::new();
    let value = b.build_parameter(0, ValueKind::Int);
    let index = b.build_int(1);
    let array = b.build_new_array(ValueKind::Int, 3).unwrap();
    b.build_store_indexed(array, index, value, ValueKind::Int).unwrap();
    let load = b.build_load_indexed(array, index, ValueKind::Int).unwrap();
    let length = b.build_array_length(array).unwrap();
    let sum = b.build_arithmetic(ArithmeticOp::Add, load, length).unwrap();
    b.build_return(Some(sum)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 0);
    assert!(!graph.contains(array));
    let inputs = &graph.node(sum).unwrap().inputs;
    assert_eq!(inputs[0], value);
    assert_eq!(graph.as_constant(inputs[1]), Some(Constant::Int(3)));
}

#[test]
fn test_unknown_array_index_materializes() {
    let mut b = GraphBuilder::new();
    let index = b.build_parameter(0, ValueKind::Int);
    let array = b.build_new_array(ValueKind::Int, 4).unwrap();
    let load = b.build_load_indexed(array, index, ValueKind::Int).unwrap();
    b.build_return(Some(load)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 1);
    let materialized = input(&graph, load, 0);
    assert_eq!(
        graph.kind(materialized),
        Some(&NodeKind::Materialize {
            object: pea_compiler::ir::VirtualObjectId::new(0),
            ty: TypeRef::Array(ValueKind::Int),
            lock_count: 0,
        })
    );
    assert_eq!(graph.node(materialized).unwrap().inputs.len(), 4);
}

#[test]
fn test_oversized_array_is_not_virtualized() {
    let mut b = GraphBuilder::new();
    let array = b.build_new_array(ValueKind::Int, 1000).unwrap();
    let length = b.build_array_length(array).unwrap();
    b.build_return(Some(length)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert!(report.is_empty());
    assert!(graph.contains(array));
    assert!(graph.contains(length));
}

#[test]
fn test_balanced_monitors_are_eliminated() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let a = b.build_new_instance(point).unwrap();
    b.build_monitor_enter(a).unwrap();
    b.build_monitor_exit(a).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.monitors_removed, 2);
    assert!(all_scheduled(&graph, |k| matches!(k, NodeKind::MonitorEnter | NodeKind::MonitorExit)).is_empty());
}

#[test]
fn test_materialized_object_keeps_lock_count() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let a = b.build_new_instance(point).unwrap();
    b.build_monitor_enter(a).unwrap();
    let call = b.build_invoke("publish", &[a], ValueKind::Void).unwrap();
    let exit = b.build_monitor_exit(a).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    run(&mut graph);

    let materialized = input(&graph, call, 0);
    match graph.kind(materialized) {
        Some(NodeKind::Materialize { lock_count, .. }) => assert_eq!(*lock_count, 1),
        other => panic!("expected a materialization, found {:?}", other),
    }
    // The exit now releases the real object.
    assert_eq!(input(&graph, exit, 0), materialized);
}

#[test]
fn test_finalizer_registration() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let resource = b.add_class("Resource", None, &[("fd", ValueKind::Int)]);
    b.set_has_finalizer(resource);
    let plain = b.build_new_instance(point).unwrap();
    let dropped = b.build_register_finalizer(plain).unwrap();
    let finalized = b.build_new_instance(resource).unwrap();
    let kept = b.build_register_finalizer(finalized).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert!(!graph.contains(dropped));
    assert!(graph.contains(kept));
    assert_eq!(report.stats.materializations, 1);
    assert!(is_materialize(graph.kind(input(&graph, kept, 0)).unwrap()));
}

#[test]
fn test_snapshot_describes_virtual_object() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let three = b.build_int(3);
    let four = b.build_int(4);
    let a = b.build_new_instance_with(point, &[three, four]).unwrap();
    let call = b.build_invoke("safepoint", &[], ValueKind::Void).unwrap();
    let state = b.build_frame_state(&[a]);
    b.attach_state(call, state).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 0);
    let frame = graph.node(state).unwrap();
    let stand_in = frame.inputs[0];
    assert!(matches!(graph.kind(stand_in), Some(NodeKind::VirtualObject { .. })));

    let NodeKind::FrameState { virtual_mappings, .. } = &frame.kind else {
        panic!("snapshot changed kind");
    };
    assert_eq!(virtual_mappings.len(), 1);
    let mapping = graph.node(virtual_mappings[0]).unwrap();
    assert_eq!(mapping.kind, NodeKind::VirtualObjectState { lock_count: 0 });
    assert_eq!(mapping.inputs.as_slice(), &[stand_in, three, four]);
}

#[test]
fn test_snapshot_describes_locked_object() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let a = b.build_new_instance(point).unwrap();
    b.build_monitor_enter(a).unwrap();
    let call = b.build_invoke("safepoint", &[], ValueKind::Void).unwrap();
    let state = b.build_frame_state(&[]);
    b.attach_state(call, state).unwrap();
    b.build_monitor_exit(a).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    run(&mut graph);

    let NodeKind::FrameState { virtual_mappings, .. } = &graph.node(state).unwrap().kind else {
        panic!("snapshot changed kind");
    };
    assert_eq!(virtual_mappings.len(), 1);
    assert_eq!(
        graph.kind(virtual_mappings[0]),
        Some(&NodeKind::VirtualObjectState { lock_count: 1 })
    );
}

#[test]
fn test_snapshot_after_materialization_refers_to_real_object() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let a = b.build_new_instance(point).unwrap();
    let call = b.build_invoke("publish", &[a], ValueKind::Void).unwrap();
    let state = b.build_frame_state(&[a]);
    b.attach_state(call, state).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    run(&mut graph);

    let materialized = input(&graph, call, 0);
    let frame = graph.node(state).unwrap();
    let NodeKind::FrameState { virtual_mappings, .. } = &frame.kind else {
        panic!("snapshot changed kind");
    };
    assert_eq!(virtual_mappings.len(), 1);
    let mapping = graph.node(virtual_mappings[0]).unwrap();
    assert_eq!(mapping.kind, NodeKind::MaterializedObjectState);
    assert_eq!(mapping.inputs.as_slice(), &[frame.inputs[0], materialized]);
}

#[test]
fn test_unclassified_user_sets_flag() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let a = b.build_new_instance(point).unwrap();
    let opaque = b.build_opaque("intrinsic", &[a], ValueKind::Int).unwrap();
    b.build_return(Some(opaque)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert!(report.unclassified_usage);
    assert_eq!(report.stats.materializations, 1);
    assert!(is_materialize(graph.kind(input(&graph, opaque, 0)).unwrap()));
}

#[test]
fn test_known_escapes_do_not_set_flag() {
    let mut b = GraphBuilder::new();
    let (point, _, _) = point_class(&mut b);
    let offset = b.build_int(8);
    let a = b.build_new_instance(point).unwrap();
    b.build_unsafe_load(a, offset, ValueKind::Int).unwrap();
    b.build_return(Some(a)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert!(!report.unclassified_usage);
    assert_eq!(report.stats.materializations, 1);
}

#[test]
fn test_store_into_real_object_materializes_value() {
    let mut b = GraphBuilder::new();
    let holder = b.add_class("Holder", None, &[("item", ValueKind::Object)]);
    let item = b.field(holder, "item").unwrap();
    let (point, _, _) = point_class(&mut b);
    let target = b.build_parameter(0, ValueKind::Object);
    let a = b.build_new_instance(point).unwrap();
    let store = b.build_store_field(target, item, a).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 1);
    assert_eq!(input(&graph, store, 0), target);
    assert!(is_materialize(graph.kind(input(&graph, store, 1)).unwrap()));
}

#[test]
fn test_nested_object_stays_virtual() {
    let mut b = GraphBuilder::new();
    let holder = b.add_class("Holder", None, &[("item", ValueKind::Object)]);
    let item = b.field(holder, "item").unwrap();
    let (point, x, _) = point_class(&mut b);
    let five = b.build_int(5);
    let inner = b.build_new_instance_with(point, &[five, five]).unwrap();
    let outer = b.build_new_instance(holder).unwrap();
    b.build_store_field(outer, item, inner).unwrap();
    let loaded = b.build_load_field(outer, item).unwrap();
    let value = b.build_load_field(loaded, x).unwrap();
    let ret = b.build_return(Some(value)).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.allocations_virtualized, 2);
    assert_eq!(report.stats.materializations, 0);
    assert_eq!(input(&graph, ret, 0), five);
}

#[test]
fn test_escaping_outer_object_materializes_inner() {
    let mut b = GraphBuilder::new();
    let holder = b.add_class("Holder", None, &[("item", ValueKind::Object)]);
    let (point, _, _) = point_class(&mut b);
    let inner = b.build_new_instance(point).unwrap();
    let outer = b.build_new_instance_with(holder, &[inner]).unwrap();
    let call = b.build_invoke("publish", &[outer], ValueKind::Void).unwrap();
    b.build_return(None).unwrap();
    let mut graph = b.finish();

    let report = run(&mut graph);

    assert_eq!(report.stats.materializations, 2);
    assert_eq!(report.stats.patched_fields, 0);
    let outer_real = input(&graph, call, 0);
    let inner_real = input(&graph, outer_real, 0);
    assert!(is_materialize(graph.kind(inner_real).unwrap()));

    // The inner object is allocated first.
    let nodes = &graph.block(graph.entry()).unwrap().nodes;
    let inner_at = nodes.iter().position(|n| *n == inner_real).unwrap();
    let outer_at = nodes.iter().position(|n| *n == outer_real).unwrap();
    assert!(inner_at < outer_at);
}

/// Allocation as seen by its consumers: type and field values, recursively.
#[derive(Debug, PartialEq)]
enum Shape {
    Object(TypeRef, Vec<Shape>),
    Value(Option<Constant>),
}

fn shape(graph: &Graph, node: NodeId) -> Shape {
    let ty = match graph.kind(node) {
        Some(NodeKind::NewInstance { class }) => Some(TypeRef::Class(*class)),
        Some(NodeKind::NewArray { component, .. }) => Some(TypeRef::Array(*component)),
        Some(NodeKind::Materialize { ty, .. }) => Some(*ty),
        _ => None,
    };
    match ty {
        Some(ty) => Shape::Object(
            ty,
            graph.node(node).unwrap().inputs.iter().map(|v| shape(graph, *v)).collect(),
        ),
        None => Shape::Value(graph.as_constant(node)),
    }
}

/// Every allocation escapes at its first use.
fn escaping_at_first_use() -> (Graph, [NodeId; 4]) {
    let mut b = GraphBuilder::new();
    let (point, x, _) = point_class(&mut b);
    let one = b.build_int(1);
    let two = b.build_int(2);
    let nine = b.build_int(9);
    let p = b.build_new_instance_with(point, &[one, two]).unwrap();
    let publish = b.build_invoke("publish", &[p], ValueKind::Void).unwrap();
    let store = b.build_store_field(p, x, nine).unwrap();
    let array = b.build_new_array(ValueKind::Int, 3).unwrap();
    let fill = b.build_invoke("fill", &[array], ValueKind::Void).unwrap();
    let ret = b.build_return(Some(p)).unwrap();
    (b.finish(), [publish, store, fill, ret])
}

#[test]
fn test_forced_materialization_matches_unoptimized_graph() {
    logging::init_test();
    let (mut optimized, [publish, store, fill, ret]) = escaping_at_first_use();
    let (mut plain, _) = escaping_at_first_use();

    let report = run(&mut optimized);
    let disabled = EscapeAnalysisConfig {
        enabled: false,
        ..EscapeAnalysisConfig::default()
    };
    let untouched = PartialEscapePhase::new(disabled).run(&mut plain).unwrap();

    assert!(untouched.is_empty());
    assert_eq!(report.stats.allocations_virtualized, 2);
    assert_eq!(report.stats.materializations, 2);
    for (user, index) in [(publish, 0), (store, 0), (fill, 0), (ret, 0)] {
        assert_eq!(
            shape(&optimized, input(&optimized, user, index)),
            shape(&plain, input(&plain, user, index)),
            "operand {} of {}",
            index,
            user
        );
    }

    // Identity is kept: every use sees the same real object.
    let real = input(&optimized, publish, 0);
    assert!(is_materialize(optimized.kind(real).unwrap()));
    assert_eq!(input(&optimized, store, 0), real);
    assert_eq!(input(&optimized, ret, 0), real);
    assert_eq!(input(&plain, store, 0), input(&plain, ret, 0));

    // Each allocation happens right before the node it escapes to.
    let nodes = &optimized.block(optimized.entry()).unwrap().nodes;
    let at = |n: NodeId| nodes.iter().position(|m| *m == n).unwrap();
    assert_eq!(at(real) + 1, at(publish));
    assert_eq!(at(input(&optimized, fill, 0)) + 1, at(fill));
}

//! Sample graphs for trying the analysis from the command line

use pea_compiler::ir::{ArithmeticOp, Graph, GraphBuilder, ValueKind};

pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Option<Graph>,
}

impl Sample {
    pub fn build(&self) -> Result<Graph, String> {
        (self.build)().ok_or_else(|| format!("Failed to build sample '{}'", self.name))
    }
}

pub const SAMPLES: &[Sample] = &[
    Sample {
        name: "point-merge",
        description: "Field stored on both sides of a branch, read after the merge",
        build: point_merge,
    },
    Sample {
        name: "branch-escape",
        description: "Object published on one branch and read on the other",
        build: branch_escape,
    },
    Sample {
        name: "counter-loop",
        description: "Field incremented in a loop and read after it",
        build: counter_loop,
    },
    Sample {
        name: "loop-escape",
        description: "Object published inside a loop",
        build: loop_escape,
    },
    Sample {
        name: "cycle",
        description: "Two objects referring to each other, then published",
        build: cycle,
    },
    Sample {
        name: "locked",
        description: "Monitor held on a virtual object across a safepoint",
        build: locked,
    },
];

pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|s| s.name == name)
}

fn point_merge() -> Option<Graph> {
    let mut b = GraphBuilder::new();
    let point = b.add_class("Point", None, &[("x", ValueKind::Int), ("y", ValueKind::Int)]);
    let x = b.field(point, "x")?;
    let cond = b.build_parameter(0, ValueKind::Bool);
    let one = b.build_int(1);
    let two = b.build_int(2);
    let alloc = b.build_new_instance(point)?;
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    b.build_if(cond, left, right)?;

    b.switch_to_block(left);
    b.build_store_field(alloc, x, one)?;
    b.build_goto(merge)?;
    b.switch_to_block(right);
    b.build_store_field(alloc, x, two)?;
    b.build_goto(merge)?;

    b.switch_to_block(merge);
    let load = b.build_load_field(alloc, x)?;
    b.build_return(Some(load))?;
    Some(b.finish())
}

fn branch_escape() -> Option<Graph> {
    let mut b = GraphBuilder::new();
    let point = b.add_class("Point", None, &[("x", ValueKind::Int), ("y", ValueKind::Int)]);
    let x = b.field(point, "x")?;
    let cond = b.build_parameter(0, ValueKind::Bool);
    let alloc = b.build_new_instance(point)?;
    let escapes = b.create_block("escapes");
    let stays = b.create_block("stays");
    b.build_if(cond, escapes, stays)?;

    b.switch_to_block(escapes);
    b.build_invoke("publish", &[alloc], ValueKind::Void)?;
    b.build_return(None)?;
    b.switch_to_block(stays);
    let load = b.build_load_field(alloc, x)?;
    b.build_return(Some(load))?;
    Some(b.finish())
}

fn counter_loop() -> Option<Graph> {
    let mut b = GraphBuilder::new();
    let counter = b.add_class("Counter", None, &[("count", ValueKind::Int)]);
    let count = b.field(counter, "count")?;
    let cond = b.build_parameter(0, ValueKind::Bool);
    let one = b.build_int(1);
    let alloc = b.build_new_instance(counter)?;
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    b.build_goto(header)?;
    b.switch_to_block(header);
    b.build_if(cond, body, exit)?;

    b.switch_to_block(body);
    let current = b.build_load_field(alloc, count)?;
    let next = b.build_arithmetic(ArithmeticOp::Add, current, one)?;
    b.build_store_field(alloc, count, next)?;
    b.build_goto(header)?;

    b.switch_to_block(exit);
    let result = b.build_load_field(alloc, count)?;
    b.build_return(Some(result))?;
    Some(b.finish())
}

fn loop_escape() -> Option<Graph> {
    let mut b = GraphBuilder::new();
    let point = b.add_class("Point", None, &[("x", ValueKind::Int)]);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let alloc = b.build_new_instance(point)?;
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    b.build_goto(header)?;
    b.switch_to_block(header);
    b.build_if(cond, body, exit)?;

    b.switch_to_block(body);
    b.build_invoke("publish", &[alloc], ValueKind::Void)?;
    b.build_goto(header)?;
    b.switch_to_block(exit);
    b.build_return(None)?;
    Some(b.finish())
}

fn cycle() -> Option<Graph> {
    let mut b = GraphBuilder::new();
    let node = b.add_class("Node", None, &[("next", ValueKind::Object)]);
    let next = b.field(node, "next")?;
    let first = b.build_new_instance(node)?;
    let second = b.build_new_instance(node)?;
    b.build_store_field(first, next, second)?;
    b.build_store_field(second, next, first)?;
    b.build_invoke("publish", &[first], ValueKind::Void)?;
    b.build_return(None)?;
    Some(b.finish())
}

fn locked() -> Option<Graph> {
    let mut b = GraphBuilder::new();
    let point = b.add_class("Point", None, &[("x", ValueKind::Int)]);
    let alloc = b.build_new_instance(point)?;
    b.build_monitor_enter(alloc)?;
    let call = b.build_invoke("safepoint", &[], ValueKind::Void)?;
    let state = b.build_frame_state(&[alloc]);
    b.attach_state(call, state)?;
    b.build_monitor_exit(alloc)?;
    b.build_return(None)?;
    Some(b.finish())
}

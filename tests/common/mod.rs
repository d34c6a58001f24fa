//! Module builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;

use imgshard::image::threads::HostResources;
use imgshard::ir::{
    Block, Constant, Function, FunctionType, Instruction, Module, Opcode, Operand, Type, ValueId,
    Variable,
};

pub const TRIPLE: &str = "x86_64-unknown-linux-gnu";

pub fn module(name: &str) -> Module {
    Module::new(name, TRIPLE)
}

/// A host with plenty of threads and unknown memory.
pub fn host() -> HostResources {
    HostResources {
        hardware_threads: 8,
        available_memory: None,
    }
}

fn finish(mut function: Function, mut insts: Vec<Instruction>) -> Function {
    insts.push(Instruction::ret(None));
    function.blocks.push(Block {
        name: "entry".into(),
        insts,
    });
    function
}

fn calls(callees: &[ValueId]) -> Vec<Instruction> {
    callees
        .iter()
        .map(|callee| Instruction::call(Operand::global(*callee), FunctionType::void(), Vec::new()))
        .collect()
}

/// `void name() { ret }`.
pub fn leaf(module: &mut Module, name: &str) -> ValueId {
    caller(module, name, &[])
}

/// `void name() { call callees...; ret }`.
pub fn caller(module: &mut Module, name: &str, callees: &[ValueId]) -> ValueId {
    let function = finish(Function::declaration(FunctionType::void()), calls(callees));
    module.add_function(name, function).expect("add function")
}

/// A function that works on a `<4 x float>` value and calls `callees`.
pub fn vector_user(module: &mut Module, name: &str, callees: &[ValueId]) -> ValueId {
    let mut function = Function::declaration(FunctionType::void());
    let local = function.fresh_local();
    let mut insts = vec![
        Instruction::new(Opcode::Alloca, Type::vector(Type::Float, 4), Vec::new())
            .with_result(local),
    ];
    insts.extend(calls(callees));
    let function = finish(function, insts);
    module.add_function(name, function).expect("add vector function")
}

/// A function padded with `extra` loads so its weight is predictable.
pub fn heavy(module: &mut Module, name: &str, extra: usize) -> ValueId {
    let mut function = Function::declaration(FunctionType::void());
    let mut insts = Vec::with_capacity(extra);
    for _ in 0..extra {
        let local = function.fresh_local();
        insts.push(
            Instruction::new(Opcode::Alloca, Type::i32(), Vec::new()).with_result(local),
        );
    }
    let function = finish(function, insts);
    module.add_function(name, function).expect("add heavy function")
}

pub fn declare(module: &mut Module, name: &str) -> ValueId {
    module
        .add_function(name, Function::declaration(FunctionType::void()))
        .expect("add declaration")
}

/// `ptr name[] = { entries... }`.
pub fn pointer_table(module: &mut Module, name: &str, entries: &[ValueId]) -> ValueId {
    let init = Constant::ptr_array(entries.iter().map(|id| Constant::global(*id)).collect());
    let ty = Type::array(Type::Ptr, entries.len() as u64);
    module
        .add_variable(name, Variable::new(ty, init))
        .expect("add table")
}

pub fn counter(module: &mut Module, name: &str) -> ValueId {
    module
        .add_variable(name, Variable::new(Type::i64(), Constant::i64(0)))
        .expect("add counter")
}

/// Export every defined function and variable in arena order.
pub fn export_all(module: &mut Module) {
    let mut functions = Vec::new();
    let mut globals = Vec::new();
    for (id, value) in module.iter() {
        if value.is_declaration() {
            continue;
        }
        if value.as_function().is_some() {
            functions.push(id);
        } else if value.as_variable().is_some() {
            globals.push(id);
        }
    }
    module.exports.functions = functions;
    module.exports.globals = globals;
    module.exports.function_idxs.clear();
    module.exports.global_idxs.clear();
    module.exports.normalize();
}

pub fn defined(module: &Module) -> BTreeSet<String> {
    module
        .iter()
        .filter(|(_, value)| !value.is_declaration())
        .map(|(_, value)| value.name.clone())
        .collect()
}

pub fn write_module(dir: &Path, name: &str, module: &Module) -> std::path::PathBuf {
    let path = dir.join(name);
    let bytes = imgshard::ir::serialize(module).expect("serialize");
    std::fs::write(&path, bytes).expect("write module");
    path
}

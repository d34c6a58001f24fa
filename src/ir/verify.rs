//! Module self-consistency checks run before and after optimization.

use std::collections::BTreeSet;

use super::{Constant, GlobalKind, LocalId, Module, Opcode, Operand};
use crate::error::{Error, Result};

/// Verify `module`, reporting every problem found in one error.
pub fn verify_module(module: &Module) -> Result<()> {
    let problems = collect_problems(module);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::invariant(format!(
            "module '{}' failed verification:\n  {}",
            module.name,
            problems.join("\n  ")
        )))
    }
}

#[must_use]
pub fn collect_problems(module: &Module) -> Vec<String> {
    let mut problems = Vec::new();
    for (id, value) in module.iter() {
        match module.lookup(&value.name) {
            Some(found) if found == id => {}
            _ => problems.push(format!("'{}' is missing from the symbol index", value.name)),
        }
        match &value.kind {
            GlobalKind::Variable(variable) => {
                if let Some(init) = &variable.initializer {
                    check_refs(module, &mut problems, "initializer", &value.name, init);
                }
            }
            GlobalKind::Alias(alias) => {
                check_refs(module, &mut problems, "aliasee", &value.name, &alias.aliasee);
                if alias.aliasee.referenced_globals().is_empty() {
                    problems.push(format!("alias '{}' has no aliasee", value.name));
                }
            }
            GlobalKind::Function(function) => {
                let mut defined: BTreeSet<LocalId> = BTreeSet::new();
                for inst in function.instructions() {
                    if let Some(result) = inst.result {
                        if !defined.insert(result) {
                            problems.push(format!(
                                "'{}' defines %{} twice",
                                value.name, result.0
                            ));
                        }
                    }
                }
                for block in &function.blocks {
                    match block.insts.last() {
                        Some(last) if last.opcode.is_terminator() => {}
                        _ => problems.push(format!(
                            "block '{}' in '{}' does not end in a terminator",
                            block.name, value.name
                        )),
                    }
                    let early = block
                        .insts
                        .iter()
                        .rev()
                        .skip(1)
                        .any(|inst| inst.opcode.is_terminator());
                    if early {
                        problems.push(format!(
                            "block '{}' in '{}' has a terminator before its end",
                            block.name, value.name
                        ));
                    }
                    for inst in &block.insts {
                        for operand in &inst.operands {
                            match operand {
                                Operand::Local(local) if !defined.contains(local) => {
                                    problems.push(format!(
                                        "'{}' uses undefined %{}",
                                        value.name, local.0
                                    ));
                                }
                                Operand::Arg(index)
                                    if *index as usize >= function.ty.params.len() =>
                                {
                                    problems.push(format!(
                                        "'{}' uses missing argument {index}",
                                        value.name
                                    ));
                                }
                                Operand::Block(index) if *index >= function.blocks.len() => {
                                    problems.push(format!(
                                        "'{}' branches to missing block {index}",
                                        value.name
                                    ));
                                }
                                Operand::Const(constant) => {
                                    check_refs(
                                        module,
                                        &mut problems,
                                        "instruction operand",
                                        &value.name,
                                        constant,
                                    );
                                }
                                _ => {}
                            }
                        }
                        if let Opcode::Call { fn_ty } = &inst.opcode {
                            let args = inst.operands.len().saturating_sub(1);
                            let arity_ok = if fn_ty.variadic {
                                args >= fn_ty.params.len()
                            } else {
                                args == fn_ty.params.len()
                            };
                            if !arity_ok {
                                problems.push(format!(
                                    "call in '{}' passes {args} arguments to a {} signature",
                                    value.name, fn_ty
                                ));
                            }
                            if let Some(callee) = inst.direct_callee() {
                                if let Some(target) = module.get(callee).and_then(|v| v.as_function()) {
                                    if target.ty.params.len() != fn_ty.params.len() {
                                        problems.push(format!(
                                            "call in '{}' does not match the type of '{}'",
                                            value.name,
                                            module.name_of(callee)
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    let exports = &module.exports;
    for id in exports.functions.iter().chain(exports.globals.iter()) {
        match module.get(*id) {
            None => problems.push(format!("export list references erased value {id}")),
            Some(value) if value.is_declaration() => {
                problems.push(format!("exported '{}' is not defined here", value.name));
            }
            Some(_) => {}
        }
    }
    if exports.function_idxs.len() != exports.functions.len()
        || exports.global_idxs.len() != exports.globals.len()
    {
        problems.push("export index lists do not match export lists".to_string());
    }
    problems
}

fn check_refs(
    module: &Module,
    problems: &mut Vec<String>,
    context: &str,
    owner: &str,
    constant: &Constant,
) {
    for target in constant.referenced_globals() {
        if !module.contains(target) {
            problems.push(format!(
                "{context} of '{owner}' references erased value {target}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Function, FunctionType, Instruction, Type, Variable};

    #[test]
    fn accepts_well_formed_module() {
        let mut module = Module::new("ok", "x86_64-unknown-linux-gnu");
        let mut function = Function::declaration(FunctionType::new(Type::i64(), vec![Type::i64()]));
        function.blocks.push(Block {
            name: "top".into(),
            insts: vec![Instruction::ret(Some(Operand::Arg(0)))],
        });
        module.add_function("id", function).expect("id");
        verify_module(&module).expect("valid");
    }

    #[test]
    fn reports_dangling_references_and_missing_terminators() {
        let mut module = Module::new("bad", "x86_64-unknown-linux-gnu");
        let gone = module
            .add_function("gone", Function::declaration(FunctionType::void()))
            .expect("gone");
        module
            .add_variable("holder", Variable::new(Type::Ptr, Constant::global(gone)))
            .expect("holder");
        let mut function = Function::declaration(FunctionType::void());
        function.blocks.push(Block::new("top"));
        module.add_function("open", function).expect("open");
        module.erase(gone);

        let problems = collect_problems(&module);
        assert_eq!(problems.len(), 2, "{problems:?}");
        let err = verify_module(&module).expect_err("invalid");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("references erased value"));
    }
}

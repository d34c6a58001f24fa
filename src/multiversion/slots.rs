//! Relocation slots and the rewrites that read through them.

use crate::error::{Error, Result};
use crate::ir::uses::walk_constant;
use crate::ir::{
    AggregateKind, AliasValue, Block, Constant, Function, GlobalKind, GlobalValue, Instruction,
    Module, Opcode, Operand, Type, ValueId,
};

use super::{ATTR_CLONES, ATTR_FVAR, ATTR_RELOC};

#[must_use]
pub fn slot_name(function: &str) -> String {
    format!("{function}.reloc_slot")
}

fn slot_load(function: &mut Function, slot: ValueId) -> (Instruction, Operand) {
    let loaded = function.fresh_local();
    let mut load = Instruction::new(Opcode::Load, Type::Ptr, vec![Operand::global(slot)])
        .with_result(loaded);
    load.metadata.insert("invariant.load".into(), String::new());
    load.metadata.insert("tbaa".into(), "const".into());
    (load, Operand::Local(loaded))
}

/// Replace the alias `alias` of `target` with a function of the same name
/// that tail-calls through `slot`.
pub fn rewrite_alias(
    module: &mut Module,
    alias: ValueId,
    target: ValueId,
    slot: ValueId,
) -> Result<ValueId> {
    let attrs = module
        .function(target)?
        .attrs
        .iter()
        .filter(|(key, _)| ![ATTR_CLONES, ATTR_RELOC, ATTR_FVAR].contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let removed = module
        .erase(alias)
        .ok_or_else(|| Error::invariant(format!("alias {alias} vanished before rewriting")))?;
    let GlobalKind::Alias(alias_value) = &removed.kind else {
        return Err(Error::invariant(format!("'{}' is not an alias", removed.name)));
    };
    let AliasValue::Function(fn_ty) = &alias_value.value else {
        return Err(Error::invariant(format!(
            "data alias '{}' names a multiversioned function",
            removed.name
        )));
    };

    let mut trampoline = Function::declaration(fn_ty.clone());
    trampoline.attrs = attrs;
    let (load, callee) = slot_load(&mut trampoline, slot);
    let args = (0..fn_ty.params.len() as u32).map(Operand::Arg).collect();
    let mut call = Instruction::call(callee, fn_ty.clone(), args);
    call.tail = true;
    if fn_ty.variadic {
        call.metadata.insert("musttail".into(), String::new());
    }
    let ret = if fn_ty.ret.is_void() {
        Instruction::ret(None)
    } else {
        let result = trampoline.fresh_local();
        call.result = Some(result);
        Instruction::ret(Some(Operand::Local(result)))
    };
    trampoline.blocks.push(Block {
        name: "top".into(),
        insts: vec![load, call, ret],
    });

    let replacement = module.add(GlobalValue {
        name: removed.name.clone(),
        linkage: removed.linkage,
        visibility: removed.visibility,
        dso_local: removed.dso_local,
        dll_export: removed.dll_export,
        kind: GlobalKind::Function(trampoline),
    })?;
    module.replace_all_uses(alias, replacement);
    Ok(replacement)
}

struct UseSite {
    block: usize,
    inst: usize,
    operand: usize,
    path: Vec<usize>,
}

fn first_use(function: &Function, target: ValueId) -> Option<UseSite> {
    for (block_index, block) in function.blocks.iter().enumerate() {
        for (inst_index, inst) in block.insts.iter().enumerate() {
            for (operand_index, operand) in inst.operands.iter().enumerate() {
                let Operand::Const(constant) = operand else {
                    continue;
                };
                let mut found = None;
                walk_constant(constant, |id, path, _, _| {
                    if id == target && found.is_none() {
                        found = Some(path.to_vec());
                    }
                });
                if let Some(path) = found {
                    return Some(UseSite {
                        block: block_index,
                        inst: inst_index,
                        operand: operand_index,
                        path,
                    });
                }
            }
        }
    }
    None
}

/// Rewrite every reference to `target` inside `function_id` into a load of
/// `slot`, returning how many references were replaced.
pub fn replace_uses_with_load(
    module: &mut Module,
    function_id: ValueId,
    target: ValueId,
    slot: ValueId,
) -> Result<usize> {
    let function = module.function_mut(function_id)?;
    let mut replaced = 0;
    while let Some(site) = first_use(function, target) {
        materialize_use(function, &site, slot)?;
        replaced += 1;
    }
    Ok(replaced)
}

/// Load the slot and rebuild the constant path above the use as
/// instructions, then swap the operand for the rebuilt value.
fn materialize_use(function: &mut Function, site: &UseSite, slot: ValueId) -> Result<()> {
    let user = &function.blocks[site.block].insts[site.inst];
    let (insert_block, insert_at) = if matches!(user.opcode, Opcode::Phi) {
        let Some(Operand::Block(incoming)) = user.operands.get(site.operand + 1) else {
            return Err(Error::invariant("phi operand without incoming block"));
        };
        let terminator = function
            .blocks
            .get(*incoming)
            .and_then(|block| block.insts.len().checked_sub(1))
            .ok_or_else(|| Error::invariant("phi incoming block is empty"))?;
        (*incoming, terminator)
    } else {
        (site.block, site.inst)
    };
    let Some(Operand::Const(root)) = user.operands.get(site.operand).cloned() else {
        return Err(Error::invariant("use site is not a constant operand"));
    };

    let (load, mut value) = slot_load(function, slot);
    let mut chain = vec![load];
    for depth in (0..site.path.len()).rev() {
        let child = site.path[depth];
        let node = root
            .at_path(&site.path[..depth])
            .ok_or_else(|| Error::invariant("use path leaves its constant"))?;
        let inst = match node {
            Constant::Expr { op, ty, operands } => {
                let operands = operands
                    .iter()
                    .enumerate()
                    .map(|(index, operand)| {
                        if index == child {
                            value.clone()
                        } else {
                            Operand::Const(operand.clone())
                        }
                    })
                    .collect();
                Instruction::new(Opcode::Expr(*op), ty.clone(), operands)
            }
            Constant::Aggregate { kind, ty, elements } => {
                let mut elements = elements.clone();
                elements[child] = Constant::Undef(elements[child].ty());
                let base = Operand::Const(Constant::Aggregate {
                    kind: *kind,
                    ty: ty.clone(),
                    elements,
                });
                match kind {
                    AggregateKind::Vector => Instruction::new(
                        Opcode::InsertElement,
                        ty.clone(),
                        vec![base, value.clone(), Operand::Const(Constant::i64(child as i64))],
                    ),
                    AggregateKind::Array | AggregateKind::Struct => Instruction::new(
                        Opcode::InsertValue {
                            index: child as u32,
                        },
                        ty.clone(),
                        vec![base, value.clone()],
                    ),
                }
            }
            _ => return Err(Error::invariant("use path passes through a leaf constant")),
        };
        let result = function.fresh_local();
        chain.push(inst.with_result(result));
        value = Operand::Local(result);
    }

    let inserted = chain.len();
    let block = &mut function.blocks[insert_block];
    block.insts.splice(insert_at..insert_at, chain);
    let user_inst = if insert_block == site.block && insert_at <= site.inst {
        site.inst + inserted
    } else {
        site.inst
    };
    function.blocks[site.block].insts[user_inst].operands[site.operand] = value;
    Ok(())
}

//! Turning the shared module snapshot into one shard's private module.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::ir::uses::UseIndex;
use crate::ir::{
    deserialize, AliasValue, ExportTables, Function, GlobalKind, Linkage, Module, Variable,
    Visibility,
};
use crate::multiversion::FLAG_SUFFIX;
use crate::partition::Partition;

/// Give local definitions external linkage and hidden visibility so shards
/// can reference each other's copies.
pub fn promote_locals(module: &mut Module) -> usize {
    let mut promoted = 0;
    for id in module.ids() {
        let Some(value) = module.get_mut(id) else {
            continue;
        };
        if value.linkage.is_local() && !value.is_declaration() {
            value.linkage = Linkage::External;
            value.visibility = Visibility::Hidden;
            promoted += 1;
        }
    }
    promoted
}

/// Keep bodies and initializers only for values `partition` owns; everything
/// else becomes an external declaration with the same id.
pub fn materialize_preserved(module: &mut Module, partition: &Partition) -> Result<()> {
    for id in module.ids() {
        if partition.owns(id) {
            continue;
        }
        let value = module.value_mut(id)?;
        if value.is_declaration() {
            continue;
        }
        let replacement = match &mut value.kind {
            GlobalKind::Function(function) => {
                function.delete_body();
                None
            }
            GlobalKind::Variable(variable) => {
                variable.initializer = None;
                variable.constant = false;
                None
            }
            GlobalKind::Alias(alias) => Some(match &alias.value {
                AliasValue::Function(ty) => GlobalKind::Function(Function::declaration(ty.clone())),
                AliasValue::Data(ty) => GlobalKind::Variable(Variable::declaration(ty.clone())),
            }),
        };
        if let Some(kind) = replacement {
            value.kind = kind;
        }
        value.linkage = Linkage::External;
    }
    Ok(())
}

/// Export tables for the values this shard owns, in original index order.
#[must_use]
pub fn construct_vars(partition: &Partition) -> ExportTables {
    let mut fvars: Vec<_> = partition.fvars.iter().map(|(id, index)| (*index, *id)).collect();
    let mut gvars: Vec<_> = partition.gvars.iter().map(|(id, index)| (*index, *id)).collect();
    fvars.sort_unstable();
    gvars.sort_unstable();
    ExportTables {
        functions: fvars.iter().map(|(_, id)| *id).collect(),
        function_idxs: fvars.iter().map(|(index, _)| *index).collect(),
        globals: gvars.iter().map(|(_, id)| *id).collect(),
        global_idxs: gvars.iter().map(|(index, _)| *index).collect(),
    }
}

/// Erase declarations nothing references; survivors are plain external
/// references with default visibility.
pub fn drop_unused_declarations(module: &mut Module) -> usize {
    let uses = UseIndex::build(module);
    let referenced: BTreeSet<_> = uses.targets().collect();
    let mut dropped = 0;
    for id in module.ids() {
        if !module.is_declaration(id) {
            continue;
        }
        if referenced.contains(&id) {
            if let Some(value) = module.get_mut(id) {
                value.dso_local = false;
                value.visibility = Visibility::Default;
            }
        } else if module.erase(id).is_some() {
            dropped += 1;
        }
    }
    dropped
}

#[must_use]
pub fn shard_suffix(index: usize) -> String {
    format!("_{index}")
}

/// Decode the snapshot and cut it down to `partition`.
pub fn prepare_shard(snapshot: &[u8], partition: &Partition) -> Result<Module> {
    let mut module = deserialize(snapshot)?;
    for id in &partition.globals {
        if !module.contains(*id) {
            return Err(Error::invariant(format!(
                "partition {} owns {id}, which the snapshot lacks",
                partition.index
            )));
        }
    }
    materialize_preserved(&mut module, partition)?;
    module.exports = construct_vars(partition);
    module.name = format!("{}{}", module.name, shard_suffix(partition.index));
    module.set_flag(FLAG_SUFFIX, shard_suffix(partition.index));
    let dropped = drop_unused_declarations(&mut module);
    tracing::debug!(
        target: "image",
        stage = "materialize",
        shard = partition.index,
        owned = partition.globals.len(),
        dropped,
        "prepared shard module"
    );
    Ok(module)
}

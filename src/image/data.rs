//! The data module: image payload, header and the tables that point the
//! loader at every shard.

use std::str::FromStr;

use target_lexicon::{BinaryFormat, Triple};

use crate::error::Result;
use crate::ir::{Constant, GlobalKind, GlobalValue, Module, Type, ValueId, Variable, Visibility};
use crate::multiversion::metadata::{table_symbol, SHARD_TABLES};
use crate::target::{TargetFlags, TargetList};

use super::shard::shard_suffix;

pub const IMAGE_FORMAT_VERSION: u32 = 1;
pub const IMAGE_DATA_ALIGN: u64 = 64;

pub const IMAGE_DATA: &str = "image_data";
pub const IMAGE_SIZE: &str = "image_size";
pub const IMAGE_HEADER: &str = "image_header";
pub const SHARD_TABLE: &str = "shard_tables";
pub const DISPATCH_TARGET_IDS: &str = "dispatch_target_ids";
pub const IMAGE_POINTERS: &str = "image_pointers";

/// Everything the data module describes.
#[derive(Debug, Clone, Copy)]
pub struct DataLayout<'a> {
    pub triple: &'a str,
    pub threads: usize,
    pub nfvars: usize,
    pub ngvars: usize,
    pub has_veccall: bool,
    pub targets: &'a TargetList,
    pub image_data: &'a [u8],
}

/// `[u32 count, per target: u32 flags, cpu payload]`.
#[must_use]
pub fn dispatch_target_ids(targets: &TargetList, has_veccall: bool) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(targets.len() as u32).to_le_bytes());
    for spec in targets.iter() {
        let mut flags = spec.flags & TargetFlags::UNKNOWN_NAME;
        if has_veccall {
            flags |= TargetFlags::VEC_CALL;
        }
        bytes.extend_from_slice(&flags.bits().to_le_bytes());
        bytes.extend_from_slice(&spec.payload());
    }
    bytes
}

fn add_constant(module: &mut Module, name: &str, init: Constant, hidden: bool) -> Result<ValueId> {
    let value = GlobalValue::new(name, GlobalKind::Variable(Variable::constant(init)));
    module.add(if hidden { value.hidden() } else { value })
}

pub fn build_data_module(layout: &DataLayout<'_>) -> Result<Module> {
    let mut module = Module::new("data", layout.triple);

    let mut payload = Variable::constant(Constant::Bytes(layout.image_data.to_vec()));
    payload.align = Some(IMAGE_DATA_ALIGN);
    module.add(GlobalValue::new(IMAGE_DATA, GlobalKind::Variable(payload)))?;
    add_constant(&mut module, IMAGE_SIZE, Constant::i64(layout.image_data.len() as i64), false)?;

    let header = add_constant(
        &mut module,
        IMAGE_HEADER,
        Constant::u32_array(&[
            IMAGE_FORMAT_VERSION,
            layout.threads as u32,
            layout.nfvars as u32,
            layout.ngvars as u32,
        ]),
        true,
    )?;

    let mut entries = Vec::with_capacity(layout.threads * SHARD_TABLES.len());
    for shard in 0..layout.threads {
        let suffix = shard_suffix(shard);
        for table in SHARD_TABLES {
            let name = table_symbol(table, &suffix);
            let id = module.add(
                GlobalValue::new(name, GlobalKind::Variable(Variable::declaration(Type::i8())))
                    .hidden(),
            )?;
            entries.push(Constant::global(id));
        }
    }
    let shard_table = add_constant(&mut module, SHARD_TABLE, Constant::ptr_array(entries), true)?;

    let ids = add_constant(
        &mut module,
        DISPATCH_TARGET_IDS,
        Constant::Bytes(dispatch_target_ids(layout.targets, layout.has_veccall)),
        true,
    )?;

    add_constant(
        &mut module,
        IMAGE_POINTERS,
        Constant::ptr_array(vec![
            Constant::global(header),
            Constant::global(shard_table),
            Constant::global(ids),
        ]),
        false,
    )?;
    let exported = if is_coff(layout.triple) {
        mark_dll_exports(&mut module)?
    } else {
        0
    };
    tracing::debug!(
        target: "image",
        stage = "data",
        exported,
        threads = layout.threads,
        nfvars = layout.nfvars,
        ngvars = layout.ngvars,
        payload = layout.image_data.len(),
        "built data module"
    );
    Ok(module)
}

fn is_coff(triple: &str) -> bool {
    Triple::from_str(triple).is_ok_and(|triple| triple.binary_format == BinaryFormat::Coff)
}

/// Flag every externally visible definition for DLL export.
fn mark_dll_exports(module: &mut Module) -> Result<usize> {
    let exported: Vec<ValueId> = module
        .iter()
        .filter(|(_, value)| {
            !value.is_declaration()
                && !value.linkage.is_local()
                && value.visibility == Visibility::Default
        })
        .map(|(id, _)| id)
        .collect();
    for id in &exported {
        module.value_mut(*id)?.dll_export = true;
    }
    Ok(exported.len())
}

//! Offset tables describing one shard to the loader.
//!
//! Every table is a hidden constant named `<table><suffix>`:
//!
//! * `fvar_offsets` / `gvar_offsets`: `[n, 0, off(var[1]), ...]` relative to
//!   `fvar_base` / `gvar_base`, which alias the first exported value (or are
//!   a zero word when nothing is exported).
//! * `fvar_idxs` / `gvar_idxs`: global export index of each shard-local entry.
//! * `clone_slots`: `[pairs, (fid, off(slot))...]`, slot offsets relative to
//!   `gvar_base`.
//! * `clone_idxs` / `clone_offsets`: per target, the function ids that differ
//!   from the group base and where their bodies live.

use std::collections::BTreeSet;

use super::clone::{CloneCtx, CloneStage};
use super::TAG_MASK;
use crate::error::{Error, Result};
use crate::ir::{
    Alias, AliasValue, Constant, GlobalKind, GlobalValue, Module, Type, ValueId, Variable,
};

pub const FVAR_BASE: &str = "fvar_base";
pub const FVAR_OFFSETS: &str = "fvar_offsets";
pub const FVAR_IDXS: &str = "fvar_idxs";
pub const GVAR_BASE: &str = "gvar_base";
pub const GVAR_OFFSETS: &str = "gvar_offsets";
pub const GVAR_IDXS: &str = "gvar_idxs";
pub const CLONE_SLOTS: &str = "clone_slots";
pub const CLONE_OFFSETS: &str = "clone_offsets";
pub const CLONE_IDXS: &str = "clone_idxs";

/// Per-shard table order inside the image's shard table.
pub const SHARD_TABLES: [&str; 9] = [
    FVAR_BASE,
    FVAR_OFFSETS,
    FVAR_IDXS,
    GVAR_BASE,
    GVAR_OFFSETS,
    GVAR_IDXS,
    CLONE_SLOTS,
    CLONE_OFFSETS,
    CLONE_IDXS,
];

#[must_use]
pub fn table_symbol(table: &str, suffix: &str) -> String {
    format!("{table}{suffix}")
}

fn add_table(module: &mut Module, name: String, init: Constant) -> Result<ValueId> {
    module.add(GlobalValue::new(name, GlobalKind::Variable(Variable::constant(init))).hidden())
}

/// Emit `<kind>_base` and `<kind>_offsets`, returning the integer base the
/// offsets are relative to.
fn emit_offset_table(
    module: &mut Module,
    vars: &[ValueId],
    base_table: &str,
    offsets_table: &str,
    suffix: &str,
) -> Result<Constant> {
    let base_name = table_symbol(base_table, suffix);
    let base = match vars.first() {
        Some(first) => {
            let alias = Alias {
                value: AliasValue::Data(Type::i64()),
                aliasee: Constant::global(*first),
            };
            module.add(GlobalValue::new(base_name, GlobalKind::Alias(alias)).hidden())?;
            Constant::ptr_to_int(Constant::global(*first))
        }
        None => {
            let zero = add_table(module, base_name, Constant::i64(0))?;
            Constant::ptr_to_int(Constant::global(zero))
        }
    };
    let mut offsets = Vec::with_capacity(vars.len() + 1);
    offsets.push(Constant::i32(vars.len() as i64));
    if !vars.is_empty() {
        offsets.push(Constant::i32(0));
        for var in &vars[1..] {
            offsets.push(Constant::ptrdiff32(Constant::global(*var), base.clone()));
        }
    }
    add_table(
        module,
        table_symbol(offsets_table, suffix),
        Constant::i32_array(offsets),
    )?;
    Ok(base)
}

impl CloneCtx<'_> {
    /// Emit every loader table for this shard.
    pub fn emit_metadata(&mut self) -> Result<()> {
        self.advance(CloneStage::UsesFixed, CloneStage::MetadataEmitted)?;
        let suffix = self.suffix.clone();
        let fbase = emit_offset_table(self.module, &self.fvars, FVAR_BASE, FVAR_OFFSETS, &suffix)?;
        let gbase = emit_offset_table(self.module, &self.gvars, GVAR_BASE, GVAR_OFFSETS, &suffix)?;
        add_table(
            self.module,
            table_symbol(FVAR_IDXS, &suffix),
            Constant::u32_array(&self.fvar_idxs),
        )?;
        add_table(
            self.module,
            table_symbol(GVAR_IDXS, &suffix),
            Constant::u32_array(&self.gvar_idxs),
        )?;

        let nfvars = self.fvars.len() as u32;
        let mut gv_relocs = std::mem::take(&mut self.gv_relocs);
        gv_relocs.sort_by_key(|(_, fid)| *fid);
        let mut shared: BTreeSet<u32> = BTreeSet::new();
        let mut slots = vec![Constant::i32(0)];
        let mut pairs = 0i64;
        let mut relocs = gv_relocs.into_iter().peekable();
        for fid in 0..nfvars {
            while let Some((addr, _)) = relocs.next_if(|(_, id)| *id == fid) {
                shared.insert(fid);
                slots.push(Constant::i32(i64::from(fid)));
                slots.push(Constant::ptrdiff32(addr, gbase.clone()));
                pairs += 1;
            }
            if let Some(slot) = self.const_relocs.get(&fid) {
                shared.insert(fid);
                slots.push(Constant::i32(i64::from(fid)));
                slots.push(Constant::ptrdiff32(Constant::global(*slot), gbase.clone()));
                pairs += 1;
            }
        }
        slots[0] = Constant::i32(pairs);
        add_table(
            self.module,
            table_symbol(CLONE_SLOTS, &suffix),
            Constant::i32_array(slots),
        )?;

        let mut idxs: Vec<u32> = Vec::new();
        let mut offsets: Vec<Constant> = Vec::new();
        for spec in self.targets.iter() {
            let position = idxs.len();
            idxs.push(0);
            let mut count = 0u32;
            if spec.is_group_base() {
                let group = self
                    .groups
                    .iter()
                    .find(|group| group.base.index == spec.index)
                    .ok_or_else(|| Error::invariant("group base without a group"))?;
                for fid in 0..nfvars {
                    if !shared.contains(&fid) {
                        continue;
                    }
                    count += 1;
                    idxs.push(fid);
                }
                if spec.index != 0 {
                    for var in &self.fvars {
                        let body = group.base_func(*var).unwrap_or(*var);
                        offsets.push(Constant::ptrdiff32(Constant::global(body), fbase.clone()));
                    }
                }
                idxs[position] = TAG_MASK | count;
            } else {
                let group = self
                    .groups
                    .iter()
                    .find(|group| group.members.iter().any(|member| member.index == spec.index))
                    .ok_or_else(|| Error::invariant("narrow target without a group"))?;
                let member = group
                    .members
                    .iter()
                    .find(|member| member.index == spec.index)
                    .ok_or_else(|| Error::invariant("narrow target without clones"))?;
                idxs.push(group.base.index as u32);
                for (fid, var) in self.fvars.iter().enumerate() {
                    let fid = fid as u32;
                    let body = group.base_func(*var).unwrap_or(*var);
                    let clone = member.vmap.get(&body).copied();
                    if shared.contains(&fid) {
                        count += 1;
                        idxs.push(TAG_MASK | fid);
                        offsets.push(Constant::ptrdiff32(
                            Constant::global(clone.unwrap_or(body)),
                            fbase.clone(),
                        ));
                    } else if let Some(clone) = clone {
                        count += 1;
                        idxs.push(fid);
                        offsets.push(Constant::ptrdiff32(Constant::global(clone), fbase.clone()));
                    }
                }
                idxs[position] = count;
            }
        }
        add_table(
            self.module,
            table_symbol(CLONE_IDXS, &suffix),
            Constant::u32_array(&idxs),
        )?;
        add_table(
            self.module,
            table_symbol(CLONE_OFFSETS, &suffix),
            Constant::i32_array(offsets),
        )?;
        Ok(())
    }
}

//! Per-shard cloning.
//!
//! Targets are arranged in groups: target 0 plus every `clone_all` target is
//! a group base, and each narrow target belongs to the group of its base. A
//! group base owns a full copy of the shard; narrow targets only clone the
//! functions flagged for them and are built from the group base bodies.

use std::collections::{BTreeMap, BTreeSet};

use super::slots::{replace_uses_with_load, rewrite_alias, slot_name};
use super::{
    CloneSet, MultiversionStats, ATTR_CLONE, ATTR_CLONES, ATTR_FVAR, ATTR_RELOC, ATTR_TARGET,
    FLAG_SUFFIX,
};
use crate::error::{Error, Result};
use crate::ir::uses::{UseIndex, UserRef};
use crate::ir::{
    Constant, Function, GlobalKind, GlobalValue, Module, Operand, Type, ValueId, Variable,
};
use crate::target::{TargetFlags, TargetList, TargetSpec};

/// Phases run strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CloneStage {
    Unflagged,
    SlotsPrepared,
    Declared,
    BodiesCloned,
    GlobalUsesFixed,
    UsesFixed,
    MetadataEmitted,
}

/// Clones made for one target, keyed by the function they were copied from.
#[derive(Debug, Clone, Default)]
pub(super) struct TargetClones {
    pub(super) index: usize,
    pub(super) vmap: BTreeMap<ValueId, ValueId>,
}

#[derive(Debug, Clone)]
pub(super) struct Group {
    pub(super) base: TargetClones,
    pub(super) members: Vec<TargetClones>,
}

impl Group {
    /// Function that runs on the group base target in place of `orig`.
    pub(super) fn base_func(&self, orig: ValueId) -> Option<ValueId> {
        if self.base.index == 0 {
            Some(orig)
        } else {
            self.base.vmap.get(&orig).copied()
        }
    }

    fn narrow_mask(&self) -> u64 {
        self.members
            .iter()
            .fold(0, |mask, member| mask | (1u64 << member.index))
    }
}

pub struct CloneCtx<'m> {
    pub(super) module: &'m mut Module,
    pub(super) targets: &'m TargetList,
    stage: CloneStage,
    pub(super) suffix: String,
    pub(super) groups: Vec<Group>,
    /// Target index to `(group position, member position)`.
    placement: Vec<(usize, Option<usize>)>,
    orig_funcs: Vec<ValueId>,
    pub(super) fvars: Vec<ValueId>,
    pub(super) fvar_idxs: Vec<u32>,
    pub(super) gvars: Vec<ValueId>,
    pub(super) gvar_idxs: Vec<u32>,
    func_ids: BTreeMap<ValueId, u32>,
    /// `(integer address, function id)` of nulled initializer words.
    pub(super) gv_relocs: Vec<(Constant, u32)>,
    pub(super) const_relocs: BTreeMap<u32, ValueId>,
    extern_relocs: BTreeMap<ValueId, ValueId>,
    origin: BTreeMap<ValueId, ValueId>,
    pub(super) stats: MultiversionStats,
}

impl<'m> CloneCtx<'m> {
    /// Take the export tables out of `module` and lay out target groups.
    ///
    /// # Errors
    ///
    /// Fails when the target list cannot be laid out in groups.
    pub fn new(module: &'m mut Module, targets: &'m TargetList) -> Result<Self> {
        let mut exports = std::mem::take(&mut module.exports);
        exports.normalize();
        let func_ids = exports
            .functions
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position as u32))
            .collect();

        let layouts = targets.groups()?;
        let mut placement = vec![(0, None); targets.len()];
        let mut groups = Vec::with_capacity(layouts.len());
        for (position, layout) in layouts.into_iter().enumerate() {
            placement[layout.base] = (position, None);
            for (member, index) in layout.members.iter().enumerate() {
                placement[*index] = (position, Some(member));
            }
            groups.push(Group {
                base: TargetClones {
                    index: layout.base,
                    vmap: BTreeMap::new(),
                },
                members: layout
                    .members
                    .into_iter()
                    .map(|index| TargetClones {
                        index,
                        vmap: BTreeMap::new(),
                    })
                    .collect(),
            });
        }

        let orig_funcs = module
            .functions()
            .filter(|(_, function)| !function.is_declaration() || function.has_attr(ATTR_CLONES))
            .map(|(id, _)| id)
            .collect();
        let suffix = module.flag(FLAG_SUFFIX).unwrap_or_default().to_string();
        Ok(Self {
            module,
            targets,
            stage: CloneStage::Unflagged,
            suffix,
            groups,
            placement,
            orig_funcs,
            fvars: exports.functions,
            fvar_idxs: exports.function_idxs,
            gvars: exports.globals,
            gvar_idxs: exports.global_idxs,
            func_ids,
            gv_relocs: Vec::new(),
            const_relocs: BTreeMap::new(),
            extern_relocs: BTreeMap::new(),
            origin: BTreeMap::new(),
            stats: MultiversionStats::default(),
        })
    }

    #[must_use]
    pub fn stage(&self) -> CloneStage {
        self.stage
    }

    #[must_use]
    pub fn stats(&self) -> MultiversionStats {
        self.stats
    }

    pub(super) fn advance(&mut self, from: CloneStage, to: CloneStage) -> Result<()> {
        if self.stage != from {
            return Err(Error::invariant(format!(
                "clone phase {to:?} requested in stage {:?}",
                self.stage
            )));
        }
        self.stage = to;
        Ok(())
    }

    fn spec(&self, index: usize) -> Result<&'m TargetSpec> {
        let targets = self.targets;
        targets
            .get(index)
            .ok_or_else(|| Error::invariant(format!("clone set names missing target {index}")))
    }

    fn func_id(&self, function: ValueId) -> Result<u32> {
        self.func_ids.get(&function).copied().ok_or_else(|| {
            Error::invariant(format!(
                "requesting id of non-exported function '{}'",
                self.module.name_of(function)
            ))
        })
    }

    /// Slot holding the runtime address of `function`.
    pub(super) fn reloc_slot(&self, function: ValueId) -> Result<ValueId> {
        let slot = if self.module.is_declaration(function) {
            self.extern_relocs.get(&function).copied()
        } else {
            self.const_relocs.get(&self.func_id(function)?).copied()
        };
        slot.ok_or_else(|| {
            Error::invariant(format!(
                "no relocation slot for '{}'",
                self.module.name_of(function)
            ))
        })
    }

    /// Create one pointer slot per `mv.reloc` function: a hidden definition
    /// for local functions, an external declaration otherwise.
    pub fn prepare_slots(&mut self) -> Result<()> {
        self.advance(CloneStage::Unflagged, CloneStage::SlotsPrepared)?;
        for id in self.orig_funcs.clone() {
            let function = self.module.function(id)?;
            if !function.has_attr(ATTR_RELOC) {
                continue;
            }
            if !function.has_attr(ATTR_CLONES) {
                return Err(Error::invariant(format!(
                    "'{}' needs a relocation slot but has no clones",
                    self.module.name_of(id)
                )));
            }
            let name = slot_name(self.module.name_of(id));
            if function.is_declaration() {
                let slot = self
                    .module
                    .add_variable(name, Variable::declaration(Type::Ptr))?;
                self.extern_relocs.insert(id, slot);
                self.stats.extern_slots += 1;
            } else {
                let fid = self.func_id(id)?;
                let slot = self.module.add(
                    GlobalValue::new(
                        name,
                        GlobalKind::Variable(Variable::new(Type::Ptr, Constant::null_ptr())),
                    )
                    .hidden(),
                )?;
                self.const_relocs.insert(fid, slot);
                self.stats.const_slots += 1;
            }
        }
        Ok(())
    }

    /// Declare `name.N` for every target bit of every original function.
    pub fn clone_decls(&mut self) -> Result<()> {
        self.advance(CloneStage::SlotsPrepared, CloneStage::Declared)?;
        for id in self.orig_funcs.clone() {
            let set = CloneSet::of(self.module.function(id)?);
            for target in set.targets() {
                if target == 0 {
                    continue;
                }
                let spec = self.spec(target)?;
                let (group, member) = self.placement[target];
                let key = if spec.clone_all() {
                    id
                } else {
                    self.groups[group].base_func(id).ok_or_else(|| {
                        Error::invariant(format!(
                            "'{}' is cloned for target {target} but not for its group base",
                            self.module.name_of(id)
                        ))
                    })?
                };
                let clone = self.declare_clone(id, target)?;
                self.origin.insert(clone, id);
                let clones = match member {
                    Some(member) => &mut self.groups[group].members[member],
                    None => &mut self.groups[group].base,
                };
                clones.vmap.insert(key, clone);
                self.stats.clones += 1;
            }
        }
        Ok(())
    }

    fn declare_clone(&mut self, id: ValueId, target: usize) -> Result<ValueId> {
        let value = self.module.value(id)?;
        let GlobalKind::Function(function) = &value.kind else {
            return Err(Error::invariant(format!("'{}' is not a function", value.name)));
        };
        let mut declaration = Function::declaration(function.ty.clone());
        declaration.attrs = function
            .attrs
            .iter()
            .filter(|(key, _)| ![ATTR_CLONES, ATTR_RELOC, ATTR_FVAR].contains(&key.as_str()))
            .map(|(key, val)| (key.clone(), val.clone()))
            .collect();
        let clone = GlobalValue {
            name: format!("{}.{target}", value.name),
            linkage: value.linkage,
            visibility: value.visibility,
            dso_local: value.dso_local,
            dll_export: value.dll_export,
            kind: GlobalKind::Function(declaration),
        };
        self.module.add(clone)
    }

    /// Copy bodies into the declared clones and tag every function with the
    /// target it runs on.
    pub fn clone_bodies(&mut self) -> Result<()> {
        self.advance(CloneStage::Declared, CloneStage::BodiesCloned)?;
        for id in self.orig_funcs.clone() {
            let defined = !self.module.is_declaration(id);
            for position in 0..self.groups.len() {
                let group_base = self.groups[position].base.index;
                let Some(group_fn) = self.groups[position].base_func(id) else {
                    continue;
                };
                if group_base != 0 && defined {
                    copy_body(self.module, id, group_fn, &self.groups[position].base.vmap)?;
                }
                for member in 0..self.groups[position].members.len() {
                    let clones = &self.groups[position].members[member];
                    let Some(target_fn) = clones.vmap.get(&group_fn).copied() else {
                        continue;
                    };
                    let target = clones.index;
                    if defined {
                        copy_body(self.module, group_fn, target_fn, &clones.vmap)?;
                    }
                    let spec = self.spec(target)?;
                    let function = self.module.function_mut(target_fn)?;
                    add_features(function, spec);
                    tag(function, group_base, target);
                }
                let spec = self.spec(group_base)?;
                let function = self.module.function_mut(group_fn)?;
                if group_base != 0 {
                    add_features(function, spec);
                }
                tag(function, group_base, group_base);
            }
        }
        Ok(())
    }

    /// Remove initializer and alias references to multiversioned functions.
    ///
    /// Aliases become trampolines through the relocation slot; initializer
    /// words are nulled and recorded for the loader to patch.
    pub fn fix_gv_uses(&mut self) -> Result<()> {
        self.advance(CloneStage::BodiesCloned, CloneStage::GlobalUsesFixed)?;
        let index = UseIndex::build(self.module);
        let multiversioned: Vec<ValueId> = self
            .orig_funcs
            .iter()
            .copied()
            .filter(|id| {
                self.module
                    .function(*id)
                    .is_ok_and(|function| !CloneSet::of(function).is_empty())
            })
            .collect();
        for id in &multiversioned {
            for use_ in index.global_uses(*id) {
                match use_.user {
                    UserRef::Aliasee(alias) => {
                        if !use_.samebits {
                            return Err(Error::invariant(format!(
                                "alias '{}' refers to multiversioned '{}' through arithmetic",
                                self.module.name_of(alias),
                                self.module.name_of(*id)
                            )));
                        }
                        let slot = self.reloc_slot(*id)?;
                        rewrite_alias(self.module, alias, *id, slot)?;
                        self.stats.trampolines += 1;
                    }
                    UserRef::Initializer(holder) => {
                        if !use_.samebits {
                            return Err(Error::invariant(format!(
                                "'{}' refers to multiversioned '{}' through arithmetic",
                                self.module.name_of(holder),
                                self.module.name_of(*id)
                            )));
                        }
                        let fid = self.func_id(*id)?;
                        let variable = self
                            .module
                            .value_mut(holder)?
                            .as_variable_mut()
                            .ok_or_else(|| Error::invariant("initializer owner is not a variable"))?;
                        let leaf = variable
                            .initializer
                            .as_mut()
                            .and_then(|init| init.at_path_mut(&use_.path))
                            .ok_or_else(|| Error::invariant("stale initializer use"))?;
                        *leaf = Constant::null_ptr();
                        variable.constant = false;
                        self.gv_relocs
                            .push((Constant::address_plus(holder, use_.offset), fid));
                        self.stats.gv_relocs += 1;
                    }
                    UserRef::Operand { .. } => {}
                }
            }
        }
        let remaining = UseIndex::build(self.module);
        if let Some(id) = multiversioned
            .iter()
            .find(|id| remaining.global_uses(**id).next().is_some())
        {
            return Err(Error::invariant(format!(
                "global references to '{}' survived rewriting",
                self.module.name_of(*id)
            )));
        }
        Ok(())
    }

    /// Route group base references to functions that have narrow clones the
    /// caller lacks through the callee's relocation slot.
    pub fn fix_inst_uses(&mut self) -> Result<()> {
        self.advance(CloneStage::GlobalUsesFixed, CloneStage::UsesFixed)?;
        for position in 0..self.groups.len() {
            let mask = self.groups[position].narrow_mask();
            if mask == 0 {
                continue;
            }
            let group_base = self.groups[position].base.index.to_string();
            let users: Vec<ValueId> = self
                .module
                .functions()
                .filter(|(_, function)| {
                    !function.is_declaration()
                        && function.attr(ATTR_CLONE) == Some(group_base.as_str())
                        && function.attr(ATTR_TARGET) == Some(group_base.as_str())
                })
                .map(|(id, _)| id)
                .collect();
            for user in users {
                let caller = self.origin.get(&user).copied().unwrap_or(user);
                let caller_clones = CloneSet::of(self.module.function(caller)?).bits();
                let referenced: BTreeSet<ValueId> = self
                    .module
                    .function(user)?
                    .instructions()
                    .flat_map(|inst| inst.operands.iter())
                    .filter_map(Operand::as_const)
                    .flat_map(Constant::referenced_globals)
                    .collect();
                for callee_fn in referenced {
                    let callee = self.origin.get(&callee_fn).copied().unwrap_or(callee_fn);
                    let Some(function) = self.module.get(callee).and_then(GlobalValue::as_function)
                    else {
                        continue;
                    };
                    let callee_clones = CloneSet::of(function).bits();
                    if callee_clones & mask & !caller_clones == 0 {
                        continue;
                    }
                    if self.groups[position].base_func(callee) != Some(callee_fn) {
                        continue;
                    }
                    let slot = self.reloc_slot(callee)?;
                    self.stats.rewritten_uses +=
                        replace_uses_with_load(self.module, user, callee_fn, slot)?;
                }
            }
        }
        Ok(())
    }
}

/// Replace the body of `to` with a copy of `from`, remapping references
/// through `vmap`.
fn copy_body(
    module: &mut Module,
    from: ValueId,
    to: ValueId,
    vmap: &BTreeMap<ValueId, ValueId>,
) -> Result<()> {
    let source = module.function(from)?;
    let mut blocks = source.blocks.clone();
    let next_local = source.next_local;
    let remap = |id: ValueId| vmap.get(&id).copied();
    for inst in blocks.iter_mut().flat_map(|block| block.insts.iter_mut()) {
        for operand in &mut inst.operands {
            if let Operand::Const(constant) = operand {
                constant.remap_globals(&remap);
            }
        }
    }
    let target = module.function_mut(to)?;
    target.blocks = blocks;
    target.next_local = next_local;
    Ok(())
}

fn add_features(function: &mut Function, spec: &TargetSpec) {
    function.set_attr("target-cpu", spec.cpu_name.clone());
    let features = spec.feature_string();
    if !features.is_empty() {
        let merged = match function.attr("target-features") {
            Some(existing) if !existing.is_empty() => format!("{existing},{features}"),
            _ => features,
        };
        function.set_attr("target-features", merged);
    }
    if !function.has_attr("optnone") {
        if spec.flags.contains(TargetFlags::OPTSIZE) {
            function.set_attr("optsize", "");
        }
        if spec.flags.contains(TargetFlags::MINSIZE) {
            function.set_attr("minsize", "");
        }
    }
}

fn tag(function: &mut Function, group_base: usize, target: usize) {
    function.set_attr(ATTR_CLONE, group_base.to_string());
    function.set_attr(ATTR_TARGET, target.to_string());
}

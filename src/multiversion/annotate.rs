//! Whole-module clone annotation.
//!
//! Every defined function is inspected once; the resulting trigger flags pick
//! which narrow targets clone it. Narrow targets then pull in callees that
//! call back into the cloned set, so tight call cycles stay within one target.

use std::collections::{BTreeMap, BTreeSet};

use super::{CloneSet, ATTR_CLONES, ATTR_FVAR, ATTR_RELOC, FLAG_VECCALL};
use crate::error::{Error, Result};
use crate::ir::cfg::has_loop;
use crate::ir::uses::{UseIndex, UserRef};
use crate::ir::{Function, LocalId, Module, Opcode, Operand, Type, ValueId};
use crate::target::{TargetFlags, TargetList};

/// Fused multiply-add intrinsics.
const FMA_PREFIXES: [&str; 2] = ["muladd.", "fma."];
/// Runtime CPU capability queries.
const CPU_PREFIX: &str = "cpu.";
const HAVE_FMA_PREFIX: &str = "cpu.have_fma.";

/// Trigger flags observed in one function body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuncInfo {
    pub flags: TargetFlags,
    pub has_veccall: bool,
}

impl FuncInfo {
    fn saturated(&self) -> bool {
        self.has_veccall
            && self.flags.contains(TargetFlags::CLONE_SIMD)
            && self.flags.contains(TargetFlags::CLONE_MATH)
    }
}

/// Per-run counts, mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationSummary {
    pub functions: usize,
    /// Functions cloned for each target, by target index.
    pub cloned: Vec<usize>,
    pub relocs: usize,
    pub fvars: usize,
    pub has_veccall: bool,
}

/// Whether `have_fma` queries fold to a constant for `triple`.
fn fma_statically_known(triple: &str) -> bool {
    triple.starts_with("aarch64") || triple.starts_with("arm64")
}

fn local_types(function: &Function) -> BTreeMap<LocalId, Type> {
    function
        .instructions()
        .filter_map(|inst| inst.result.map(|result| (result, inst.ty.clone())))
        .collect()
}

/// Scan one function for the features that make a target-specific clone pay off.
#[must_use]
pub fn collect_func_info(module: &Module, function: &Function) -> FuncInfo {
    let mut info = FuncInfo::default();
    if has_loop(function) {
        info.flags |= TargetFlags::CLONE_LOOP;
    }
    if function.ty.is_vector() {
        info.has_veccall = true;
        info.flags |= TargetFlags::CLONE_SIMD;
    }
    let locals = local_types(function);
    let fma_known = fma_statically_known(&module.triple);
    for inst in function.instructions() {
        match &inst.opcode {
            Opcode::Call { fn_ty } => {
                if fn_ty.is_vector() {
                    info.has_veccall = true;
                    info.flags |= TargetFlags::CLONE_SIMD;
                }
                if let Some(callee) = inst.direct_callee() {
                    let name = module.name_of(callee);
                    if FMA_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                        info.flags |= TargetFlags::CLONE_MATH;
                    } else if name.starts_with(CPU_PREFIX)
                        && !(name.starts_with(HAVE_FMA_PREFIX) && fma_known)
                    {
                        info.flags |= TargetFlags::CLONE_CPU;
                    }
                }
            }
            Opcode::Store => {
                if inst.ty.is_vector() {
                    info.flags |= TargetFlags::CLONE_SIMD;
                }
            }
            _ => {
                if inst.ty.is_vector() {
                    info.flags |= TargetFlags::CLONE_SIMD;
                }
            }
        }
        if inst.fast_math {
            info.flags |= TargetFlags::CLONE_MATH;
        }
        let half_operand = inst.operands.iter().any(|operand| match operand {
            Operand::Const(constant) => constant.ty().is_half(),
            Operand::Local(local) => locals.get(local).is_some_and(Type::is_half),
            Operand::Arg(index) => function
                .ty
                .params
                .get(*index as usize)
                .is_some_and(Type::is_half),
            Operand::Block(_) => false,
        });
        if half_operand {
            info.flags |= TargetFlags::CLONE_FLOAT16;
        }
        if info.saturated() {
            break;
        }
    }
    info
}

fn direct_callees(function: &Function) -> BTreeSet<ValueId> {
    function
        .instructions()
        .filter_map(|inst| inst.direct_callee())
        .collect()
}

/// Decide clone sets and slot needs for every defined function, recording
/// them as `mv.clones`, `mv.reloc` and `mv.fvar` attributes.
///
/// # Errors
///
/// Fails when the module already carries clone annotations or when the
/// target list is empty.
pub fn annotate_module_clones(module: &mut Module, targets: &TargetList) -> Result<AnnotationSummary> {
    if targets.is_empty() {
        return Err(Error::config("target list is empty"));
    }
    let orig_funcs: Vec<ValueId> = module
        .functions()
        .filter(|(_, function)| !function.is_declaration())
        .map(|(id, _)| id)
        .collect();
    if let Some(annotated) = orig_funcs.iter().find(|id| {
        module
            .function(**id)
            .is_ok_and(|function| function.has_attr(ATTR_CLONES))
    }) {
        return Err(Error::invariant(format!(
            "'{}' is already annotated for multiversioning",
            module.name_of(*annotated)
        )));
    }

    let mut infos: BTreeMap<ValueId, FuncInfo> = BTreeMap::new();
    let mut callees: BTreeMap<ValueId, BTreeSet<ValueId>> = BTreeMap::new();
    for id in &orig_funcs {
        let function = module.function(*id)?;
        infos.insert(*id, collect_func_info(module, function));
        callees.insert(*id, direct_callees(function));
    }
    let has_veccall = infos.values().any(|info| info.has_veccall);

    let mut clones: BTreeMap<ValueId, CloneSet> = BTreeMap::new();
    let mut summary = AnnotationSummary {
        functions: orig_funcs.len(),
        cloned: vec![0; targets.len()],
        has_veccall,
        ..AnnotationSummary::default()
    };
    for spec in targets.iter().skip(1) {
        let selected = if spec.clone_all() {
            orig_funcs.iter().copied().collect()
        } else {
            let triggers = spec.triggers();
            let seed: BTreeSet<ValueId> = orig_funcs
                .iter()
                .copied()
                .filter(|id| infos[id].flags.intersects(triggers))
                .collect();
            expand_through_callers(seed, &callees)
        };
        summary.cloned[spec.index] = selected.len();
        for id in selected {
            clones.entry(id).or_default().insert(spec.index);
        }
    }

    let slots = decide_slots(module, targets, &clones);
    for (id, set) in &clones {
        if !set.is_empty() {
            module.function_mut(*id)?.set_attr(ATTR_CLONES, set.to_hex());
        }
    }
    // slot users address functions by export id, so every one needs an entry
    module.exports.normalize();
    let mut next_index = module
        .exports
        .function_idxs
        .iter()
        .max()
        .map_or(0, |index| index + 1);
    for id in slots.keys() {
        if !module.exports.functions.contains(id) {
            module.exports.functions.push(*id);
            module.exports.function_idxs.push(next_index);
            next_index += 1;
        }
    }
    for (id, slot) in slots {
        let function = module.function_mut(id)?;
        match slot {
            Slot::Reloc => {
                function.set_attr(ATTR_RELOC, "");
                summary.relocs += 1;
            }
            Slot::Fvar => {
                function.set_attr(ATTR_FVAR, "");
                summary.fvars += 1;
            }
        }
    }
    if has_veccall {
        module.set_flag(FLAG_VECCALL, "1");
    }
    tracing::debug!(
        target: "multiversion",
        stage = "annotate",
        functions = summary.functions,
        relocs = summary.relocs,
        fvars = summary.fvars,
        has_veccall,
        "annotated clone sets"
    );
    Ok(summary)
}

/// Grow `seed` with callees that call back into the selected set.
fn expand_through_callers(
    seed: BTreeSet<ValueId>,
    callees: &BTreeMap<ValueId, BTreeSet<ValueId>>,
) -> BTreeSet<ValueId> {
    let mut selected = seed.clone();
    let mut frontier = seed;
    while !frontier.is_empty() {
        let mut next = BTreeSet::new();
        for id in &frontier {
            let Some(children) = callees.get(id) else {
                continue;
            };
            for child in children {
                if selected.contains(child) {
                    continue;
                }
                let Some(grandchildren) = callees.get(child) else {
                    continue;
                };
                if grandchildren.iter().any(|callee| selected.contains(callee)) {
                    selected.insert(*child);
                    next.insert(*child);
                }
            }
        }
        frontier = next;
    }
    selected
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Reloc,
    Fvar,
}

/// A multiversioned function needs a relocation slot when an alias names it or
/// when some caller lacks a narrow clone that the callee has. Otherwise, an
/// initializer reference only requires an export id.
fn decide_slots(
    module: &Module,
    targets: &TargetList,
    clones: &BTreeMap<ValueId, CloneSet>,
) -> BTreeMap<ValueId, Slot> {
    let narrow = targets.narrow_mask();
    let uses = UseIndex::build(module);
    let clones_of = |id: ValueId| clones.get(&id).copied().unwrap_or_default().bits();
    let mut slots = BTreeMap::new();
    for (id, set) in clones {
        if set.is_empty() {
            continue;
        }
        let mut aliased = false;
        let mut initialized = false;
        let mut crossing = false;
        for use_ in uses.uses_of(*id) {
            match use_.user {
                UserRef::Aliasee(_) => aliased = true,
                UserRef::Initializer(_) => initialized = true,
                UserRef::Operand { function, .. } => {
                    if set.bits() & narrow & !clones_of(function) != 0 {
                        crossing = true;
                    }
                }
            }
        }
        if aliased || crossing {
            slots.insert(*id, Slot::Reloc);
        } else if initialized {
            slots.insert(*id, Slot::Fvar);
        }
    }
    slots
}

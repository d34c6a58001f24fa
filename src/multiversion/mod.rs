//! CPU-feature multiversioning.
//!
//! [`annotate`] runs once over the whole module and records, per function,
//! which targets get a distinct clone and whether the function needs a
//! relocation slot. [`run_multiversioning`] then runs per shard: it clones the
//! flagged functions, routes cross-clone references through slots and emits
//! the offset tables the loader consumes.

pub mod annotate;
pub mod clone;
pub mod metadata;
pub mod slots;

use std::fmt;

use crate::error::Result;
use crate::ir::verify::verify_module;
use crate::ir::{Function, Module};
use crate::logging::StageTimer;
use crate::target::TargetList;

pub use annotate::{annotate_module_clones, collect_func_info, AnnotationSummary, FuncInfo};
pub use clone::{CloneCtx, CloneStage};

/// Hex clone set on original functions.
pub const ATTR_CLONES: &str = "mv.clones";
/// Function needs a relocation slot.
pub const ATTR_RELOC: &str = "mv.reloc";
/// Function must stay indexable in the export table.
pub const ATTR_FVAR: &str = "mv.fvar";
/// Group base target index of a group base or clone.
pub const ATTR_CLONE: &str = "mv.clone";
/// Target index a function body was built for.
pub const ATTR_TARGET: &str = "mv.target";
pub const FLAG_VECCALL: &str = "mv.veccall";
pub const FLAG_SUFFIX: &str = "mv.suffix";

/// Marks group base entries in `clone_idxs` and slot-only entries of narrow targets.
pub const TAG_MASK: u32 = 1 << 31;
pub const VALUE_MASK: u32 = !TAG_MASK;

/// One bit per target with a distinct clone of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CloneSet(pub u64);

impl CloneSet {
    pub const EMPTY: CloneSet = CloneSet(0);

    /// Parse the `mv.clones` attribute of `function`, if present.
    #[must_use]
    pub fn from_function(function: &Function) -> Option<Self> {
        function
            .attr(ATTR_CLONES)
            .and_then(|value| u64::from_str_radix(value, 16).ok())
            .map(CloneSet)
    }

    #[must_use]
    pub fn of(function: &Function) -> Self {
        Self::from_function(function).unwrap_or_default()
    }

    #[must_use]
    pub fn contains(self, target: usize) -> bool {
        target < 64 && self.0 & (1 << target) != 0
    }

    pub fn insert(&mut self, target: usize) {
        if target < 64 {
            self.0 |= 1 << target;
        }
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn targets(self) -> impl Iterator<Item = usize> {
        (0..64).filter(move |target| self.contains(*target))
    }

    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }
}

impl fmt::Display for CloneSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Counters reported by one multiversioning run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiversionStats {
    pub clones: usize,
    pub const_slots: usize,
    pub extern_slots: usize,
    pub trampolines: usize,
    pub gv_relocs: usize,
    pub rewritten_uses: usize,
}

/// Clone, rewrite and emit metadata for one shard module.
///
/// # Errors
///
/// Missing relocation slots, export ids or a module that fails verification
/// afterwards are invariant violations.
pub fn run_multiversioning(module: &mut Module, targets: &TargetList) -> Result<MultiversionStats> {
    let timer = StageTimer::start("multiversion", "clone");
    let mut ctx = CloneCtx::new(module, targets)?;
    ctx.prepare_slots()?;
    ctx.clone_decls()?;
    ctx.clone_bodies()?;
    ctx.fix_gv_uses()?;
    ctx.fix_inst_uses()?;
    ctx.emit_metadata()?;
    let stats = ctx.stats();
    drop(ctx);
    verify_module(module)?;
    tracing::debug!(
        target: "multiversion",
        stage = "clone",
        module = %module.name,
        clones = stats.clones,
        const_slots = stats.const_slots,
        extern_slots = stats.extern_slots,
        gv_relocs = stats.gv_relocs,
        rewritten_uses = stats.rewritten_uses,
        "multiversioning finished"
    );
    timer.finish();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_set_round_trips_hex() {
        let mut set = CloneSet::EMPTY;
        set.insert(1);
        set.insert(3);
        assert_eq!(set.to_hex(), "a");
        assert_eq!(set.count(), 2);
        assert_eq!(set.targets().collect::<Vec<_>>(), vec![1, 3]);
        let mut function = Function::declaration(crate::ir::FunctionType::void());
        function.set_attr(ATTR_CLONES, set.to_hex());
        assert_eq!(CloneSet::from_function(&function), Some(set));
    }
}

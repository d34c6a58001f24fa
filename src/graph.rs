//! Code units and the must-colocate edges between them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::uses::{UseIndex, UserRef};
use crate::ir::{Function, GlobalKind, Module, ValueId};
use crate::multiversion::CloneSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Function,
    GlobalVariable,
    Alias,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub id: ValueId,
    pub name: String,
    pub kind: UnitKind,
    pub weight: u64,
    pub defined: bool,
}

/// `from` references `to` through a constant, so both must share a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UseEdge {
    pub from: usize,
    pub to: usize,
}

/// Which references force two units into the same shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColocationPolicy {
    /// Initializers, aliasees and instruction operands, direct calls included.
    #[default]
    AllReferences,
    /// Initializers and aliasees only; calls may cross shards.
    DataOnly,
}

impl ColocationPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ColocationPolicy::AllReferences => "all-references",
            ColocationPolicy::DataOnly => "data-only",
        }
    }

    fn follows(self, user: UserRef) -> bool {
        match self {
            ColocationPolicy::AllReferences => true,
            ColocationPolicy::DataOnly => !user.is_instruction(),
        }
    }
}

impl fmt::Display for ColocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColocationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all-references" | "all" => Ok(ColocationPolicy::AllReferences),
            "data-only" | "data" => Ok(ColocationPolicy::DataOnly),
            other => Err(Error::config(format!(
                "unknown colocation policy '{other}' (expected all-references or data-only)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub units: Vec<CodeUnit>,
    pub edges: Vec<UseEdge>,
    index: BTreeMap<ValueId, usize>,
}

impl DependencyGraph {
    #[must_use]
    pub fn unit_index(&self, id: ValueId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    #[must_use]
    pub fn unit(&self, id: ValueId) -> Option<&CodeUnit> {
        self.unit_index(id).map(|index| &self.units[index])
    }

    pub fn defined_units(&self) -> impl Iterator<Item = &CodeUnit> {
        self.units.iter().filter(|unit| unit.defined)
    }

    /// Sum of defined unit weights.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.defined_units().map(|unit| unit.weight).sum()
    }

    #[must_use]
    pub fn defined_count(&self) -> usize {
        self.defined_units().count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyGraphBuilder {
    policy: ColocationPolicy,
}

impl DependencyGraphBuilder {
    #[must_use]
    pub fn new(policy: ColocationPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn build(&self, module: &Module) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for (id, value) in module.iter() {
            let defined = !value.is_declaration();
            let (kind, weight) = match &value.kind {
                GlobalKind::Function(function) => (UnitKind::Function, function_weight(function)),
                GlobalKind::Variable(_) => (UnitKind::GlobalVariable, 1),
                GlobalKind::Alias(_) => (UnitKind::Alias, 1),
            };
            graph.index.insert(id, graph.units.len());
            graph.units.push(CodeUnit {
                id,
                name: value.name.clone(),
                kind,
                weight: if defined { weight } else { 0 },
                defined,
            });
        }
        let uses = UseIndex::build(module);
        for target in uses.targets() {
            let Some(to) = graph.unit_index(target) else {
                continue;
            };
            if !graph.units[to].defined {
                continue;
            }
            for use_ in uses.uses_of(target) {
                if !self.policy.follows(use_.user) {
                    continue;
                }
                let Some(from) = graph.unit_index(use_.user.owner()) else {
                    continue;
                };
                if from != to && graph.units[from].defined {
                    graph.edges.push(UseEdge { from, to });
                }
            }
        }
        graph.edges.sort_unstable();
        graph.edges.dedup();
        tracing::debug!(
            target: "partition",
            stage = "graph",
            units = graph.units.len(),
            edges = graph.edges.len(),
            policy = %self.policy,
            "built dependency graph"
        );
        graph
    }
}

/// `(1 + instructions + blocks) * (1 + clones)`.
#[must_use]
pub fn function_weight(function: &Function) -> u64 {
    let base = 1 + function.instruction_count() as u64 + function.blocks.len() as u64;
    let clones = CloneSet::from_function(function).map_or(0, CloneSet::count);
    base * (1 + u64::from(clones))
}

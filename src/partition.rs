//! Splitting a module into balanced shards.
//!
//! Units joined by a use edge are merged with a union-find arena; the
//! resulting components are packed heaviest-first onto the currently lightest
//! shard. The greedy packing guarantees that the heaviest and lightest shards
//! differ by at most the weight of the heaviest component.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::error::{Error, Result};
use crate::graph::{ColocationPolicy, DependencyGraph, DependencyGraphBuilder};
use crate::ir::{ExportTables, Module, ValueId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub globals: BTreeSet<ValueId>,
    /// Exported functions owned here, mapped to their original export index.
    pub fvars: BTreeMap<ValueId, u32>,
    pub gvars: BTreeMap<ValueId, u32>,
    pub weight: u64,
}

impl Partition {
    #[must_use]
    pub fn owns(&self, id: ValueId) -> bool {
        self.globals.contains(&id)
    }
}

/// Partitions plus the figures the balance bound is stated in.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub partitions: Vec<Partition>,
    pub heaviest_component: u64,
    pub components: usize,
}

impl PartitionPlan {
    /// `max(weight) - min(weight)`.
    #[must_use]
    pub fn spread(&self) -> u64 {
        let max = self.partitions.iter().map(|p| p.weight).max().unwrap_or(0);
        let min = self.partitions.iter().map(|p| p.weight).min().unwrap_or(0);
        max - min
    }

    /// Whether the greedy bound `spread <= heaviest component` holds.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.spread() <= self.heaviest_component
    }

    #[must_use]
    pub fn weights(&self) -> Vec<u64> {
        self.partitions.iter().map(|p| p.weight).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    parent: usize,
    size: usize,
    weight: u64,
}

/// Index-based union-find; identity lives in the graph's unit list.
#[derive(Debug, Default)]
struct UnionFind {
    nodes: Vec<Node>,
}

impl UnionFind {
    fn make(&mut self, weight: u64) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            parent: index,
            size: 1,
            weight,
        });
        index
    }

    fn find(&mut self, mut index: usize) -> usize {
        while self.nodes[index].parent != index {
            let grandparent = self.nodes[self.nodes[index].parent].parent;
            self.nodes[index].parent = grandparent;
            index = grandparent;
        }
        index
    }

    fn merge(&mut self, x: usize, y: usize) -> usize {
        let mut x = self.find(x);
        let mut y = self.find(y);
        if x == y {
            return x;
        }
        if self.nodes[x].size < self.nodes[y].size {
            std::mem::swap(&mut x, &mut y);
        }
        self.nodes[y].parent = x;
        self.nodes[x].size += self.nodes[y].size;
        self.nodes[x].weight += self.nodes[y].weight;
        x
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    threads: usize,
}

impl Partitioner {
    /// # Errors
    ///
    /// A partition count of zero is rejected.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::config("partition count must be at least 1"));
        }
        Ok(Self { threads })
    }

    #[must_use]
    pub fn partition(&self, graph: &DependencyGraph, exports: &ExportTables) -> PartitionPlan {
        let mut arena = UnionFind::default();
        let mut node_of = vec![usize::MAX; graph.units.len()];
        let mut unit_of = Vec::new();
        for (unit_index, unit) in graph.units.iter().enumerate() {
            if unit.defined {
                node_of[unit_index] = arena.make(unit.weight);
                unit_of.push(unit_index);
            }
        }
        for edge in &graph.edges {
            let (from, to) = (node_of[edge.from], node_of[edge.to]);
            if from != usize::MAX && to != usize::MAX {
                arena.merge(from, to);
            }
        }

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for node in 0..arena.nodes.len() {
            let root = arena.find(node);
            members.entry(root).or_default().push(node);
        }
        let mut components: Vec<(u64, usize)> = members
            .keys()
            .map(|root| (arena.nodes[*root].weight, *root))
            .collect();
        // heaviest first; ties keep the component whose first unit comes first
        components.sort_by_key(|(weight, root)| (Reverse(*weight), members[root][0]));

        let fvar_index: BTreeMap<ValueId, u32> = exports
            .functions
            .iter()
            .zip(export_indices(&exports.function_idxs, exports.functions.len()))
            .map(|(id, index)| (*id, index))
            .collect();
        let gvar_index: BTreeMap<ValueId, u32> = exports
            .globals
            .iter()
            .zip(export_indices(&exports.global_idxs, exports.globals.len()))
            .map(|(id, index)| (*id, index))
            .collect();

        let mut partitions: Vec<Partition> = (0..self.threads)
            .map(|index| Partition {
                index,
                ..Partition::default()
            })
            .collect();
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> =
            (0..self.threads).map(|index| Reverse((0, index))).collect();
        let heaviest_component = components.first().map_or(0, |(weight, _)| *weight);
        for (weight, root) in &components {
            let Some(Reverse((load, target))) = heap.pop() else {
                break;
            };
            let partition = &mut partitions[target];
            for node in &members[root] {
                let unit = &graph.units[unit_of[*node]];
                partition.globals.insert(unit.id);
                if let Some(index) = fvar_index.get(&unit.id) {
                    partition.fvars.insert(unit.id, *index);
                }
                if let Some(index) = gvar_index.get(&unit.id) {
                    partition.gvars.insert(unit.id, *index);
                }
            }
            partition.weight += weight;
            heap.push(Reverse((load + weight, target)));
        }

        for partition in &partitions {
            tracing::debug!(
                target: "partition",
                stage = "assign",
                partition = partition.index,
                weight = partition.weight,
                globals = partition.globals.len(),
                fvars = partition.fvars.len(),
                gvars = partition.gvars.len(),
                "partition assigned"
            );
        }
        PartitionPlan {
            partitions,
            heaviest_component,
            components: components.len(),
        }
    }
}

fn export_indices(idxs: &[u32], len: usize) -> Vec<u32> {
    if idxs.len() == len {
        idxs.to_vec()
    } else {
        (0..len as u32).collect()
    }
}

/// Build the dependency graph of `module` and partition it.
///
/// # Errors
///
/// Fails for a zero partition count or when the result does not cover the
/// module exactly once.
pub fn partition_module(
    module: &Module,
    threads: usize,
    policy: ColocationPolicy,
) -> Result<PartitionPlan> {
    let partitioner = Partitioner::new(threads)?;
    let graph = DependencyGraphBuilder::new(policy).build(module);
    let plan = partitioner.partition(&graph, &module.exports);
    verify_partitioning(&plan.partitions, module)?;
    Ok(plan)
}

/// Every defined value in exactly one partition, no declarations, and only
/// external linkage for partitioned values.
pub fn verify_partitioning(partitions: &[Partition], module: &Module) -> Result<()> {
    let mut owner: BTreeMap<ValueId, usize> = BTreeMap::new();
    let mut problems = Vec::new();
    for partition in partitions {
        for id in &partition.globals {
            if let Some(previous) = owner.insert(*id, partition.index) {
                problems.push(format!(
                    "duplicate global '{}' in partitions {} and {previous}",
                    module.name_of(*id),
                    partition.index
                ));
            }
        }
    }
    for (id, value) in module.iter() {
        match (value.is_declaration(), owner.get(&id)) {
            (true, Some(index)) => problems.push(format!(
                "declaration '{}' is in partition {index}",
                value.name
            )),
            (false, None) => problems.push(format!("'{}' is not in any partition", value.name)),
            (false, Some(index)) if value.linkage.is_local() => problems.push(format!(
                "'{}' has local linkage but is in partition {index}",
                value.name
            )),
            _ => {}
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::invariant(format!(
            "partitioning failed:\n  {}",
            problems.join("\n  ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CodeUnit, UnitKind, UseEdge};

    fn graph(weights: &[u64], edges: &[(usize, usize)]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for (index, weight) in weights.iter().enumerate() {
            graph.units.push(CodeUnit {
                id: ValueId(index as u32),
                name: format!("u{index}"),
                kind: UnitKind::Function,
                weight: *weight,
                defined: true,
            });
        }
        graph.edges = edges
            .iter()
            .map(|(from, to)| UseEdge {
                from: *from,
                to: *to,
            })
            .collect();
        graph
    }

    #[test]
    fn union_find_merges_by_size() {
        let mut arena = UnionFind::default();
        let a = arena.make(1);
        let b = arena.make(2);
        let c = arena.make(3);
        arena.merge(a, b);
        let root = arena.merge(c, a);
        assert_eq!(arena.find(c), root);
        assert_eq!(arena.nodes[root].weight, 6);
        assert_eq!(arena.nodes[root].size, 3);
    }

    #[test]
    fn components_go_heaviest_first_to_lightest_shard() {
        let graph = graph(&[5, 4, 3, 3, 1], &[(3, 4)]);
        let plan = Partitioner::new(2)
            .expect("partitioner")
            .partition(&graph, &ExportTables::default());
        assert_eq!(plan.components, 4);
        assert_eq!(plan.weights(), vec![8, 8]);
        assert!(plan.partitions[0].owns(ValueId(0)));
        assert!(plan.partitions[0].owns(ValueId(2)));
        assert!(plan.partitions[1].owns(ValueId(3)));
        assert!(plan.partitions[1].owns(ValueId(4)));
        assert!(plan.is_balanced());
    }

    #[test]
    fn more_shards_than_components_leaves_empty_shards() {
        let graph = graph(&[2, 2], &[(0, 1)]);
        let plan = Partitioner::new(3)
            .expect("partitioner")
            .partition(&graph, &ExportTables::default());
        assert_eq!(plan.weights(), vec![4, 0, 0]);
        assert!(plan.is_balanced());
    }

    #[test]
    fn zero_partitions_is_rejected() {
        assert!(Partitioner::new(0).is_err());
    }
}

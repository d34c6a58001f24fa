mod common;

use std::collections::BTreeMap;

use common::{caller, counter, declare, defined, heavy, leaf, module, pointer_table};
use imgshard::graph::ColocationPolicy;
use imgshard::ir::Module;
use imgshard::multiversion::annotate_module_clones;
use imgshard::partition::{partition_module, PartitionPlan, Partitioner};
use imgshard::target::TargetList;

fn owners(module: &Module, plan: &PartitionPlan) -> BTreeMap<String, Vec<usize>> {
    let mut owners: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for partition in &plan.partitions {
        for id in &partition.globals {
            owners
                .entry(module.name_of(*id).to_string())
                .or_default()
                .push(partition.index);
        }
    }
    owners
}

/// Components of assorted sizes, data references, a declaration and a
/// self-contained cycle.
fn mixed_module() -> Module {
    let mut m = module("mixed");
    let ext = declare(&mut m, "external_helper");
    let a = heavy(&mut m, "a", 40);
    let b = caller(&mut m, "b", &[a, ext]);
    let c = heavy(&mut m, "c", 12);
    pointer_table(&mut m, "vtable", &[b, c]);
    let d = heavy(&mut m, "d", 25);
    caller(&mut m, "e", &[d]);
    for index in 0..6 {
        heavy(&mut m, &format!("solo_{index}"), index * 3);
    }
    counter(&mut m, "hits");
    m
}

#[test]
fn every_definition_lands_in_exactly_one_partition() {
    let m = mixed_module();
    let expected = defined(&m);
    for threads in 1..=6 {
        let plan = partition_module(&m, threads, ColocationPolicy::AllReferences)
            .expect("partition");
        assert_eq!(plan.partitions.len(), threads);
        let owners = owners(&m, &plan);
        assert_eq!(
            owners.keys().cloned().collect::<std::collections::BTreeSet<_>>(),
            expected,
            "threads={threads}"
        );
        assert!(owners.values().all(|shards| shards.len() == 1));
        assert!(!owners.contains_key("external_helper"));
    }
}

#[test]
fn weight_spread_is_bounded_by_the_heaviest_component() {
    let m = mixed_module();
    for threads in 1..=6 {
        let plan = partition_module(&m, threads, ColocationPolicy::AllReferences)
            .expect("partition");
        let weights = plan.weights();
        let max = weights.iter().max().copied().unwrap_or(0);
        let min = weights.iter().min().copied().unwrap_or(0);
        assert!(
            max - min <= plan.heaviest_component,
            "threads={threads} weights={weights:?} heaviest={}",
            plan.heaviest_component
        );
        assert!(plan.is_balanced());
    }
}

#[test]
fn independent_functions_get_singleton_partitions() {
    let mut m = module("independent");
    leaf(&mut m, "f");
    leaf(&mut m, "g");
    leaf(&mut m, "h");

    let plan = partition_module(&m, 3, ColocationPolicy::AllReferences).expect("partition");
    assert!(plan.partitions.iter().all(|partition| partition.globals.len() == 1));
    let weights = plan.weights();
    assert!(weights.iter().all(|weight| *weight == weights[0]));
    assert!(weights[0] <= 3);

    let summary = annotate_module_clones(&mut m, &TargetList::parse("generic").expect("targets"))
        .expect("annotate");
    assert_eq!(summary.relocs, 0);
    assert_eq!(summary.fvars, 0);
}

#[test]
fn call_chains_stay_together() {
    let mut m = module("chain");
    let c = leaf(&mut m, "c");
    let b = caller(&mut m, "b", &[c]);
    caller(&mut m, "a", &[b]);

    let plan = partition_module(&m, 2, ColocationPolicy::AllReferences).expect("partition");
    let owners = owners(&m, &plan);
    let shard = owners["a"][0];
    assert_eq!(owners["b"], vec![shard]);
    assert_eq!(owners["c"], vec![shard]);
    let other = &plan.partitions[1 - shard];
    assert!(other.globals.is_empty());
    assert_eq!(other.weight, 0);
}

#[test]
fn data_only_policy_lets_calls_cross_shards() {
    let mut m = module("chain");
    let c = leaf(&mut m, "c");
    let b = caller(&mut m, "b", &[c]);
    caller(&mut m, "a", &[b]);
    let x = leaf(&mut m, "x");
    let y = leaf(&mut m, "y");
    pointer_table(&mut m, "table", &[x, y]);

    let plan = partition_module(&m, 3, ColocationPolicy::DataOnly).expect("partition");
    let owners = owners(&m, &plan);
    let chain: std::collections::BTreeSet<usize> =
        ["a", "b", "c"].iter().map(|name| owners[*name][0]).collect();
    assert!(chain.len() > 1, "calls alone should not merge a, b and c");
    assert_eq!(owners["x"], owners["table"]);
    assert_eq!(owners["y"], owners["table"]);
}

#[test]
fn zero_partitions_are_rejected() {
    let err = Partitioner::new(0).expect_err("zero threads");
    assert!(err.to_string().contains("partition"));
}

#[test]
fn partitioning_is_deterministic() {
    let m = mixed_module();
    let first = partition_module(&m, 4, ColocationPolicy::AllReferences).expect("first");
    let second = partition_module(&m, 4, ColocationPolicy::AllReferences).expect("second");
    assert_eq!(first.partitions, second.partitions);
}

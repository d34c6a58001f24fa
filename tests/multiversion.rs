mod common;

use common::{caller, declare, defined, export_all, heavy, leaf, module, pointer_table, vector_user};
use imgshard::ir::text::print_module;
use imgshard::ir::{
    Alias, AliasValue, Block, ConstOp, Constant, FunctionType, Instruction, Module, Opcode,
    Operand, Type, ValueId, Variable,
};
use imgshard::multiversion::{annotate_module_clones, run_multiversioning, CloneSet, ATTR_RELOC};
use imgshard::target::TargetList;

fn targets(text: &str) -> TargetList {
    TargetList::parse(text).expect("targets")
}

fn clones_of(module: &Module, name: &str) -> CloneSet {
    let id = module.lookup(name).expect("function");
    CloneSet::of(module.function(id).expect("function"))
}

/// Give the declaration `id` a body that calls `callees`.
fn define_calls(module: &mut Module, id: ValueId, callees: &[ValueId]) {
    let mut insts: Vec<Instruction> = callees
        .iter()
        .map(|callee| Instruction::call(Operand::global(*callee), FunctionType::void(), Vec::new()))
        .collect();
    insts.push(Instruction::ret(None));
    module.function_mut(id).expect("function").blocks.push(Block {
        name: "entry".into(),
        insts,
    });
}

#[test]
fn clone_all_clones_every_definition() {
    let mut m = module("all");
    let ext = declare(&mut m, "ext");
    let a = heavy(&mut m, "a", 3);
    let b = caller(&mut m, "b", &[a, ext]);
    pointer_table(&mut m, "table", &[b]);
    leaf(&mut m, "c");
    export_all(&mut m);

    let list = targets("generic;skylake,clone_all");
    annotate_module_clones(&mut m, &list).expect("annotate");
    let functions: Vec<String> = m
        .functions()
        .filter(|(_, function)| !function.is_declaration())
        .map(|(id, _)| m.name_of(id).to_string())
        .collect();
    let stats = run_multiversioning(&mut m, &list).expect("multiversion");

    assert_eq!(stats.clones, functions.len());
    for name in &functions {
        let clone = m
            .lookup(&format!("{name}.1"))
            .unwrap_or_else(|| panic!("missing clone of {name}"));
        assert!(!m.is_declaration(clone), "{name}.1 has no body");
    }
    assert!(m.lookup("ext.1").is_none());
}

#[test]
fn narrow_targets_pull_in_callees_that_call_back() {
    let mut m = module("narrow");
    let w = declare(&mut m, "W");
    let v = vector_user(&mut m, "V", &[w]);
    define_calls(&mut m, w, &[v]);
    caller(&mut m, "G", &[v]);
    let d = leaf(&mut m, "D");
    pointer_table(&mut m, "table", &[d]);

    let summary =
        annotate_module_clones(&mut m, &targets("generic;haswell,+avx2,clone_simd")).expect("annotate");
    assert_eq!(summary.cloned, vec![0, 2]);
    assert!(clones_of(&m, "V").contains(1));
    assert!(clones_of(&m, "W").contains(1));
    assert!(clones_of(&m, "G").is_empty());
    assert!(clones_of(&m, "D").is_empty());
}

#[test]
fn baseline_callers_load_narrow_callees_through_their_slot() {
    let mut m = module("scenario");
    let f = vector_user(&mut m, "F", &[]);
    caller(&mut m, "G", &[f]);
    export_all(&mut m);

    let list = targets("generic;haswell,+avx2,clone_simd");
    let summary = annotate_module_clones(&mut m, &list).expect("annotate");
    assert_eq!(summary.relocs, 1);
    assert!(m.function(f).expect("F").has_attr(ATTR_RELOC));

    let stats = run_multiversioning(&mut m, &list).expect("multiversion");
    assert!(m.lookup("F.1").is_some());
    assert!(m.lookup("G.1").is_none());
    assert_eq!(stats.const_slots, 1);
    assert_eq!(stats.rewritten_uses, 1);

    let slot = m.lookup("F.reloc_slot").expect("slot");
    let g = m.function(m.lookup("G").expect("G")).expect("G body");
    let first = &g.blocks[0].insts[0];
    assert_eq!(first.opcode, Opcode::Load);
    assert_eq!(first.operands, vec![Operand::global(slot)]);
    let call = g
        .instructions()
        .find(|inst| matches!(inst.opcode, Opcode::Call { .. }))
        .expect("call");
    assert!(matches!(call.operands[0], Operand::Local(_)));
    assert_eq!(call.direct_callee(), None);
}

#[test]
fn initializer_references_are_nulled_and_recorded() {
    let mut m = module("table");
    let f = vector_user(&mut m, "F", &[]);
    let table = pointer_table(&mut m, "table", &[f]);
    export_all(&mut m);

    let list = targets("generic;haswell,+avx2,clone_simd");
    let summary = annotate_module_clones(&mut m, &list).expect("annotate");
    assert_eq!(summary.fvars, 1);
    assert_eq!(summary.relocs, 0);

    let stats = run_multiversioning(&mut m, &list).expect("multiversion");
    assert_eq!(stats.gv_relocs, 1);
    let variable = m
        .get(table)
        .and_then(|value| value.as_variable())
        .expect("table");
    assert!(!variable.constant);
    let init = variable.initializer.as_ref().expect("initializer");
    assert!(!init.referenced_globals().contains(&f));
    assert_eq!(init.children()[0], Constant::null_ptr());
}

#[test]
fn multiversioning_is_deterministic() {
    fn build() -> Module {
        let mut m = module("repeat");
        let w = declare(&mut m, "W");
        let v = vector_user(&mut m, "V", &[w]);
        define_calls(&mut m, w, &[v]);
        let g = caller(&mut m, "G", &[v]);
        pointer_table(&mut m, "table", &[g, v]);
        export_all(&mut m);
        m
    }
    let list = targets("generic;haswell,+avx2,clone_simd;skylake,clone_all");
    let mut first = build();
    let mut second = build();
    annotate_module_clones(&mut first, &list).expect("annotate first");
    annotate_module_clones(&mut second, &list).expect("annotate second");
    run_multiversioning(&mut first, &list).expect("first");
    run_multiversioning(&mut second, &list).expect("second");
    assert_eq!(print_module(&first), print_module(&second));
    assert_eq!(defined(&first), defined(&second));
}

#[test]
fn annotating_twice_is_rejected() {
    let mut m = module("twice");
    vector_user(&mut m, "F", &[]);
    let list = targets("generic;haswell,clone_simd");
    annotate_module_clones(&mut m, &list).expect("first");
    let err = annotate_module_clones(&mut m, &list).expect_err("second");
    assert!(err.to_string().contains("already annotated"));
}

/// `F + 8` as a pointer: refers to F without preserving its address bits.
fn offset_into(f: ValueId) -> Constant {
    Constant::Expr {
        op: ConstOp::GetElementPtr,
        ty: Type::Ptr,
        operands: vec![Constant::global(f), Constant::i64(8)],
    }
}

#[test]
fn arithmetic_on_a_multiversioned_address_in_an_initializer_is_fatal() {
    let mut m = module("shifted");
    let f = vector_user(&mut m, "F", &[]);
    let shifted = Constant::Expr {
        op: ConstOp::Add,
        ty: Type::i64(),
        operands: vec![Constant::ptr_to_int(Constant::global(f)), Constant::i64(4)],
    };
    m.add_variable("shifted", Variable::new(Type::i64(), shifted))
        .expect("shifted");
    export_all(&mut m);

    let list = targets("generic;haswell,+avx2,clone_simd");
    annotate_module_clones(&mut m, &list).expect("annotate");
    let err = run_multiversioning(&mut m, &list).expect_err("arithmetic use");
    assert!(err.is_fatal());
    assert!(err.to_string().contains("through arithmetic"), "{err}");
}

#[test]
fn aliases_into_the_middle_of_a_multiversioned_function_are_fatal() {
    let mut m = module("interior");
    let f = vector_user(&mut m, "F", &[]);
    export_all(&mut m);
    m.add_alias(
        "F_interior",
        Alias {
            value: AliasValue::Function(FunctionType::void()),
            aliasee: offset_into(f),
        },
    )
    .expect("alias");

    let list = targets("generic;haswell,+avx2,clone_simd");
    let summary = annotate_module_clones(&mut m, &list).expect("annotate");
    assert_eq!(summary.relocs, 1);
    let err = run_multiversioning(&mut m, &list).expect_err("interior alias");
    assert!(err.is_fatal());
    assert!(
        err.to_string()
            .contains("alias 'F_interior' refers to multiversioned 'F' through arithmetic"),
        "{err}"
    );
}

#[test]
fn narrow_targets_may_derive_from_a_clone_all_target() {
    let mut m = module("grouped");
    let f = vector_user(&mut m, "F", &[]);
    caller(&mut m, "G", &[f]);
    export_all(&mut m);

    let list = targets("generic;skylake,+avx,clone_all;haswell,+avx,+avx2,clone_simd,base(1)");
    let summary = annotate_module_clones(&mut m, &list).expect("annotate");
    assert_eq!(summary.relocs, 1);
    run_multiversioning(&mut m, &list).expect("multiversion");

    for name in ["F.1", "G.1", "F.2"] {
        let id = m.lookup(name).unwrap_or_else(|| panic!("missing {name}"));
        assert!(!m.is_declaration(id), "{name} has no body");
    }
    assert!(m.lookup("G.2").is_none());
    let f2 = m.function(m.lookup("F.2").expect("F.2")).expect("F.2 body");
    assert_eq!(f2.attr("target-cpu"), Some("haswell"));
    assert_eq!(f2.attr("mv.clone"), Some("1"));

    // G.1 runs on the skylake group, where F has a haswell clone G lacks.
    let g1 = m.function(m.lookup("G.1").expect("G.1")).expect("G.1 body");
    let slot = m.lookup("F.reloc_slot").expect("slot");
    assert_eq!(g1.blocks[0].insts[0].operands, vec![Operand::global(slot)]);
}

#[test]
fn narrow_bases_are_rejected_before_cloning() {
    let err = TargetList::parse("generic;haswell,clone_simd;x,base(1)").expect_err("narrow base");
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("base(1)"), "{err}");
}

//! Deterministic textual form of a module.

use std::fmt::Write as _;

use super::{
    AggregateKind, AliasValue, Constant, Function, GlobalKind, GlobalValue, Instruction, Linkage,
    Module, Operand, Visibility,
};

/// Render `module` as text. Output depends only on module contents.
#[must_use]
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; module '{}'", module.name);
    let _ = writeln!(out, "target triple = \"{}\"", module.triple);
    for (name, value) in &module.flags {
        let _ = writeln!(out, "!flag {name} = \"{value}\"");
    }
    if !module.exports.functions.is_empty() || !module.exports.globals.is_empty() {
        let names = |ids: &[super::ValueId]| {
            ids.iter()
                .map(|id| format!("@{}", module.name_of(*id)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(out, "!exports functions = [{}]", names(&module.exports.functions));
        let _ = writeln!(out, "!exports globals = [{}]", names(&module.exports.globals));
    }
    for (_, value) in module.iter() {
        out.push('\n');
        print_global(&mut out, module, value);
    }
    out
}

fn header(value: &GlobalValue) -> String {
    let mut words = Vec::new();
    match value.linkage {
        Linkage::External => {}
        Linkage::Internal => words.push("internal"),
        Linkage::Private => words.push("private"),
    }
    if value.visibility == Visibility::Hidden {
        words.push("hidden");
    }
    if value.dso_local {
        words.push("dso_local");
    }
    if value.dll_export {
        words.push("dllexport");
    }
    let mut rendered = words.join(" ");
    if !rendered.is_empty() {
        rendered.push(' ');
    }
    rendered
}

fn print_global(out: &mut String, module: &Module, value: &GlobalValue) {
    let prefix = header(value);
    match &value.kind {
        GlobalKind::Variable(variable) => {
            let keyword = if variable.constant { "constant" } else { "global" };
            match &variable.initializer {
                Some(init) => {
                    let _ = write!(
                        out,
                        "@{} = {prefix}{keyword} {} {}",
                        value.name,
                        variable.ty,
                        constant_text(module, init)
                    );
                }
                None => {
                    let _ = write!(out, "@{} = external {prefix}{keyword} {}", value.name, variable.ty);
                }
            }
            if let Some(align) = variable.align {
                let _ = write!(out, ", align {align}");
            }
            out.push('\n');
        }
        GlobalKind::Alias(alias) => {
            let ty = match &alias.value {
                AliasValue::Function(fn_ty) => fn_ty.to_string(),
                AliasValue::Data(ty) => ty.to_string(),
            };
            let _ = writeln!(
                out,
                "@{} = {prefix}alias {ty}, {}",
                value.name,
                constant_text(module, &alias.aliasee)
            );
        }
        GlobalKind::Function(function) => print_function(out, module, value, &prefix, function),
    }
}

fn print_function(
    out: &mut String,
    module: &Module,
    value: &GlobalValue,
    prefix: &str,
    function: &Function,
) {
    let keyword = if function.is_declaration() { "declare" } else { "define" };
    let params = function
        .ty
        .params
        .iter()
        .enumerate()
        .map(|(index, ty)| format!("{ty} %arg{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(
        out,
        "{keyword} {prefix}{} @{}({params})",
        function.ty.ret, value.name
    );
    if !function.attrs.is_empty() {
        let attrs = function
            .attrs
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    format!("\"{key}\"")
                } else {
                    format!("\"{key}\"=\"{value}\"")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let _ = write!(out, " {attrs}");
    }
    if function.is_declaration() {
        out.push('\n');
        return;
    }
    out.push_str(" {\n");
    for (index, block) in function.blocks.iter().enumerate() {
        let _ = writeln!(out, "{}:", block_label(function, index));
        for inst in &block.insts {
            let _ = writeln!(out, "  {}", instruction_text(module, function, inst));
        }
    }
    out.push_str("}\n");
}

fn block_label(function: &Function, index: usize) -> String {
    match function.blocks.get(index) {
        Some(block) if !block.name.is_empty() => block.name.clone(),
        _ => format!("bb{index}"),
    }
}

fn instruction_text(module: &Module, function: &Function, inst: &Instruction) -> String {
    let mut text = String::new();
    if let Some(result) = inst.result {
        let _ = write!(text, "%{} = ", result.0);
    }
    if inst.tail {
        text.push_str("tail ");
    }
    text.push_str(inst.opcode.mnemonic());
    if inst.fast_math {
        text.push_str(" fast");
    }
    match &inst.opcode {
        super::Opcode::Call { fn_ty } => {
            let _ = write!(text, " {fn_ty}");
        }
        super::Opcode::ExtractValue { index } | super::Opcode::InsertValue { index } => {
            let _ = write!(text, " [{index}]");
        }
        _ => {
            if !inst.ty.is_void() {
                let _ = write!(text, " {}", inst.ty);
            }
        }
    }
    let operands = inst
        .operands
        .iter()
        .map(|operand| operand_text(module, function, operand))
        .collect::<Vec<_>>()
        .join(", ");
    if !operands.is_empty() {
        let _ = write!(text, " {operands}");
    }
    for (key, value) in &inst.metadata {
        let _ = write!(text, ", !{key} !\"{value}\"");
    }
    text
}

fn operand_text(module: &Module, function: &Function, operand: &Operand) -> String {
    match operand {
        Operand::Local(local) => format!("%{}", local.0),
        Operand::Arg(index) => format!("%arg{index}"),
        Operand::Block(index) => format!("label %{}", block_label(function, *index)),
        Operand::Const(constant) => constant_text(module, constant),
    }
}

/// Render one constant tree.
#[must_use]
pub fn constant_text(module: &Module, constant: &Constant) -> String {
    match constant {
        Constant::Null(ty) => {
            if matches!(ty, super::Type::Ptr) {
                "null".to_string()
            } else {
                format!("zeroinitializer<{ty}>")
            }
        }
        Constant::Undef(ty) => format!("undef<{ty}>"),
        Constant::Int { ty, value } => format!("{ty} {value}"),
        Constant::Float { ty, bits } => format!("{ty} 0x{bits:016x}"),
        Constant::Bytes(bytes) => {
            let mut text = String::from("c\"");
            for byte in bytes {
                if byte.is_ascii_alphanumeric() || *byte == b' ' || *byte == b'_' {
                    text.push(char::from(*byte));
                } else {
                    let _ = write!(text, "\\{byte:02X}");
                }
            }
            text.push('"');
            text
        }
        Constant::Global(id) => format!("@{}", module.name_of(*id)),
        Constant::Expr { op, ty, operands } => {
            let inner = operands
                .iter()
                .map(|operand| constant_text(module, operand))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} ({inner}) to {ty}", op.mnemonic())
        }
        Constant::Aggregate { kind, elements, .. } => {
            let (open, close) = match kind {
                AggregateKind::Array => ("[", "]"),
                AggregateKind::Struct => ("{ ", " }"),
                AggregateKind::Vector => ("<", ">"),
            };
            let inner = elements
                .iter()
                .map(|element| constant_text(module, element))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{open}{inner}{close}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, FunctionType, Type, Variable};

    #[test]
    fn prints_declarations_and_definitions() {
        let mut module = Module::new("demo", "x86_64-unknown-linux-gnu");
        let callee = module
            .add_function("callee", Function::declaration(FunctionType::void()))
            .expect("callee");
        let mut caller = Function::declaration(FunctionType::void());
        caller.blocks.push(Block {
            name: "top".into(),
            insts: vec![
                Instruction::call(Operand::global(callee), FunctionType::void(), Vec::new()),
                Instruction::ret(None),
            ],
        });
        caller.set_attr("target-cpu", "haswell");
        module.add_function("caller", caller).expect("caller");
        module
            .add_variable("slot", Variable::new(Type::Ptr, Constant::null_ptr()))
            .expect("slot");
        let text = print_module(&module);
        expect_test::expect![[r#"
            ; module 'demo'
            target triple = "x86_64-unknown-linux-gnu"

            declare void @callee()

            define void @caller() "target-cpu"="haswell" {
            top:
              call void () @callee
              ret
            }

            @slot = global ptr null
        "#]]
        .assert_eq(&text);
    }
}

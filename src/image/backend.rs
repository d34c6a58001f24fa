//! Code generators that turn a finished shard module into artifacts.
//!
//! [`ReferenceBackend`] needs no toolchain: it writes relocatable objects
//! with the `object` crate and a deterministic assembly listing.
//! [`ExternalToolBackend`] hands the textual IR to a configured program.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::str::FromStr;

use object::macho;
use object::write::{
    MachOBuildVersion, Object, Relocation, SectionId, StandardSection, Symbol, SymbolId,
    SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use serde::{Deserialize, Serialize};
use target_lexicon::{Architecture as TripleArch, OperatingSystem, Triple};

use crate::error::{Error, Result};
use crate::ir::eval::{self, Fixup, Scalar};
use crate::ir::{cfg, text, Function, GlobalKind, GlobalValue, Linkage, Module, Opcode, Operand};
use crate::ir::{ValueId, Visibility};

/// Bytes of text laid out per instruction, plus one slot for the prologue.
pub const BYTES_PER_INSTRUCTION: u64 = 16;
pub const FUNCTION_ALIGN: u64 = 16;

#[must_use]
pub fn function_size(function: &Function) -> u64 {
    BYTES_PER_INSTRUCTION * (1 + function.instruction_count() as u64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptLevel {
    #[serde(rename = "0")]
    O0,
    #[serde(rename = "1")]
    O1,
    #[default]
    #[serde(rename = "2")]
    O2,
    #[serde(rename = "3")]
    O3,
}

impl OptLevel {
    #[must_use]
    pub fn as_flag(self) -> &'static str {
        match self {
            OptLevel::O0 => "0",
            OptLevel::O1 => "1",
            OptLevel::O2 => "2",
            OptLevel::O3 => "3",
        }
    }
}

impl FromStr for OptLevel {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().trim_start_matches(['O', 'o']) {
            "0" => Ok(OptLevel::O0),
            "1" => Ok(OptLevel::O1),
            "2" => Ok(OptLevel::O2),
            "3" => Ok(OptLevel::O3),
            other => Err(Error::config(format!("unknown optimization level `{other}`"))),
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.as_flag())
    }
}

pub trait CodegenBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Optimize `module` in place; the result must still verify.
    fn optimize(&self, module: &mut Module, level: OptLevel) -> Result<()>;

    fn emit_object(&self, module: &Module) -> Result<Vec<u8>>;

    fn emit_assembly(&self, module: &Module) -> Result<Vec<u8>>;
}

/// Drop blocks unreachable from the entry, renumbering branch targets.
pub fn remove_unreachable_blocks(function: &mut Function) -> usize {
    let live = cfg::reachable(function);
    if live.iter().all(|alive| *alive) {
        return 0;
    }
    let mut remap = vec![None; live.len()];
    let mut next = 0;
    for (index, alive) in live.iter().enumerate() {
        if *alive {
            remap[index] = Some(next);
            next += 1;
        }
    }
    let removed = live.len() - next;
    let blocks = std::mem::take(&mut function.blocks);
    function.blocks = blocks
        .into_iter()
        .zip(live)
        .filter_map(|(block, alive)| alive.then_some(block))
        .collect();

    for inst in function
        .blocks
        .iter_mut()
        .flat_map(|block| block.insts.iter_mut())
    {
        if matches!(inst.opcode, Opcode::Phi) {
            let mut kept = Vec::with_capacity(inst.operands.len());
            for pair in inst.operands.chunks(2) {
                if let [value, Operand::Block(block)] = pair {
                    if let Some(block) = remap.get(*block).copied().flatten() {
                        kept.push(value.clone());
                        kept.push(Operand::Block(block));
                    }
                }
            }
            inst.operands = kept;
        } else {
            for operand in &mut inst.operands {
                if let Operand::Block(block) = operand {
                    if let Some(target) = remap.get(*block).copied().flatten() {
                        *block = target;
                    }
                }
            }
        }
    }
    removed
}

fn prune_module(module: &mut Module) -> usize {
    let mut removed = 0;
    for id in module.ids() {
        if let Some(function) = module.get_mut(id).and_then(GlobalValue::as_function_mut) {
            removed += remove_unreachable_blocks(function);
        }
    }
    removed
}

/// Map a target triple to the object format, architecture and endianness.
pub(crate) fn map_triple(triple: &Triple) -> Option<(BinaryFormat, Architecture, Endianness)> {
    let architecture = match triple.architecture {
        TripleArch::X86_64 => Architecture::X86_64,
        TripleArch::Aarch64(_) => Architecture::Aarch64,
        _ => return None,
    };
    let format = match triple.operating_system {
        OperatingSystem::Darwin(_) | OperatingSystem::MacOSX(_) | OperatingSystem::IOS(_) => {
            BinaryFormat::MachO
        }
        OperatingSystem::Windows => BinaryFormat::Coff,
        OperatingSystem::Linux
        | OperatingSystem::Unknown
        | OperatingSystem::None_
        | OperatingSystem::Hurd => BinaryFormat::Elf,
        _ => return None,
    };
    Some((format, architecture, Endianness::Little))
}

/// Mach-O build version `(minos, sdk)` for macOS triples.
pub(crate) fn macos_build_version(os: &OperatingSystem) -> Option<(u32, u32)> {
    match os {
        OperatingSystem::MacOSX(target) | OperatingSystem::Darwin(target) => {
            let encoded = target
                .map(|deploy| {
                    encode_macos_version(
                        u32::from(deploy.major),
                        u32::from(deploy.minor),
                        u32::from(deploy.patch),
                    )
                })
                .unwrap_or_else(|| encode_macos_version(11, 0, 0));
            Some((encoded, encoded))
        }
        _ => None,
    }
}

/// Pack a macOS version the way the Mach-O build version command expects.
pub(crate) fn encode_macos_version(major: u32, minor: u32, patch: u32) -> u32 {
    ((major & 0xFFFF) << 16) | ((minor & 0xFF) << 8) | (patch & 0xFF)
}

fn parse_triple(module: &Module) -> Result<Triple> {
    Triple::from_str(&module.triple).map_err(|err| {
        Error::codegen(format!(
            "failed to parse target triple '{}': {err}",
            module.triple
        ))
    })
}

fn symbol_scope(value: &GlobalValue) -> SymbolScope {
    match (value.linkage, value.visibility) {
        (Linkage::Internal | Linkage::Private, _) => SymbolScope::Compilation,
        (Linkage::External, Visibility::Hidden) => SymbolScope::Linkage,
        (Linkage::External, Visibility::Default) => SymbolScope::Dynamic,
    }
}

fn trap_fill(arch: Architecture) -> &'static [u8] {
    match arch {
        // brk #0
        Architecture::Aarch64 => &[0x00, 0x00, 0x20, 0xd4],
        // int3
        _ => &[0xcc],
    }
}

/// Writes objects and listings without an external toolchain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend;

struct Placed {
    section: SectionId,
    offset: u64,
    symbol: SymbolId,
}

impl ReferenceBackend {
    fn build_object(module: &Module) -> Result<Vec<u8>> {
        let triple = parse_triple(module)?;
        let (format, arch, endianness) = map_triple(&triple).ok_or_else(|| {
            Error::codegen(format!(
                "unsupported target triple '{}' for object emission",
                module.triple
            ))
        })?;
        let mut object = Object::new(format, arch, endianness);
        if format == BinaryFormat::MachO {
            if let Some((minos, sdk)) = macos_build_version(&triple.operating_system) {
                let mut build_version = MachOBuildVersion::default();
                build_version.platform = macho::PLATFORM_MACOS;
                build_version.minos = minos;
                build_version.sdk = sdk;
                object.set_macho_build_version(build_version);
            }
        }
        let text = object.section_id(StandardSection::Text);
        let data = object.section_id(StandardSection::Data);
        let rodata = object.section_id(StandardSection::ReadOnlyData);

        let mut placed: HashMap<ValueId, Placed> = HashMap::new();
        let mut pending: Vec<(SectionId, u64, Vec<Fixup>)> = Vec::new();
        let fill = trap_fill(arch);

        for (id, value) in module.iter() {
            let (section, offset, size, kind, fixups) = match &value.kind {
                GlobalKind::Function(function) if !function.is_declaration() => {
                    let size = function_size(function);
                    let body: Vec<u8> = fill.iter().copied().cycle().take(size as usize).collect();
                    let offset = object.append_section_data(text, &body, FUNCTION_ALIGN);
                    (text, offset, size, SymbolKind::Text, Vec::new())
                }
                GlobalKind::Variable(variable) => {
                    let Some(init) = &variable.initializer else {
                        continue;
                    };
                    let encoded = eval::encode(init)?;
                    let section = if variable.constant { rodata } else { data };
                    let offset =
                        object.append_section_data(section, &encoded.bytes, variable.alignment());
                    (
                        section,
                        offset,
                        encoded.bytes.len() as u64,
                        SymbolKind::Data,
                        encoded.fixups,
                    )
                }
                _ => continue,
            };
            let symbol = object.add_symbol(Symbol {
                name: value.name.as_bytes().to_vec(),
                value: offset,
                size,
                kind,
                scope: symbol_scope(value),
                weak: false,
                section: SymbolSection::Section(section),
                flags: SymbolFlags::None,
            });
            if !fixups.is_empty() {
                pending.push((section, offset, fixups));
            }
            placed.insert(
                id,
                Placed {
                    section,
                    offset,
                    symbol,
                },
            );
        }

        Self::place_aliases(module, &mut object, &mut placed)?;

        if format == BinaryFormat::Coff {
            let directives = export_directives(module);
            if !directives.is_empty() {
                let drectve =
                    object.add_section(Vec::new(), b".drectve".to_vec(), SectionKind::Linker);
                object.append_section_data(drectve, directives.as_bytes(), 1);
            }
        }

        let mut undefined: HashMap<ValueId, SymbolId> = HashMap::new();
        let mut symbol_for = |object: &mut Object<'_>, id: ValueId| -> Result<SymbolId> {
            if let Some(placed) = placed.get(&id) {
                return Ok(placed.symbol);
            }
            if let Some(symbol) = undefined.get(&id) {
                return Ok(*symbol);
            }
            let value = module.value(id)?;
            let kind = match value.kind {
                GlobalKind::Function(_) => SymbolKind::Text,
                _ => SymbolKind::Data,
            };
            let symbol = object.add_symbol(Symbol {
                name: value.name.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            undefined.insert(id, symbol);
            Ok(symbol)
        };

        // Declarations referenced only from code still need an undefined symbol.
        for (_, function) in module.functions() {
            for inst in function.instructions() {
                for operand in &inst.operands {
                    if let Operand::Const(constant) = operand {
                        for id in constant.referenced_globals() {
                            if module.is_declaration(id) {
                                symbol_for(&mut object, id)?;
                            }
                        }
                    }
                }
            }
        }

        let mut unrepresentable = 0usize;
        for (section, base, fixups) in pending {
            for fixup in fixups {
                let offset = base + fixup.offset;
                let size = fixup.width * 8;
                match fixup.value {
                    Scalar::Int(_) => {}
                    Scalar::Address { target, addend } => {
                        let symbol = symbol_for(&mut object, target)?;
                        add_relocation(&mut object, section, offset, symbol, addend, RelocationKind::Absolute, size)?;
                    }
                    Scalar::Difference {
                        plus,
                        minus,
                        addend,
                    } => {
                        let same_section = |id: ValueId| {
                            placed.get(&id).filter(|placed| placed.section == section).map(|placed| placed.offset)
                        };
                        match (same_section(plus), same_section(minus)) {
                            (Some(plus), Some(minus)) => {
                                let value = (plus as i64) - (minus as i64) + addend;
                                let bytes = object.section_mut(section).data_mut();
                                eval::write_int(bytes, offset, usize::from(fixup.width), value)?;
                            }
                            (_, Some(minus)) => {
                                // plus - minus == plus - place + (place - minus)
                                let symbol = symbol_for(&mut object, plus)?;
                                let addend = addend + (offset as i64 - minus as i64);
                                add_relocation(&mut object, section, offset, symbol, addend, RelocationKind::Relative, size)?;
                            }
                            _ => unrepresentable += 1,
                        }
                    }
                }
            }
        }
        if unrepresentable > 0 {
            tracing::debug!(
                target: "image",
                stage = "emit",
                module = %module.name,
                unrepresentable,
                "cross-section differences left for the loader"
            );
        }

        object
            .write()
            .map_err(|err| Error::codegen(format!("failed to write object for {}: {err}", module.name)))
    }

    fn place_aliases(
        module: &Module,
        object: &mut Object<'_>,
        placed: &mut HashMap<ValueId, Placed>,
    ) -> Result<()> {
        let mut pending: Vec<(ValueId, &GlobalValue)> = module
            .iter()
            .filter(|(_, value)| value.as_alias().is_some())
            .collect();
        let text = object.section_id(StandardSection::Text);
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for (id, value) in pending {
                let Some(alias) = value.as_alias() else {
                    continue;
                };
                let (target, addend) = match eval::evaluate(&alias.aliasee)? {
                    Scalar::Address { target, addend } => (target, addend),
                    _ => {
                        return Err(Error::codegen(format!(
                            "alias `{}` does not resolve to an address",
                            value.name
                        )))
                    }
                };
                let Some(aliasee) = placed.get(&target) else {
                    waiting.push((id, value));
                    continue;
                };
                let section = aliasee.section;
                let offset = (aliasee.offset as i64 + addend) as u64;
                let symbol = object.add_symbol(Symbol {
                    name: value.name.as_bytes().to_vec(),
                    value: offset,
                    size: 0,
                    kind: if section == text {
                        SymbolKind::Text
                    } else {
                        SymbolKind::Data
                    },
                    scope: symbol_scope(value),
                    weak: false,
                    section: SymbolSection::Section(section),
                    flags: SymbolFlags::None,
                });
                placed.insert(
                    id,
                    Placed {
                        section,
                        offset,
                        symbol,
                    },
                );
            }
            if waiting.len() == before {
                let names: Vec<_> = waiting.iter().map(|(_, value)| value.name.as_str()).collect();
                return Err(Error::codegen(format!(
                    "aliases without a defined aliasee: {}",
                    names.join(", ")
                )));
            }
            pending = waiting;
        }
        Ok(())
    }
}

fn add_relocation(
    object: &mut Object<'_>,
    section: SectionId,
    offset: u64,
    symbol: SymbolId,
    addend: i64,
    kind: RelocationKind,
    size: u8,
) -> Result<()> {
    object
        .add_relocation(
            section,
            Relocation {
                offset,
                symbol,
                addend,
                flags: RelocationFlags::Generic {
                    kind,
                    encoding: RelocationEncoding::Generic,
                    size,
                },
            },
        )
        .map_err(|err| Error::codegen(format!("unsupported relocation at {offset:#x}: {err}")))
}

fn directive_for(width: u8) -> &'static str {
    match width {
        1 => ".byte",
        2 => ".short",
        4 => ".long",
        _ => ".quad",
    }
}

fn scalar_text(module: &Module, value: Scalar) -> String {
    let with_addend = |base: String, addend: i64| match addend {
        0 => base,
        positive if positive > 0 => format!("{base}+{positive}"),
        negative => format!("{base}{negative}"),
    };
    match value {
        Scalar::Int(value) => value.to_string(),
        Scalar::Address { target, addend } => with_addend(module.name_of(target).to_string(), addend),
        Scalar::Difference {
            plus,
            minus,
            addend,
        } => with_addend(
            format!("{}-{}", module.name_of(plus), module.name_of(minus)),
            addend,
        ),
    }
}

/// Linker directives exporting every `dll_export` definition from the DLL.
fn export_directives(module: &Module) -> String {
    let mut directives = String::new();
    for (_, value) in module.iter() {
        if !value.dll_export || value.is_declaration() {
            continue;
        }
        let data = if value.as_function().is_some() { "" } else { ",DATA" };
        let _ = write!(directives, " /EXPORT:{}{data}", value.name);
    }
    directives
}

fn write_listing(module: &Module) -> Result<String> {
    let mut out = String::new();
    emit(&mut out, format_args!("\t.file\t\"{}\"", module.name));
    emit(&mut out, format_args!("\t# triple {}", module.triple));

    emit(&mut out, format_args!("\t.text"));
    for (_, value) in module.iter() {
        let GlobalKind::Function(function) = &value.kind else {
            continue;
        };
        if function.is_declaration() {
            continue;
        }
        emit_visibility(&mut out, value);
        if let Some(cpu) = function.attr("target-cpu") {
            emit(&mut out, format_args!("\t# target-cpu {cpu}"));
        }
        if let Some(features) = function.attr("target-features") {
            emit(&mut out, format_args!("\t# target-features {features}"));
        }
        emit(&mut out, format_args!("\t.p2align\t4"));
        emit(&mut out, format_args!("{}:", value.name));
        for (index, block) in function.blocks.iter().enumerate() {
            emit(&mut out, format_args!(".L{}_{index}:\t# {}", value.name, block.name));
            for inst in &block.insts {
                emit(&mut out, format_args!("\t# {}", inst.opcode.mnemonic()));
            }
        }
        emit(&mut out, format_args!("\t.size\t{0}, {1}", value.name, function_size(function)));
    }

    for constant_section in [false, true] {
        let mut header = false;
        for (_, value) in module.iter() {
            let GlobalKind::Variable(variable) = &value.kind else {
                continue;
            };
            let Some(init) = &variable.initializer else {
                continue;
            };
            if variable.constant != constant_section {
                continue;
            }
            if !header {
                let section = if constant_section { "\t.section\t.rodata" } else { "\t.data" };
                emit(&mut out, format_args!("{section}"));
                header = true;
            }
            let encoded = eval::encode(init)?;
            emit_visibility(&mut out, value);
            emit(&mut out, format_args!("\t.p2align\t{}", variable.alignment().trailing_zeros()));
            emit(&mut out, format_args!("{}:", value.name));
            let mut cursor = 0u64;
            for fixup in &encoded.fixups {
                emit_bytes(&mut out, &encoded.bytes[cursor as usize..fixup.offset as usize]);
                emit(
                    &mut out,
                    format_args!("\t{}\t{}", directive_for(fixup.width), scalar_text(module, fixup.value)),
                );
                cursor = fixup.offset + u64::from(fixup.width);
            }
            emit_bytes(&mut out, &encoded.bytes[cursor as usize..]);
            emit(&mut out, format_args!("\t.size\t{}, {}", value.name, encoded.bytes.len()));
        }
    }

    for (_, value) in module.iter() {
        let Some(alias) = value.as_alias() else {
            continue;
        };
        emit_visibility(&mut out, value);
        let target = scalar_text(module, eval::evaluate(&alias.aliasee)?);
        emit(&mut out, format_args!("\t.set\t{}, {target}", value.name));
    }

    let directives = export_directives(module);
    if !directives.is_empty() {
        emit(&mut out, format_args!("\t.section\t.drectve,\"yni\""));
        emit(&mut out, format_args!("\t.ascii\t\"{directives}\""));
    }
    Ok(out)
}

fn emit(out: &mut String, line: fmt::Arguments<'_>) {
    let _ = out.write_fmt(line);
    out.push('\n');
}

fn emit_visibility(out: &mut String, value: &GlobalValue) {
    if value.linkage.is_local() {
        return;
    }
    let _ = writeln!(out, "\t.globl\t{}", value.name);
    if value.visibility == Visibility::Hidden {
        let _ = writeln!(out, "\t.hidden\t{}", value.name);
    }
}

fn emit_bytes(out: &mut String, bytes: &[u8]) {
    for chunk in bytes.chunks(16) {
        let list: Vec<String> = chunk.iter().map(|byte| byte.to_string()).collect();
        let _ = writeln!(out, "\t.byte\t{}", list.join(","));
    }
}

impl CodegenBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn optimize(&self, module: &mut Module, level: OptLevel) -> Result<()> {
        if level == OptLevel::O0 {
            return Ok(());
        }
        let removed = prune_module(module);
        tracing::debug!(
            target: "image",
            stage = "optimize",
            module = %module.name,
            removed_blocks = removed,
            "pruned unreachable blocks"
        );
        Ok(())
    }

    fn emit_object(&self, module: &Module) -> Result<Vec<u8>> {
        Self::build_object(module)
    }

    fn emit_assembly(&self, module: &Module) -> Result<Vec<u8>> {
        write_listing(module).map(String::into_bytes)
    }
}

/// Pipes textual IR through `<program> <args...> -O<n> --emit=<kind>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalToolBackend {
    program: String,
    args: Vec<String>,
    level: OptLevel,
}

impl ExternalToolBackend {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            level: OptLevel::default(),
        }
    }

    #[must_use]
    pub fn with_opt_level(mut self, level: OptLevel) -> Self {
        self.level = level;
        self
    }

    fn run(&self, module: &Module, emit: &str) -> Result<Vec<u8>> {
        let input = text::print_module(module);
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(format!("-O{}", self.level.as_flag()))
            .arg(format!("--emit={emit}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|err| Error::codegen(format!("failed to spawn {}: {err}", self.program)))?;
        let stdin = child.stdin.take();
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(input.as_bytes()),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (output, written)
        });
        let (output, written) = output;
        let output = output
            .map_err(|err| Error::codegen(format!("failed to run {}: {err}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::codegen(format!(
                "{} --emit={emit} exited with status {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if let Err(err) = written {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(Error::codegen(format!(
                    "failed to feed IR to {}: {err}",
                    self.program
                )));
            }
        }
        Ok(output.stdout)
    }
}

impl CodegenBackend for ExternalToolBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn optimize(&self, module: &mut Module, level: OptLevel) -> Result<()> {
        // The tool optimizes during emission; only the IR-level cleanup runs here.
        if level != OptLevel::O0 {
            prune_module(module);
        }
        Ok(())
    }

    fn emit_object(&self, module: &Module) -> Result<Vec<u8>> {
        self.run(module, "obj")
    }

    fn emit_assembly(&self, module: &Module) -> Result<Vec<u8>> {
        self.run(module, "asm")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Constant, FunctionType, Instruction, Type, Variable};
    use object::{Object as _, ObjectSection as _, ObjectSymbol as _};

    fn module_with_data() -> Module {
        let mut module = Module::new("unit", "x86_64-unknown-linux-gnu");
        let mut body = Function::declaration(FunctionType::void());
        body.blocks.push(Block {
            name: "top".into(),
            insts: vec![Instruction::ret(None)],
        });
        let f = module.add_function("f", body).expect("f");
        let ext = module
            .add_function("ext", Function::declaration(FunctionType::void()))
            .expect("ext");
        module
            .add_variable(
                "table",
                Variable::new(
                    Type::array(Type::Ptr, 2),
                    Constant::ptr_array(vec![Constant::global(f), Constant::global(ext)]),
                ),
            )
            .expect("table");
        module
    }

    #[test]
    fn unreachable_blocks_are_pruned_and_branches_renumbered() {
        let mut function = Function::declaration(FunctionType::void());
        function.blocks.push(Block {
            name: "entry".into(),
            insts: vec![Instruction::br(2)],
        });
        function.blocks.push(Block {
            name: "dead".into(),
            insts: vec![Instruction::br(2)],
        });
        function.blocks.push(Block {
            name: "exit".into(),
            insts: vec![Instruction::ret(None)],
        });
        assert_eq!(remove_unreachable_blocks(&mut function), 1);
        assert_eq!(function.blocks.len(), 2);
        assert_eq!(function.blocks[0].insts[0].operands, vec![Operand::Block(1)]);
    }

    #[test]
    fn objects_carry_defined_and_undefined_symbols() {
        let module = module_with_data();
        let bytes = ReferenceBackend.emit_object(&module).expect("object");
        let file = object::File::parse(bytes.as_slice()).expect("parse");
        let names: Vec<_> = file.symbols().filter_map(|symbol| symbol.name().ok().map(str::to_string)).collect();
        assert!(names.contains(&"f".to_string()));
        assert!(names.contains(&"table".to_string()));
        let ext = file.symbols().find(|symbol| symbol.name().ok() == Some("ext")).expect("ext");
        assert!(ext.is_undefined());
        let data = file.section_by_name(".data").expect("data");
        assert_eq!(data.relocations().count(), 2);
    }

    #[test]
    fn listing_is_deterministic() {
        let module = module_with_data();
        let first = ReferenceBackend.emit_assembly(&module).expect("asm");
        let second = ReferenceBackend.emit_assembly(&module).expect("asm");
        assert_eq!(first, second);
        let text = String::from_utf8(first).expect("utf8");
        assert!(text.contains("\t.quad\tf\n"));
        assert!(text.contains("\t.quad\text\n"));
    }

    #[test]
    fn unknown_triples_are_codegen_errors() {
        let mut module = module_with_data();
        module.triple = "riscv64gc-unknown-linux-gnu".into();
        let err = ReferenceBackend.emit_object(&module).expect_err("unsupported");
        assert!(err.to_string().contains("unsupported target triple"));
    }

    #[test]
    fn darwin_triples_pick_macho() {
        let triple = Triple::from_str("aarch64-apple-darwin").expect("triple");
        let (format, arch, _) = map_triple(&triple).expect("mapped");
        assert_eq!(format, BinaryFormat::MachO);
        assert_eq!(arch, Architecture::Aarch64);
        assert_eq!(encode_macos_version(13, 3, 1), 0x000D_0301);
    }

    #[test]
    fn coff_objects_export_flagged_definitions() {
        let mut module = module_with_data();
        module.triple = "x86_64-pc-windows-msvc".into();
        for name in ["f", "table"] {
            let id = module.lookup(name).expect(name);
            module.value_mut(id).expect(name).dll_export = true;
        }
        assert_eq!(export_directives(&module), " /EXPORT:f /EXPORT:table,DATA");

        let bytes = ReferenceBackend.emit_object(&module).expect("object");
        let file = object::File::parse(bytes.as_slice()).expect("parse");
        assert_eq!(file.format(), BinaryFormat::Coff);
        let drectve = file.section_by_name(".drectve").expect("drectve");
        assert_eq!(
            drectve.data().expect("directives"),
            b" /EXPORT:f /EXPORT:table,DATA"
        );

        let listing = String::from_utf8(ReferenceBackend.emit_assembly(&module).expect("asm"))
            .expect("utf8");
        assert!(listing.contains("\t.ascii\t\" /EXPORT:f /EXPORT:table,DATA\"\n"));
    }

    #[test]
    fn opt_levels_parse() {
        assert_eq!("O3".parse::<OptLevel>().expect("level"), OptLevel::O3);
        assert_eq!("1".parse::<OptLevel>().expect("level"), OptLevel::O1);
        assert!("fast".parse::<OptLevel>().is_err());
    }
}

//! In-memory module representation shared by every image stage.
//!
//! Global values live in an arena indexed by [`ValueId`]. Erased entries are
//! tombstoned rather than compacted so identifiers stay stable across
//! serialization; shard copies deserialized from one snapshot therefore agree
//! on every id with the source module.

pub mod cfg;
pub mod constant;
pub mod eval;
pub mod text;
pub mod types;
pub mod uses;
pub mod verify;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use constant::{AggregateKind, ConstOp, Constant};
pub use types::{FunctionType, Type};

/// Stable index of a global value inside its [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl ValueId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// SSA value number local to one function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Linkage {
    #[default]
    External,
    Internal,
    Private,
}

impl Linkage {
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Linkage::Internal | Linkage::Private)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    #[default]
    Default,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalValue {
    pub name: String,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub dso_local: bool,
    /// Exported from the DLL on COFF targets.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dll_export: bool,
    pub kind: GlobalKind,
}

impl GlobalValue {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: GlobalKind) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            visibility: Visibility::Default,
            dso_local: false,
            dll_export: false,
            kind,
        }
    }

    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.visibility = Visibility::Hidden;
        self
    }

    #[must_use]
    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    #[must_use]
    pub fn is_declaration(&self) -> bool {
        match &self.kind {
            GlobalKind::Function(function) => function.is_declaration(),
            GlobalKind::Variable(variable) => variable.initializer.is_none(),
            GlobalKind::Alias(_) => false,
        }
    }

    #[must_use]
    pub fn as_function(&self) -> Option<&Function> {
        match &self.kind {
            GlobalKind::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut Function> {
        match &mut self.kind {
            GlobalKind::Function(function) => Some(function),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_variable(&self) -> Option<&Variable> {
        match &self.kind {
            GlobalKind::Variable(variable) => Some(variable),
            _ => None,
        }
    }

    pub fn as_variable_mut(&mut self) -> Option<&mut Variable> {
        match &mut self.kind {
            GlobalKind::Variable(variable) => Some(variable),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_alias(&self) -> Option<&Alias> {
        match &self.kind {
            GlobalKind::Alias(alias) => Some(alias),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            GlobalKind::Function(_) => "function",
            GlobalKind::Variable(_) => "variable",
            GlobalKind::Alias(_) => "alias",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GlobalKind {
    Function(Function),
    Variable(Variable),
    Alias(Alias),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub ty: Type,
    #[serde(default)]
    pub initializer: Option<Constant>,
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub align: Option<u64>,
}

impl Variable {
    #[must_use]
    pub fn new(ty: Type, initializer: Constant) -> Self {
        Self {
            ty,
            initializer: Some(initializer),
            constant: false,
            align: None,
        }
    }

    #[must_use]
    pub fn constant(initializer: Constant) -> Self {
        Self {
            ty: initializer.ty(),
            initializer: Some(initializer),
            constant: true,
            align: None,
        }
    }

    #[must_use]
    pub fn declaration(ty: Type) -> Self {
        Self {
            ty,
            initializer: None,
            constant: false,
            align: None,
        }
    }

    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.align.unwrap_or_else(|| self.ty.align())
    }
}

/// What an alias pretends to be once its aliasee is hidden from view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AliasValue {
    Function(FunctionType),
    Data(Type),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub value: AliasValue,
    pub aliasee: Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub ty: FunctionType,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub next_local: u32,
}

impl Function {
    #[must_use]
    pub fn declaration(ty: FunctionType) -> Self {
        Self {
            ty,
            blocks: Vec::new(),
            attrs: BTreeMap::new(),
            next_local: 0,
        }
    }

    #[must_use]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn fresh_local(&mut self) -> LocalId {
        let id = LocalId(self.next_local);
        self.next_local += 1;
        id
    }

    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Instructions plus blocks, the size estimate used for weights.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|block| block.insts.len()).sum()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|block| block.insts.iter())
    }

    /// Drop the body, leaving a declaration with the same signature.
    pub fn delete_body(&mut self) {
        self.blocks.clear();
        self.next_local = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Instruction>,
}

impl Block {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    FAdd,
    FSub,
    FMul,
    FDiv,
    ICmp,
    FCmp,
}

impl BinaryOp {
    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(
            self,
            BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv | BinaryOp::FCmp
        )
    }

    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::FAdd => "fadd",
            BinaryOp::FSub => "fsub",
            BinaryOp::FMul => "fmul",
            BinaryOp::FDiv => "fdiv",
            BinaryOp::ICmp => "icmp",
            BinaryOp::FCmp => "fcmp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Opcode {
    /// `operands[0]` is the callee, the rest are arguments.
    Call { fn_ty: FunctionType },
    /// `operands[0]` is the address; `ty` is the loaded type.
    Load,
    /// `operands = [value, address]`; `ty` is the stored value type.
    Store,
    Alloca,
    Binary(BinaryOp),
    /// A constant-expression operation applied to runtime operands.
    Expr(ConstOp),
    Select,
    ExtractValue { index: u32 },
    InsertValue { index: u32 },
    ExtractElement,
    InsertElement,
    /// Operands alternate incoming value and incoming block.
    Phi,
    Ret,
    Br,
    CondBr,
    Unreachable,
}

impl Opcode {
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Ret | Opcode::Br | Opcode::CondBr | Opcode::Unreachable
        )
    }

    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Call { .. } => "call",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Alloca => "alloca",
            Opcode::Binary(op) => op.mnemonic(),
            Opcode::Expr(op) => op.mnemonic(),
            Opcode::Select => "select",
            Opcode::ExtractValue { .. } => "extractvalue",
            Opcode::InsertValue { .. } => "insertvalue",
            Opcode::ExtractElement => "extractelement",
            Opcode::InsertElement => "insertelement",
            Opcode::Phi => "phi",
            Opcode::Ret => "ret",
            Opcode::Br => "br",
            Opcode::CondBr => "br",
            Opcode::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operand {
    Local(LocalId),
    Arg(u32),
    /// Index of a block in the enclosing function.
    Block(usize),
    Const(Constant),
}

impl Operand {
    #[must_use]
    pub fn global(id: ValueId) -> Self {
        Operand::Const(Constant::Global(id))
    }

    #[must_use]
    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(constant) => Some(constant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(default)]
    pub result: Option<LocalId>,
    pub opcode: Opcode,
    pub ty: Type,
    #[serde(default)]
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub fast_math: bool,
    #[serde(default)]
    pub tail: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, ty: Type, operands: Vec<Operand>) -> Self {
        Self {
            result: None,
            opcode,
            ty,
            operands,
            fast_math: false,
            tail: false,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_result(mut self, result: LocalId) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn call(callee: Operand, fn_ty: FunctionType, args: Vec<Operand>) -> Self {
        let ret = fn_ty.ret.clone();
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(callee);
        operands.extend(args);
        Self::new(Opcode::Call { fn_ty }, ret, operands)
    }

    #[must_use]
    pub fn ret(value: Option<Operand>) -> Self {
        match value {
            Some(value) => Self::new(Opcode::Ret, Type::Void, vec![value]),
            None => Self::new(Opcode::Ret, Type::Void, Vec::new()),
        }
    }

    #[must_use]
    pub fn br(target: usize) -> Self {
        Self::new(Opcode::Br, Type::Void, vec![Operand::Block(target)])
    }

    /// Global value called directly, when the callee operand names one.
    #[must_use]
    pub fn direct_callee(&self) -> Option<ValueId> {
        match (&self.opcode, self.operands.first()) {
            (Opcode::Call { .. }, Some(Operand::Const(Constant::Global(id)))) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn called_type(&self) -> Option<&FunctionType> {
        match &self.opcode {
            Opcode::Call { fn_ty } => Some(fn_ty),
            _ => None,
        }
    }

    pub fn successors(&self) -> impl Iterator<Item = usize> + '_ {
        let terminator = self.opcode.is_terminator();
        self.operands.iter().filter_map(move |operand| match operand {
            Operand::Block(index) if terminator => Some(*index),
            _ => None,
        })
    }
}

/// Exported function and global lists plus their original positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportTables {
    #[serde(default)]
    pub functions: Vec<ValueId>,
    #[serde(default)]
    pub function_idxs: Vec<u32>,
    #[serde(default)]
    pub globals: Vec<ValueId>,
    #[serde(default)]
    pub global_idxs: Vec<u32>,
}

impl ExportTables {
    /// Fill missing index lists with the identity mapping.
    pub fn normalize(&mut self) {
        if self.function_idxs.len() != self.functions.len() {
            self.function_idxs = (0..self.functions.len() as u32).collect();
        }
        if self.global_idxs.len() != self.globals.len() {
            self.global_idxs = (0..self.globals.len() as u32).collect();
        }
    }

    #[must_use]
    pub fn function_index(&self, id: ValueId) -> Option<u32> {
        self.functions
            .iter()
            .position(|candidate| *candidate == id)
            .map(|position| position as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default = "default_triple")]
    pub triple: String,
    #[serde(default)]
    values: Vec<Option<GlobalValue>>,
    #[serde(default)]
    symbols: BTreeMap<String, ValueId>,
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
    #[serde(default)]
    pub exports: ExportTables,
}

fn default_triple() -> String {
    "x86_64-unknown-linux-gnu".to_string()
}

impl Module {
    #[must_use]
    pub fn new(name: impl Into<String>, triple: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triple: triple.into(),
            values: Vec::new(),
            symbols: BTreeMap::new(),
            flags: BTreeMap::new(),
            exports: ExportTables::default(),
        }
    }

    /// Rebuild the symbol index from the arena; used after deserializing
    /// hand-written modules that omit it.
    pub fn reindex(&mut self) -> Result<()> {
        self.symbols.clear();
        for (index, value) in self.values.iter().enumerate() {
            if let Some(value) = value {
                let id = ValueId(index as u32);
                if self.symbols.insert(value.name.clone(), id).is_some() {
                    return Err(Error::invariant(format!(
                        "duplicate global name '{}'",
                        value.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn add(&mut self, value: GlobalValue) -> Result<ValueId> {
        if self.symbols.contains_key(&value.name) {
            return Err(Error::invariant(format!(
                "global '{}' is already defined in module '{}'",
                value.name, self.name
            )));
        }
        let id = ValueId(self.values.len() as u32);
        self.symbols.insert(value.name.clone(), id);
        self.values.push(Some(value));
        Ok(id)
    }

    pub fn add_function(&mut self, name: impl Into<String>, function: Function) -> Result<ValueId> {
        self.add(GlobalValue::new(name, GlobalKind::Function(function)))
    }

    pub fn add_variable(&mut self, name: impl Into<String>, variable: Variable) -> Result<ValueId> {
        self.add(GlobalValue::new(name, GlobalKind::Variable(variable)))
    }

    pub fn add_alias(&mut self, name: impl Into<String>, alias: Alias) -> Result<ValueId> {
        self.add(GlobalValue::new(name, GlobalKind::Alias(alias)))
    }

    #[must_use]
    pub fn get(&self, id: ValueId) -> Option<&GlobalValue> {
        self.values.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ValueId) -> Option<&mut GlobalValue> {
        self.values.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Like [`Module::get`] but a missing id is an invariant violation.
    pub fn value(&self, id: ValueId) -> Result<&GlobalValue> {
        self.get(id)
            .ok_or_else(|| Error::invariant(format!("dangling value id {id} in '{}'", self.name)))
    }

    pub fn value_mut(&mut self, id: ValueId) -> Result<&mut GlobalValue> {
        let name = self.name.clone();
        self.get_mut(id)
            .ok_or_else(|| Error::invariant(format!("dangling value id {id} in '{name}'")))
    }

    pub fn function(&self, id: ValueId) -> Result<&Function> {
        let value = self.value(id)?;
        value
            .as_function()
            .ok_or_else(|| Error::invariant(format!("'{}' is not a function", value.name)))
    }

    pub fn function_mut(&mut self, id: ValueId) -> Result<&mut Function> {
        let value = self.value_mut(id)?;
        let name = value.name.clone();
        value
            .as_function_mut()
            .ok_or_else(|| Error::invariant(format!("'{name}' is not a function")))
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ValueId> {
        self.symbols.get(name).copied()
    }

    #[must_use]
    pub fn name_of(&self, id: ValueId) -> &str {
        self.get(id).map_or("<erased>", |value| value.name.as_str())
    }

    #[must_use]
    pub fn contains(&self, id: ValueId) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn is_declaration(&self, id: ValueId) -> bool {
        self.get(id).is_some_and(GlobalValue::is_declaration)
    }

    /// Live values in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &GlobalValue)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| value.as_ref().map(|value| (ValueId(index as u32), value)))
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ValueId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn functions(&self) -> impl Iterator<Item = (ValueId, &Function)> {
        self.iter()
            .filter_map(|(id, value)| value.as_function().map(|function| (id, function)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Remove a value; its id is never reused.
    pub fn erase(&mut self, id: ValueId) -> Option<GlobalValue> {
        let value = self.values.get_mut(id.index())?.take()?;
        self.symbols.remove(&value.name);
        Some(value)
    }

    pub fn rename(&mut self, id: ValueId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if let Some(existing) = self.lookup(&name) {
            if existing == id {
                return Ok(());
            }
            return Err(Error::invariant(format!(
                "cannot rename {id} to '{name}': name already taken"
            )));
        }
        let value = self.value_mut(id)?;
        let old = std::mem::replace(&mut value.name, name.clone());
        self.symbols.remove(&old);
        self.symbols.insert(name, id);
        Ok(())
    }

    /// First free name of the form `base`, `base.1`, `base.2`, ...
    #[must_use]
    pub fn unique_name(&self, base: &str) -> String {
        if !self.symbols.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|counter| format!("{base}.{counter}"))
            .find(|candidate| !self.symbols.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.flags.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    /// Every reference to `from` is redirected to `to`: initializers,
    /// aliasees, instruction operands and export lists.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        let remap = |id: ValueId| (id == from).then_some(to);
        for value in self.values.iter_mut().flatten() {
            match &mut value.kind {
                GlobalKind::Variable(variable) => {
                    if let Some(init) = variable.initializer.as_mut() {
                        init.remap_globals(&remap);
                    }
                }
                GlobalKind::Alias(alias) => alias.aliasee.remap_globals(&remap),
                GlobalKind::Function(function) => {
                    for inst in function.blocks.iter_mut().flat_map(|b| b.insts.iter_mut()) {
                        for operand in &mut inst.operands {
                            if let Operand::Const(constant) = operand {
                                constant.remap_globals(&remap);
                            }
                        }
                    }
                }
            }
        }
        for id in self
            .exports
            .functions
            .iter_mut()
            .chain(self.exports.globals.iter_mut())
        {
            if *id == from {
                *id = to;
            }
        }
    }

    #[must_use]
    pub fn defined_count(&self) -> usize {
        self.iter().filter(|(_, value)| !value.is_declaration()).count()
    }
}

/// Serialize a module snapshot that shard workers decode independently.
pub fn serialize(module: &Module) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(module)?)
}

pub fn deserialize(bytes: &[u8]) -> Result<Module> {
    let mut module: Module = serde_json::from_slice(bytes)?;
    if module.symbols.is_empty() && !module.values.is_empty() {
        module.reindex()?;
    }
    Ok(module)
}

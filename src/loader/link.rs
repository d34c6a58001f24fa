//! A deterministic static layout of a set of modules.
//!
//! Functions are placed in a text range starting at [`TEXT_BASE`], variables
//! in a data range on the next page. Declarations resolve by name against
//! every module's non-local definitions; aliases land on their aliasee.
//! Initializers are folded to bytes with every address filled in.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::image::backend::{function_size, FUNCTION_ALIGN};
use crate::ir::eval::{self, Scalar};
use crate::ir::types::align_to;
use crate::ir::uses::UseIndex;
use crate::ir::{GlobalKind, Module, ValueId};

pub const TEXT_BASE: u64 = 0x1000;
pub const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, Default)]
pub struct LinkedImage {
    addresses: Vec<HashMap<ValueId, u64>>,
    symbols: BTreeMap<String, u64>,
    names: BTreeMap<u64, Vec<String>>,
    text_end: u64,
    data_base: u64,
    data: Vec<u8>,
}

impl LinkedImage {
    /// Address of `id` as seen from module `module`.
    #[must_use]
    pub fn address(&self, module: usize, id: ValueId) -> Option<u64> {
        self.addresses.get(module)?.get(&id).copied()
    }

    /// Address of a non-local definition.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Names of every definition placed at `address`.
    #[must_use]
    pub fn names_at(&self, address: u64) -> &[String] {
        self.names.get(&address).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_text(&self, address: u64) -> bool {
        (TEXT_BASE..self.text_end).contains(&address)
    }

    #[must_use]
    pub fn data_range(&self) -> std::ops::Range<u64> {
        self.data_base..self.data_base + self.data.len() as u64
    }

    pub fn read(&self, address: u64, len: usize) -> Result<&[u8]> {
        address
            .checked_sub(self.data_base)
            .and_then(|start| {
                let start = usize::try_from(start).ok()?;
                self.data.get(start..start.checked_add(len)?)
            })
            .ok_or_else(|| {
                Error::invariant(format!("read of {len} bytes at {address:#x} is outside data"))
            })
    }

    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read(address, 4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_i32(&self, address: u64) -> Result<i32> {
        self.read_u32(address).map(|value| value as i32)
    }

    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read(address, 8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

struct PendingData {
    module: usize,
    offset: u64,
    encoded: eval::Encoded,
}

/// Lay out and resolve `modules`.
///
/// # Errors
///
/// Duplicate non-local definitions, aliases that do not reach a definition
/// and referenced declarations nothing defines are codegen errors.
pub fn link(modules: &[&Module]) -> Result<LinkedImage> {
    let mut image = LinkedImage {
        addresses: vec![HashMap::new(); modules.len()],
        ..LinkedImage::default()
    };

    let mut cursor = TEXT_BASE;
    for (index, module) in modules.iter().enumerate() {
        for (id, value) in module.iter() {
            if let GlobalKind::Function(function) = &value.kind {
                if !function.is_declaration() {
                    cursor = align_to(cursor, FUNCTION_ALIGN);
                    image.addresses[index].insert(id, cursor);
                    cursor += function_size(function);
                }
            }
        }
    }
    image.text_end = cursor;
    image.data_base = align_to(cursor, PAGE_SIZE);

    let mut pending = Vec::new();
    let mut offset = 0u64;
    for (index, module) in modules.iter().enumerate() {
        for (id, value) in module.iter() {
            let GlobalKind::Variable(variable) = &value.kind else {
                continue;
            };
            let Some(init) = &variable.initializer else {
                continue;
            };
            let encoded = eval::encode(init)?;
            offset = align_to(offset, variable.alignment());
            image.addresses[index].insert(id, image.data_base + offset);
            let size = (encoded.bytes.len() as u64).max(variable.ty.size()).max(1);
            pending.push(PendingData {
                module: index,
                offset,
                encoded,
            });
            offset += size;
        }
    }
    image.data = vec![0; offset as usize];

    for (index, module) in modules.iter().enumerate() {
        place_aliases(&mut image, index, module)?;
    }
    for (index, module) in modules.iter().enumerate() {
        for (id, value) in module.iter() {
            let Some(address) = image.address(index, id) else {
                continue;
            };
            image.names.entry(address).or_default().push(value.name.clone());
            if value.linkage.is_local() {
                continue;
            }
            if image.symbols.insert(value.name.clone(), address).is_some() {
                return Err(Error::codegen(format!("duplicate symbol `{}`", value.name)));
            }
        }
    }
    for (index, module) in modules.iter().enumerate() {
        resolve_declarations(&mut image, index, module)?;
    }

    for data in pending {
        let base = data.offset;
        let module = data.module;
        let mut bytes = data.encoded.bytes;
        for fixup in &data.encoded.fixups {
            let value = fixup
                .value
                .resolve(|id| image.address(module, id))
                .ok_or_else(|| {
                    Error::codegen(format!(
                        "unresolved reference in `{}` at offset {}",
                        modules[module].name, fixup.offset
                    ))
                })?;
            eval::write_int(&mut bytes, fixup.offset, usize::from(fixup.width), value)?;
        }
        let start = base as usize;
        image.data[start..start + bytes.len()].copy_from_slice(&bytes);
    }
    tracing::debug!(
        target: "image",
        stage = "link",
        modules = modules.len(),
        text = image.text_end - TEXT_BASE,
        data = image.data.len(),
        "linked image"
    );
    Ok(image)
}

fn place_aliases(image: &mut LinkedImage, index: usize, module: &Module) -> Result<()> {
    let mut pending: Vec<ValueId> = module
        .iter()
        .filter(|(_, value)| value.as_alias().is_some())
        .map(|(id, _)| id)
        .collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = Vec::new();
        for id in pending {
            let Some(alias) = module.get(id).and_then(|value| value.as_alias()) else {
                continue;
            };
            match eval::evaluate(&alias.aliasee)? {
                Scalar::Address { target, addend } => match image.address(index, target) {
                    Some(address) => {
                        image.addresses[index].insert(id, address.wrapping_add_signed(addend));
                    }
                    None => waiting.push(id),
                },
                _ => {
                    return Err(Error::codegen(format!(
                        "alias `{}` does not resolve to an address",
                        module.name_of(id)
                    )))
                }
            }
        }
        if waiting.len() == before {
            let names: Vec<_> = waiting.iter().map(|id| module.name_of(*id)).collect();
            return Err(Error::codegen(format!(
                "aliases without a defined aliasee: {}",
                names.join(", ")
            )));
        }
        pending = waiting;
    }
    Ok(())
}

fn resolve_declarations(image: &mut LinkedImage, index: usize, module: &Module) -> Result<()> {
    let uses = UseIndex::build(module);
    for target in uses.targets() {
        if !module.is_declaration(target) || image.address(index, target).is_some() {
            continue;
        }
        let name = module.name_of(target);
        let address = image
            .symbol(name)
            .ok_or_else(|| Error::codegen(format!("undefined symbol `{name}` in `{}`", module.name)))?;
        image.addresses[index].insert(target, address);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Alias, AliasValue, Block, Constant, Function, FunctionType, Instruction, Type, Variable,
    };

    fn body() -> Function {
        let mut function = Function::declaration(FunctionType::void());
        function.blocks.push(Block {
            name: "top".into(),
            insts: vec![Instruction::ret(None)],
        });
        function
    }

    #[test]
    fn declarations_resolve_across_modules() {
        let mut lib = Module::new("lib", "x86_64-unknown-linux-gnu");
        let f = lib.add_function("f", body()).expect("f");
        lib.add_alias(
            "f_alias",
            Alias {
                value: AliasValue::Function(FunctionType::void()),
                aliasee: Constant::global(f),
            },
        )
        .expect("alias");

        let mut user = Module::new("user", "x86_64-unknown-linux-gnu");
        let decl = user
            .add_function("f_alias", Function::declaration(FunctionType::void()))
            .expect("decl");
        let table = user
            .add_variable(
                "table",
                Variable::new(Type::array(Type::Ptr, 1), Constant::ptr_array(vec![Constant::global(decl)])),
            )
            .expect("table");

        let image = link(&[&lib, &user]).expect("link");
        let f_address = image.address(0, f).expect("f placed");
        assert_eq!(f_address, TEXT_BASE);
        assert!(image.is_text(f_address));
        let table_address = image.address(1, table).expect("table placed");
        assert_eq!(table_address, PAGE_SIZE * 2);
        assert_eq!(image.read_u64(table_address).expect("read"), f_address);
        assert_eq!(image.names_at(f_address), ["f", "f_alias"]);
    }

    #[test]
    fn unresolved_references_fail() {
        let mut user = Module::new("user", "x86_64-unknown-linux-gnu");
        let decl = user
            .add_function("missing", Function::declaration(FunctionType::void()))
            .expect("decl");
        user.add_variable(
            "table",
            Variable::new(Type::Ptr, Constant::global(decl)),
        )
        .expect("table");
        let err = link(&[&user]).expect_err("undefined");
        assert!(err.to_string().contains("undefined symbol `missing`"));
    }

    #[test]
    fn offsets_fold_against_placed_addresses() {
        let mut module = Module::new("m", "x86_64-unknown-linux-gnu");
        let a = module.add_function("a", body()).expect("a");
        let b = module.add_function("b", body()).expect("b");
        let offsets = module
            .add_variable(
                "offsets",
                Variable::constant(Constant::i32_array(vec![Constant::ptrdiff32(
                    Constant::global(a),
                    Constant::ptr_to_int(Constant::global(b)),
                )])),
            )
            .expect("offsets");
        let image = link(&[&module]).expect("link");
        let address = image.address(0, offsets).expect("placed");
        assert_eq!(image.read_i32(address).expect("read"), -32);
    }
}

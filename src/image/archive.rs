//! Deterministic `ar` archives for the per-output-kind image artifacts.

use std::fs;
use std::io::Write;
use std::path::Path;

use blake3::Hasher;
use object::{Object, ObjectSymbol};

use crate::error::{Error, Result};

const MAGIC: &[u8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const GNU_NAME_LIMIT: usize = 15;
const BSD_NAME_LIMIT: usize = 16;
const BSD_SYMDEF: &str = "__.SYMDEF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gnu,
    Bsd,
}

impl ArchiveFormat {
    /// Darwin toolchains expect BSD archives; everything else gets GNU.
    #[must_use]
    pub fn for_triple(triple: &str) -> Self {
        if triple.contains("apple") || triple.contains("darwin") {
            ArchiveFormat::Bsd
        } else {
            ArchiveFormat::Gnu
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub name: String,
    pub data: Vec<u8>,
}

impl ArchiveMember {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Global symbols an object member defines; non-object members define none.
fn defined_symbols(data: &[u8]) -> Vec<String> {
    let Ok(file) = object::File::parse(data) else {
        return Vec::new();
    };
    file.symbols()
        .filter(|symbol| symbol.is_global() && !symbol.is_undefined())
        .filter_map(|symbol| symbol.name().ok().map(str::to_string))
        .filter(|name| !name.is_empty())
        .collect()
}

fn push_field(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let used = bytes.len().min(width);
    out.extend_from_slice(&bytes[..used]);
    out.extend(std::iter::repeat(b' ').take(width - used));
}

fn push_header(out: &mut Vec<u8>, name: &str, size: usize, mode: &str) {
    push_field(out, name, 16);
    push_field(out, "0", 12);
    push_field(out, "0", 6);
    push_field(out, "0", 6);
    push_field(out, mode, 8);
    push_field(out, &size.to_string(), 10);
    out.extend_from_slice(b"`\n");
}

fn pad_even(out: &mut Vec<u8>) {
    if out.len() % 2 == 1 {
        out.push(b'\n');
    }
}

fn padded(len: usize) -> usize {
    len + len % 2
}

/// Lay out `members` as one archive image.
#[must_use]
pub fn build_archive(format: ArchiveFormat, members: &[ArchiveMember]) -> Vec<u8> {
    match format {
        ArchiveFormat::Gnu => build_gnu(members),
        ArchiveFormat::Bsd => build_bsd(members),
    }
}

fn build_gnu(members: &[ArchiveMember]) -> Vec<u8> {
    let mut long_names = Vec::new();
    let mut header_names = Vec::with_capacity(members.len());
    for member in members {
        if member.name.len() > GNU_NAME_LIMIT || member.name.contains('/') {
            header_names.push(format!("/{}", long_names.len()));
            long_names.extend_from_slice(member.name.as_bytes());
            long_names.extend_from_slice(b"/\n");
        } else {
            header_names.push(format!("{}/", member.name));
        }
    }
    let symbols: Vec<Vec<String>> = members.iter().map(|member| defined_symbols(&member.data)).collect();
    let symbol_count: usize = symbols.iter().map(Vec::len).sum();
    let symtab_size = 4 + 4 * symbol_count + symbols.iter().flatten().map(|name| name.len() + 1).sum::<usize>();

    let mut offset = MAGIC.len();
    if symbol_count > 0 {
        offset += HEADER_LEN + padded(symtab_size);
    }
    if !long_names.is_empty() {
        offset += HEADER_LEN + padded(long_names.len());
    }
    let mut member_offsets = Vec::with_capacity(members.len());
    for member in members {
        member_offsets.push(offset);
        offset += HEADER_LEN + padded(member.data.len());
    }

    let mut out = Vec::with_capacity(offset);
    out.extend_from_slice(MAGIC);
    if symbol_count > 0 {
        push_header(&mut out, "/", symtab_size, "0");
        out.extend_from_slice(&(symbol_count as u32).to_be_bytes());
        for (index, names) in symbols.iter().enumerate() {
            for _ in names {
                out.extend_from_slice(&(member_offsets[index] as u32).to_be_bytes());
            }
        }
        for name in symbols.iter().flatten() {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        pad_even(&mut out);
    }
    if !long_names.is_empty() {
        push_header(&mut out, "//", long_names.len(), "0");
        out.extend_from_slice(&long_names);
        pad_even(&mut out);
    }
    for (member, name) in members.iter().zip(&header_names) {
        push_header(&mut out, name, member.data.len(), "644");
        out.extend_from_slice(&member.data);
        pad_even(&mut out);
    }
    out
}

fn bsd_name(name: &str) -> (String, usize) {
    if name.len() > BSD_NAME_LIMIT || name.contains(' ') {
        // `#1/<len>`: the name is stored in front of the member data.
        let stored = padded(name.len());
        (format!("#1/{stored}"), stored)
    } else {
        (name.to_string(), 0)
    }
}

fn build_bsd(members: &[ArchiveMember]) -> Vec<u8> {
    let symbols: Vec<Vec<String>> = members.iter().map(|member| defined_symbols(&member.data)).collect();
    let symbol_count: usize = symbols.iter().map(Vec::len).sum();
    let mut strtab = Vec::new();
    let mut string_offsets = Vec::with_capacity(symbol_count);
    for name in symbols.iter().flatten() {
        string_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    while strtab.len() % 4 != 0 {
        strtab.push(0);
    }
    let symdef_size = 4 + 8 * symbol_count + 4 + strtab.len();

    let mut offset = MAGIC.len();
    if symbol_count > 0 {
        offset += HEADER_LEN + padded(symdef_size);
    }
    let mut member_offsets = Vec::with_capacity(members.len());
    for member in members {
        member_offsets.push(offset);
        let (_, name_len) = bsd_name(&member.name);
        offset += HEADER_LEN + padded(name_len + member.data.len());
    }

    let mut out = Vec::with_capacity(offset);
    out.extend_from_slice(MAGIC);
    if symbol_count > 0 {
        push_header(&mut out, BSD_SYMDEF, symdef_size, "0");
        out.extend_from_slice(&((8 * symbol_count) as u32).to_le_bytes());
        let mut strings = string_offsets.iter();
        for (index, names) in symbols.iter().enumerate() {
            for _ in names {
                let string = strings.next().copied().unwrap_or_default();
                out.extend_from_slice(&string.to_le_bytes());
                out.extend_from_slice(&(member_offsets[index] as u32).to_le_bytes());
            }
        }
        out.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
        out.extend_from_slice(&strtab);
        pad_even(&mut out);
    }
    for member in members {
        let (header_name, name_len) = bsd_name(&member.name);
        push_header(&mut out, &header_name, name_len + member.data.len(), "644");
        if name_len > 0 {
            out.extend_from_slice(member.name.as_bytes());
            out.extend(std::iter::repeat(0).take(name_len - member.name.len()));
        }
        out.extend_from_slice(&member.data);
        pad_even(&mut out);
    }
    out
}

#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// Write the archive to `path` and return its blake3 digest.
pub fn write_archive(path: &Path, format: ArchiveFormat, members: &[ArchiveMember]) -> Result<String> {
    let bytes = build_archive(format, members);
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.flush()
    };
    write().map_err(|err| Error::output(path, err))?;
    Ok(digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::backend::{CodegenBackend, ReferenceBackend};
    use crate::ir::{Block, Function, FunctionType, Instruction, Module};
    use object::read::archive::ArchiveFile;
    use object::read::archive::ArchiveKind;

    fn object_member(name: &str, symbol: &str, triple: &str) -> ArchiveMember {
        let mut module = Module::new(name, triple);
        let mut function = Function::declaration(FunctionType::void());
        function.blocks.push(Block {
            name: "top".into(),
            insts: vec![Instruction::ret(None)],
        });
        module.add_function(symbol, function).expect("function");
        ArchiveMember::new(name, ReferenceBackend.emit_object(&module).expect("object"))
    }

    fn names(archive: &ArchiveFile<'_>) -> Vec<String> {
        archive
            .members()
            .map(|member| {
                let member = member.expect("member");
                String::from_utf8_lossy(member.name()).into_owned()
            })
            .collect()
    }

    #[test]
    fn gnu_archives_index_symbols_and_long_names() {
        let members = vec![
            object_member("text_10.o", "shard_entry", "x86_64-unknown-linux-gnu"),
            ArchiveMember::new("text_unopt_10.ir", b"module".to_vec()),
        ];
        let bytes = build_archive(ArchiveFormat::Gnu, &members);
        let archive = ArchiveFile::parse(bytes.as_slice()).expect("archive");
        assert_eq!(archive.kind(), ArchiveKind::Gnu);
        assert_eq!(names(&archive), vec!["text_10.o", "text_unopt_10.ir"]);
        let symbols: Vec<_> = archive
            .symbols()
            .expect("symbols")
            .expect("table")
            .map(|symbol| String::from_utf8_lossy(symbol.expect("symbol").name()).into_owned())
            .collect();
        assert_eq!(symbols, vec!["shard_entry"]);
    }

    #[test]
    fn bsd_archives_store_long_names_inline() {
        let members = vec![
            object_member("data.o", "image_pointers", "x86_64-apple-darwin"),
            ArchiveMember::new("text_unopt_123456.ir", b"ir".to_vec()),
        ];
        let bytes = build_archive(ArchiveFormat::Bsd, &members);
        let archive = ArchiveFile::parse(bytes.as_slice()).expect("archive");
        assert_eq!(archive.kind(), ArchiveKind::Bsd);
        assert_eq!(names(&archive), vec!["data.o", "text_unopt_123456.ir"]);
    }

    #[test]
    fn output_is_deterministic() {
        let members = vec![ArchiveMember::new("a.ir", b"x".to_vec())];
        assert_eq!(
            digest(&build_archive(ArchiveFormat::Gnu, &members)),
            digest(&build_archive(ArchiveFormat::Gnu, &members))
        );
        assert_eq!(ArchiveFormat::for_triple("aarch64-apple-darwin"), ArchiveFormat::Bsd);
        assert_eq!(ArchiveFormat::for_triple("x86_64-unknown-linux-gnu"), ArchiveFormat::Gnu);
    }

    #[test]
    fn unwritable_paths_are_output_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").expect("write");
        let err = write_archive(&blocker.join("out.a"), ArchiveFormat::Gnu, &[])
            .expect_err("not a directory");
        assert!(matches!(err, Error::Output { .. }));
    }
}

//! Reading a linked native image back: target selection, offset tables,
//! function pointers and relocation slots.
//!
//! This is the consumer of everything [`crate::multiversion::metadata`] and
//! [`crate::image::data`] emit, so building and then loading an image checks
//! both sides agree.

pub mod link;

use std::collections::{BTreeMap, BTreeSet};
use std::env;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::image::data::{IMAGE_FORMAT_VERSION, IMAGE_POINTERS};
use crate::image::NativeImage;
use crate::ir::Module;
use crate::multiversion::metadata::SHARD_TABLES;
use crate::multiversion::{TAG_MASK, VALUE_MASK};
use crate::target::parse_payload;

pub use link::{link, LinkedImage};

const CPU_OVERRIDE_ENV: &str = "IMGSHARD_CPU_OVERRIDE";

/// The CPU an image is loaded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCpu {
    pub name: String,
    pub features: BTreeSet<String>,
}

impl HostCpu {
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            features: features.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn has(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// `cpu[,feature...]`, with or without `+` on features.
    #[must_use]
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.split(',').map(str::trim).filter(|part| !part.is_empty());
        let name = parts.next()?;
        Some(Self::new(
            name,
            parts.map(|feature| feature.trim_start_matches('+').to_string()),
        ))
    }

    /// The running CPU, or `IMGSHARD_CPU_OVERRIDE` when set. Cached.
    #[must_use]
    pub fn detect() -> Self {
        static DETECTED: Lazy<HostCpu> = Lazy::new(|| {
            env::var(CPU_OVERRIDE_ENV)
                .ok()
                .and_then(|spec| HostCpu::parse(&spec))
                .unwrap_or_else(detect_features)
        });
        DETECTED.clone()
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_features() -> HostCpu {
    let mut features = Vec::new();
    macro_rules! detect {
        ($($name:tt),*) => {
            $(if std::arch::is_x86_feature_detected!($name) {
                features.push($name);
            })*
        };
    }
    detect!("sse2", "sse4.2", "avx", "avx2", "fma", "bmi2", "f16c", "avx512f");
    HostCpu::new("x86-64", features)
}

#[cfg(target_arch = "aarch64")]
fn detect_features() -> HostCpu {
    let mut features = Vec::new();
    if std::arch::is_aarch64_feature_detected!("neon") {
        features.push("neon");
    }
    if std::arch::is_aarch64_feature_detected!("fp16") {
        features.push("fullfp16");
    }
    HostCpu::new("generic", features)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_features() -> HostCpu {
    HostCpu::new("generic", Vec::<String>::new())
}

/// One entry of the dispatch target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub flags: u32,
    pub cpu_name: String,
    pub features: String,
}

impl DispatchTarget {
    fn required(&self) -> impl Iterator<Item = &str> {
        self.features
            .split(',')
            .filter_map(|feature| feature.trim().strip_prefix('+'))
    }
}

/// Pick the target whose required features the host has, preferring the one
/// requiring the most features and then the highest index.
#[must_use]
pub fn select_target(targets: &[DispatchTarget], host: &HostCpu) -> usize {
    let mut best = 0;
    let mut best_score = 0;
    for (index, target) in targets.iter().enumerate() {
        let required: Vec<&str> = target.required().collect();
        if !required.iter().all(|feature| host.has(feature)) {
            continue;
        }
        if required.len() >= best_score {
            best = index;
            best_score = required.len();
        }
    }
    best
}

/// How one target's clones are described in `clone_idxs`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloneEntry {
    GroupBase {
        shared: Vec<u32>,
        bodies: Option<Vec<i32>>,
    },
    Narrow {
        base: usize,
        entries: Vec<(u32, i32)>,
    },
}

/// An image after loading: chosen target, resolved exports and the slot and
/// initializer writes applied on top of the linked data.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub target: usize,
    pub threads: usize,
    pub functions: Vec<Option<u64>>,
    pub globals: Vec<Option<u64>>,
    pub image: LinkedImage,
    overlay: BTreeMap<u64, u64>,
}

impl LoadedImage {
    #[must_use]
    pub fn function(&self, index: usize) -> Option<u64> {
        self.functions.get(index).copied().flatten()
    }

    #[must_use]
    pub fn global(&self, index: usize) -> Option<u64> {
        self.globals.get(index).copied().flatten()
    }

    /// Pointer-sized read that sees loader writes.
    pub fn read_pointer(&self, address: u64) -> Result<u64> {
        match self.overlay.get(&address) {
            Some(value) => Ok(*value),
            None => self.image.read_u64(address),
        }
    }

    pub fn writes(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.overlay.iter().map(|(address, value)| (*address, *value))
    }

    fn write_once(&mut self, address: u64, value: u64) -> Result<()> {
        if self.overlay.insert(address, value).is_some() {
            return Err(Error::invariant(format!(
                "loader wrote {address:#x} more than once"
            )));
        }
        Ok(())
    }
}

struct ShardTables {
    fbase: u64,
    foffsets: Vec<i32>,
    fidxs: Vec<u32>,
    gbase: u64,
    goffsets: Vec<i32>,
    gidxs: Vec<u32>,
    slots: Vec<(u32, i32)>,
    clone_offsets: u64,
    clone_idxs: u64,
}

#[derive(Debug, Clone)]
pub struct ImageLoader {
    host: HostCpu,
}

impl ImageLoader {
    #[must_use]
    pub fn new(host: HostCpu) -> Self {
        Self { host }
    }

    pub fn load_image(&self, image: &NativeImage) -> Result<LoadedImage> {
        let shards: Vec<&Module> = image.shards.iter().map(|shard| &shard.module).collect();
        self.load(&shards, &image.data)
    }

    /// Link `shards` with `data` and run the loader over the result.
    pub fn load(&self, shards: &[&Module], data: &Module) -> Result<LoadedImage> {
        let mut modules: Vec<&Module> = shards.to_vec();
        modules.push(data);
        let image = link(&modules)?;

        let pointers = image
            .symbol(IMAGE_POINTERS)
            .ok_or_else(|| Error::invariant(format!("image has no `{IMAGE_POINTERS}`")))?;
        let header = image.read_u64(pointers)?;
        let shard_table = image.read_u64(pointers + 8)?;
        let target_ids = image.read_u64(pointers + 16)?;

        let version = image.read_u32(header)?;
        if version != IMAGE_FORMAT_VERSION {
            return Err(Error::invariant(format!(
                "unsupported image format version {version}"
            )));
        }
        let threads = image.read_u32(header + 4)? as usize;
        let nfvars = image.read_u32(header + 8)? as usize;
        let ngvars = image.read_u32(header + 12)? as usize;
        if threads != shards.len() {
            return Err(Error::invariant(format!(
                "image header lists {threads} shards, {} were linked",
                shards.len()
            )));
        }

        let targets = read_targets(&image, target_ids)?;
        let target = select_target(&targets, &self.host);
        tracing::debug!(
            target: "image",
            stage = "load",
            selected = target,
            cpu = %targets[target].cpu_name,
            host = %self.host.name,
            "selected dispatch target"
        );

        let mut loaded = LoadedImage {
            target,
            threads,
            functions: vec![None; nfvars],
            globals: vec![None; ngvars],
            image,
            overlay: BTreeMap::new(),
        };
        for shard in 0..threads {
            let tables = read_shard_tables(&loaded.image, shard_table, shard)?;
            load_shard(&mut loaded, &tables, targets.len(), shard)?;
        }
        Ok(loaded)
    }
}

fn read_targets(image: &LinkedImage, address: u64) -> Result<Vec<DispatchTarget>> {
    let count = image.read_u32(address)? as usize;
    let mut cursor = address + 4;
    let mut targets = Vec::with_capacity(count);
    for _ in 0..count {
        let flags = image.read_u32(cursor)?;
        cursor += 4;
        let available = image.data_range().end.saturating_sub(cursor) as usize;
        let (cpu_name, features, used) = parse_payload(image.read(cursor, available)?)?;
        cursor += used as u64;
        targets.push(DispatchTarget {
            flags,
            cpu_name,
            features,
        });
    }
    if targets.is_empty() {
        return Err(Error::invariant("image lists no dispatch targets"));
    }
    Ok(targets)
}

fn read_u32s(image: &LinkedImage, address: u64, count: usize) -> Result<Vec<u32>> {
    (0..count)
        .map(|index| image.read_u32(address + 4 * index as u64))
        .collect()
}

/// `[n, off...]` into base-relative offsets.
fn read_offsets(image: &LinkedImage, address: u64) -> Result<Vec<i32>> {
    let count = image.read_u32(address)? as usize;
    (0..count)
        .map(|index| image.read_i32(address + 4 + 4 * index as u64))
        .collect()
}

fn read_shard_tables(image: &LinkedImage, table: u64, shard: usize) -> Result<ShardTables> {
    let mut pointers = [0u64; SHARD_TABLES.len()];
    for (slot, pointer) in pointers.iter_mut().enumerate() {
        let entry = table + 8 * (shard * SHARD_TABLES.len() + slot) as u64;
        *pointer = image.read_u64(entry)?;
    }
    let [fbase, foffsets, fidxs, gbase, goffsets, gidxs, slots, clone_offsets, clone_idxs] =
        pointers;
    let foffsets = read_offsets(image, foffsets)?;
    let fidxs = read_u32s(image, fidxs, foffsets.len())?;
    let goffsets = read_offsets(image, goffsets)?;
    let gidxs = read_u32s(image, gidxs, goffsets.len())?;
    let pairs = image.read_u32(slots)? as usize;
    let mut slot_pairs = Vec::with_capacity(pairs);
    for pair in 0..pairs {
        let at = slots + 4 + 8 * pair as u64;
        slot_pairs.push((image.read_u32(at)?, image.read_i32(at + 4)?));
    }
    Ok(ShardTables {
        fbase,
        foffsets,
        fidxs,
        gbase,
        goffsets,
        gidxs,
        slots: slot_pairs,
        clone_offsets,
        clone_idxs,
    })
}

fn decode_clone_entries(
    image: &LinkedImage,
    tables: &ShardTables,
    ntargets: usize,
) -> Result<Vec<CloneEntry>> {
    let nfvars = tables.foffsets.len();
    let mut idx = tables.clone_idxs;
    let mut off = tables.clone_offsets;
    let mut next_idx = || -> Result<u32> {
        let value = image.read_u32(idx)?;
        idx += 4;
        Ok(value)
    };
    let mut next_off = || -> Result<i32> {
        let value = image.read_i32(off)?;
        off += 4;
        Ok(value)
    };
    let mut entries = Vec::with_capacity(ntargets);
    for target in 0..ntargets {
        let head = next_idx()?;
        if head & TAG_MASK != 0 {
            let count = (head & VALUE_MASK) as usize;
            let shared = (0..count).map(|_| next_idx()).collect::<Result<Vec<_>>>()?;
            let bodies = if target == 0 {
                None
            } else {
                Some((0..nfvars).map(|_| next_off()).collect::<Result<Vec<_>>>()?)
            };
            entries.push(CloneEntry::GroupBase { shared, bodies });
        } else {
            let count = head as usize;
            let base = next_idx()? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                let id = next_idx()?;
                list.push((id, next_off()?));
            }
            entries.push(CloneEntry::Narrow {
                base,
                entries: list,
            });
        }
    }
    Ok(entries)
}

fn displaced(base: u64, offset: i32) -> u64 {
    base.wrapping_add_signed(i64::from(offset))
}

fn load_shard(
    loaded: &mut LoadedImage,
    tables: &ShardTables,
    ntargets: usize,
    shard: usize,
) -> Result<()> {
    let entries = decode_clone_entries(&loaded.image, tables, ntargets)?;
    let selected = loaded.target;
    let group = match entries.get(selected) {
        Some(CloneEntry::GroupBase { .. }) => selected,
        Some(CloneEntry::Narrow { base, .. }) => *base,
        None => {
            return Err(Error::invariant(format!(
                "shard {shard} has no clone table for target {selected}"
            )))
        }
    };

    let mut fptrs: Vec<u64> = tables
        .foffsets
        .iter()
        .map(|offset| displaced(tables.fbase, *offset))
        .collect();
    let shared: BTreeSet<u32> = match entries.get(group) {
        Some(CloneEntry::GroupBase { shared, bodies }) => {
            if let Some(bodies) = bodies {
                for (fptr, offset) in fptrs.iter_mut().zip(bodies) {
                    *fptr = displaced(tables.fbase, *offset);
                }
            }
            shared.iter().copied().collect()
        }
        _ => {
            return Err(Error::invariant(format!(
                "shard {shard}: target {selected} names {group} as its base, which is not a group base"
            )))
        }
    };
    if let Some(CloneEntry::Narrow { entries, .. }) = entries.get(selected) {
        for (raw, offset) in entries {
            let fid = (raw & VALUE_MASK) as usize;
            let fptr = fptrs.get_mut(fid).ok_or_else(|| {
                Error::invariant(format!("shard {shard}: clone entry for unknown function {fid}"))
            })?;
            *fptr = displaced(tables.fbase, *offset);
        }
    }

    for (local, index) in tables.fidxs.iter().enumerate() {
        let slot = loaded.functions.get_mut(*index as usize).ok_or_else(|| {
            Error::invariant(format!("function export {index} is outside the image table"))
        })?;
        if slot.replace(fptrs[local]).is_some() {
            return Err(Error::invariant(format!(
                "function export {index} is provided by more than one shard"
            )));
        }
    }
    for (offset, index) in tables.goffsets.iter().zip(&tables.gidxs) {
        let slot = loaded.globals.get_mut(*index as usize).ok_or_else(|| {
            Error::invariant(format!("global export {index} is outside the image table"))
        })?;
        if slot.replace(displaced(tables.gbase, *offset)).is_some() {
            return Err(Error::invariant(format!(
                "global export {index} is provided by more than one shard"
            )));
        }
    }

    for (fid, offset) in &tables.slots {
        if !shared.contains(fid) {
            return Err(Error::invariant(format!(
                "shard {shard}: slot for function {fid} missing from the clone table"
            )));
        }
        let value = fptrs.get(*fid as usize).copied().ok_or_else(|| {
            Error::invariant(format!("shard {shard}: slot for unknown function {fid}"))
        })?;
        loaded.write_once(displaced(tables.gbase, *offset), value)?;
    }
    tracing::debug!(
        target: "image",
        stage = "load",
        shard,
        functions = fptrs.len(),
        slots = tables.slots.len(),
        "loaded shard"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(features: &str) -> DispatchTarget {
        DispatchTarget {
            flags: 0,
            cpu_name: "cpu".into(),
            features: features.into(),
        }
    }

    #[test]
    fn selection_prefers_more_features_then_higher_index() {
        let targets = vec![
            target(""),
            target("+avx2"),
            target("+avx2,+fma"),
            target("+sse4.2,+popcnt"),
            target("+avx512f"),
        ];
        let host = HostCpu::new("haswell", ["avx2", "fma", "sse4.2", "popcnt"]);
        assert_eq!(select_target(&targets, &host), 3);
        let plain = HostCpu::new("generic", Vec::<String>::new());
        assert_eq!(select_target(&targets, &plain), 0);
    }

    #[test]
    fn negative_features_are_not_requirements() {
        let targets = vec![target(""), target("-avx,+sse2")];
        let host = HostCpu::new("x", ["sse2"]);
        assert_eq!(select_target(&targets, &host), 1);
    }

    #[test]
    fn host_specs_parse() {
        let host = HostCpu::parse("haswell,+avx2, fma").expect("host");
        assert_eq!(host.name, "haswell");
        assert!(host.has("avx2") && host.has("fma"));
        assert!(HostCpu::parse("").is_none());
    }
}

//! Clone target specifications.
//!
//! A target list is written as `;`-separated entries of the form
//! `cpu[,token...]`. Entry 0 is the baseline every function is compiled for;
//! later entries either clone everything (`clone_all`) or clone only the
//! functions whose features match their trigger tokens.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Upper bound on the number of targets; clone sets are stored as `u64`.
pub const MAX_TARGETS: usize = 64;

/// Per-target flag word, wire-compatible with the dispatch target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TargetFlags(pub u32);

impl TargetFlags {
    pub const NONE: TargetFlags = TargetFlags(0);
    pub const VEC_CALL: TargetFlags = TargetFlags(1 << 0);
    pub const CLONE_ALL: TargetFlags = TargetFlags(1 << 1);
    pub const CLONE_LOOP: TargetFlags = TargetFlags(1 << 2);
    pub const CLONE_SIMD: TargetFlags = TargetFlags(1 << 3);
    pub const CLONE_MATH: TargetFlags = TargetFlags(1 << 4);
    pub const CLONE_CPU: TargetFlags = TargetFlags(1 << 5);
    pub const OPTSIZE: TargetFlags = TargetFlags(1 << 6);
    pub const MINSIZE: TargetFlags = TargetFlags(1 << 7);
    pub const UNKNOWN_NAME: TargetFlags = TargetFlags(1 << 8);
    pub const CLONE_FLOAT16: TargetFlags = TargetFlags(1 << 9);

    /// Trigger bits a narrow target can select on.
    pub const CLONE_MASK: TargetFlags = TargetFlags(
        Self::CLONE_LOOP.0
            | Self::CLONE_SIMD.0
            | Self::CLONE_MATH.0
            | Self::CLONE_CPU.0
            | Self::CLONE_FLOAT16.0,
    );

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: TargetFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn intersects(self, other: TargetFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TargetFlags {
    type Output = TargetFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        TargetFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TargetFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TargetFlags {
    type Output = TargetFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        TargetFlags(self.0 & rhs.0)
    }
}

/// CPU names the loader can identify without falling back to a string match.
const KNOWN_CPUS: &[&str] = &[
    "generic",
    "native",
    "x86-64",
    "x86-64-v2",
    "x86-64-v3",
    "x86-64-v4",
    "core2",
    "nehalem",
    "sandybridge",
    "ivybridge",
    "haswell",
    "broadwell",
    "skylake",
    "skylake-avx512",
    "cascadelake",
    "icelake-client",
    "icelake-server",
    "sapphirerapids",
    "znver1",
    "znver2",
    "znver3",
    "znver4",
    "cortex-a53",
    "cortex-a57",
    "cortex-a72",
    "neoverse-n1",
    "neoverse-v1",
    "neoverse-v2",
    "apple-m1",
    "apple-m2",
    "apple-m3",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub index: usize,
    pub cpu_name: String,
    /// `+feature` / `-feature` tokens in the order written.
    pub features: Vec<String>,
    /// Target this one is derived from; `None` for group bases.
    pub base: Option<usize>,
    pub flags: TargetFlags,
}

impl TargetSpec {
    #[must_use]
    pub fn baseline(cpu_name: impl Into<String>) -> Self {
        let cpu_name = cpu_name.into();
        let flags = name_flags(&cpu_name);
        Self {
            index: 0,
            cpu_name,
            features: Vec::new(),
            base: None,
            flags,
        }
    }

    #[must_use]
    pub fn is_group_base(&self) -> bool {
        self.index == 0 || self.flags.contains(TargetFlags::CLONE_ALL)
    }

    #[must_use]
    pub fn clone_all(&self) -> bool {
        self.flags.contains(TargetFlags::CLONE_ALL)
    }

    /// Trigger bits this target clones on.
    #[must_use]
    pub fn triggers(&self) -> TargetFlags {
        self.flags & TargetFlags::CLONE_MASK
    }

    #[must_use]
    pub fn feature_string(&self) -> String {
        self.features.join(",")
    }

    /// Features that must be present on the host, without the `+` prefix.
    pub fn required_features(&self) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .filter_map(|feature| feature.strip_prefix('+'))
    }

    /// CPU identification blob embedded in the dispatch target table:
    /// `u32 len, cpu name, u32 len, feature string`, little endian.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        let features = self.feature_string();
        let mut bytes = Vec::with_capacity(8 + self.cpu_name.len() + features.len());
        write_str(&mut bytes, &self.cpu_name);
        write_str(&mut bytes, &features);
        bytes
    }
}

fn write_str(buffer: &mut Vec<u8>, value: &str) {
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

/// Decode one payload written by [`TargetSpec::payload`], returning the cpu
/// name, the feature string and the bytes consumed.
pub fn parse_payload(bytes: &[u8]) -> Result<(String, String, usize)> {
    let (cpu, used) = read_str(bytes, 0)?;
    let (features, used) = read_str(bytes, used)?;
    Ok((cpu, features, used))
}

fn read_str(bytes: &[u8], offset: usize) -> Result<(String, usize)> {
    let len_bytes = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| Error::invariant("truncated target payload length"))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(len_bytes);
    let len = u32::from_le_bytes(raw) as usize;
    let start = offset + 4;
    let text = bytes
        .get(start..start + len)
        .ok_or_else(|| Error::invariant("truncated target payload"))?;
    let text = String::from_utf8(text.to_vec())
        .map_err(|err| Error::invariant(format!("target payload is not UTF-8: {err}")))?;
    Ok((text, start + len))
}

fn name_flags(cpu_name: &str) -> TargetFlags {
    if KNOWN_CPUS.contains(&cpu_name) {
        TargetFlags::NONE
    } else {
        TargetFlags::UNKNOWN_NAME
    }
}

/// One group: a base target plus the narrow targets derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    pub base: usize,
    pub members: Vec<usize>,
}

/// Ordered list of targets; index 0 is the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetList {
    specs: Vec<TargetSpec>,
}

impl TargetList {
    #[must_use]
    pub fn baseline_only(cpu_name: &str) -> Self {
        Self {
            specs: vec![TargetSpec::baseline(cpu_name)],
        }
    }

    /// Parse a `;`-separated target list.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty entries, unknown tokens, a
    /// base on the baseline entry, a base that is not an earlier group base
    /// or more than [`MAX_TARGETS`] entries.
    pub fn parse(text: &str) -> Result<Self> {
        let entries: Vec<&str> = text.split(';').map(str::trim).collect();
        if entries.len() > MAX_TARGETS {
            return Err(Error::config(format!(
                "at most {MAX_TARGETS} targets are supported (got {})",
                entries.len()
            )));
        }
        let mut specs = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let spec = parse_entry(index, entry, &specs)?;
            specs.push(spec);
        }
        Ok(Self { specs })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TargetSpec> {
        self.specs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetSpec> {
        self.specs.iter()
    }

    #[must_use]
    pub fn specs(&self) -> &[TargetSpec] {
        &self.specs
    }

    /// Groups in target order: index 0 first, then each `clone_all` target.
    ///
    /// # Errors
    ///
    /// Fails when a narrow target derives from a target that is not an
    /// earlier group base. Lists built by [`TargetList::parse`] never do.
    pub fn groups(&self) -> Result<Vec<GroupLayout>> {
        let mut groups: Vec<GroupLayout> = Vec::new();
        let mut group_of: Vec<Option<usize>> = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            if spec.is_group_base() {
                group_of.push(Some(groups.len()));
                groups.push(GroupLayout {
                    base: spec.index,
                    members: Vec::new(),
                });
                continue;
            }
            let base = spec.base.unwrap_or(0);
            let Some(group) = group_of.get(base).copied().flatten() else {
                return Err(Error::config(format!(
                    "target {} derives from {base}, which is not a group base",
                    spec.index
                )));
            };
            group_of.push(None);
            groups[group].members.push(spec.index);
        }
        Ok(groups)
    }

    /// Bit mask of all narrow (non group base) targets.
    #[must_use]
    pub fn narrow_mask(&self) -> u64 {
        self.specs
            .iter()
            .filter(|spec| !spec.is_group_base())
            .fold(0u64, |mask, spec| mask | (1u64 << spec.index))
    }
}

impl Default for TargetList {
    fn default() -> Self {
        Self::baseline_only("generic")
    }
}

impl FromStr for TargetList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, spec) in self.specs.iter().enumerate() {
            if position > 0 {
                f.write_str(";")?;
            }
            f.write_str(&spec.cpu_name)?;
            if spec.clone_all() {
                f.write_str(",clone_all")?;
            }
            if let Some(base) = spec.base {
                write!(f, ",base({base})")?;
            }
            for feature in &spec.features {
                write!(f, ",{feature}")?;
            }
        }
        Ok(())
    }
}

fn parse_entry(index: usize, entry: &str, earlier: &[TargetSpec]) -> Result<TargetSpec> {
    let mut tokens = entry.split(',').map(str::trim);
    let cpu_name = match tokens.next() {
        Some(name) if !name.is_empty() && !name.starts_with(['+', '-']) => name.to_string(),
        _ => {
            return Err(Error::config(format!(
                "target {index} must start with a CPU name (got '{entry}')"
            )))
        }
    };
    let mut flags = name_flags(&cpu_name);
    let mut features = Vec::new();
    let mut base = None;
    let mut seen_features = BTreeSet::new();
    for token in tokens {
        if token.is_empty() {
            continue;
        }
        match token {
            "clone_all" => flags |= TargetFlags::CLONE_ALL,
            "opt_size" => flags |= TargetFlags::OPTSIZE,
            "min_size" => flags |= TargetFlags::MINSIZE,
            "clone_loop" => flags |= TargetFlags::CLONE_LOOP,
            "clone_simd" | "clone_vector" => flags |= TargetFlags::CLONE_SIMD,
            "clone_math" => flags |= TargetFlags::CLONE_MATH,
            "clone_cpu" => flags |= TargetFlags::CLONE_CPU,
            "clone_float16" => flags |= TargetFlags::CLONE_FLOAT16,
            _ if token.starts_with(['+', '-']) && token.len() > 1 => {
                if seen_features.insert(token[1..].to_string()) {
                    features.push(token.to_string());
                }
            }
            _ => {
                let Some(value) = token
                    .strip_prefix("base(")
                    .and_then(|rest| rest.strip_suffix(')'))
                else {
                    return Err(Error::config(format!(
                        "unknown token '{token}' in target {index}"
                    )));
                };
                let parsed: usize = value.trim().parse().map_err(|_| {
                    Error::config(format!("invalid base '{value}' in target {index}"))
                })?;
                base = Some(parsed);
            }
        }
    }
    if index == 0 {
        if base.is_some() || flags.contains(TargetFlags::CLONE_ALL) {
            return Err(Error::config(
                "the baseline target cannot name a base or clone_all",
            ));
        }
    } else if flags.contains(TargetFlags::CLONE_ALL) {
        if base.is_some_and(|base| base != 0) {
            return Err(Error::config(format!(
                "clone_all target {index} must derive from the baseline"
            )));
        }
        base = None;
    } else {
        let resolved = base.unwrap_or(0);
        match earlier.get(resolved) {
            None => {
                return Err(Error::config(format!(
                    "target {index} names base({resolved}), which is not an earlier target"
                )))
            }
            Some(spec) if !spec.is_group_base() => {
                return Err(Error::config(format!(
                    "target {index} names base({resolved}), which is neither the baseline nor a clone_all target"
                )))
            }
            Some(_) => {}
        }
        base = Some(resolved);
        if !flags.intersects(TargetFlags::CLONE_MASK) {
            flags |= TargetFlags::CLONE_MASK;
        }
    }
    Ok(TargetSpec {
        index,
        cpu_name,
        features,
        base,
        flags,
    })
}

//! Parallel native image construction.
//!
//! [`ImageBuilder::build`] annotates the module for multiversioning, picks
//! a thread count, partitions the module and compiles every partition on its
//! own worker. A separate data module then describes the shards to the
//! loader. [`ImageBuilder::write_archives`] packs the requested artifacts
//! into one `ar` archive per output kind.

pub mod archive;
pub mod backend;
pub mod data;
pub mod parallel;
pub mod shard;
pub mod threads;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::graph::{ColocationPolicy, DependencyGraphBuilder};
use crate::ir::text::print_module;
use crate::ir::verify::verify_module;
use crate::ir::{serialize, Module};
use crate::logging::{shard_span, StageTimer};
use crate::multiversion::{annotate_module_clones, run_multiversioning, MultiversionStats};
use crate::partition::{verify_partitioning, Partition, Partitioner};
use crate::target::TargetList;

use self::archive::{write_archive, ArchiveFormat, ArchiveMember};
use self::backend::{CodegenBackend, OptLevel, ReferenceBackend};
use self::data::{build_data_module, DataLayout};
use self::parallel::{run_shards, Diagnostics};
use self::shard::{prepare_shard, promote_locals};
use self::threads::{compute_image_thread_count, HostResources, ThreadSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputKind {
    UnoptIr,
    OptIr,
    Object,
    Assembly,
}

impl OutputKind {
    pub const ALL: [OutputKind; 4] = [
        OutputKind::UnoptIr,
        OutputKind::OptIr,
        OutputKind::Object,
        OutputKind::Assembly,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::UnoptIr => "unopt-ir",
            OutputKind::OptIr => "opt-ir",
            OutputKind::Object => "obj",
            OutputKind::Assembly => "asm",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unopt-ir" | "unopt_ir" => Some(OutputKind::UnoptIr),
            "opt-ir" | "opt_ir" | "ir" => Some(OutputKind::OptIr),
            "obj" | "object" => Some(OutputKind::Object),
            "asm" | "assembly" => Some(OutputKind::Assembly),
            _ => None,
        }
    }

    #[must_use]
    pub fn text_member(self, shard: usize) -> String {
        match self {
            OutputKind::UnoptIr => format!("text_unopt_{shard}.ir"),
            OutputKind::OptIr => format!("text_opt_{shard}.ir"),
            OutputKind::Object => format!("text_{shard}.o"),
            OutputKind::Assembly => format!("text_{shard}.s"),
        }
    }

    #[must_use]
    pub fn data_member(self) -> &'static str {
        match self {
            OutputKind::UnoptIr => "data_unopt.ir",
            OutputKind::OptIr => "data_opt.ir",
            OutputKind::Object => "data.o",
            OutputKind::Assembly => "data.s",
        }
    }

    /// Default archive file name inside an output directory.
    #[must_use]
    pub fn archive_name(self) -> &'static str {
        match self {
            OutputKind::UnoptIr => "image_unopt_ir.a",
            OutputKind::OptIr => "image_opt_ir.a",
            OutputKind::Object => "image_obj.a",
            OutputKind::Assembly => "image_asm.a",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Archive destinations; a `None` kind is not produced at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPaths {
    pub unopt_ir: Option<PathBuf>,
    pub opt_ir: Option<PathBuf>,
    pub object: Option<PathBuf>,
    pub assembly: Option<PathBuf>,
}

impl OutputPaths {
    /// Every kind in `kinds`, placed under `dir` with its default name.
    #[must_use]
    pub fn in_dir(dir: &Path, kinds: &[OutputKind]) -> Self {
        let mut paths = Self::default();
        for kind in kinds {
            paths.set(*kind, dir.join(kind.archive_name()));
        }
        paths
    }

    #[must_use]
    pub fn get(&self, kind: OutputKind) -> Option<&Path> {
        match kind {
            OutputKind::UnoptIr => self.unopt_ir.as_deref(),
            OutputKind::OptIr => self.opt_ir.as_deref(),
            OutputKind::Object => self.object.as_deref(),
            OutputKind::Assembly => self.assembly.as_deref(),
        }
    }

    pub fn set(&mut self, kind: OutputKind, path: PathBuf) {
        let slot = match kind {
            OutputKind::UnoptIr => &mut self.unopt_ir,
            OutputKind::OptIr => &mut self.opt_ir,
            OutputKind::Object => &mut self.object,
            OutputKind::Assembly => &mut self.assembly,
        };
        *slot = Some(path);
    }

    #[must_use]
    pub fn wants(&self, kind: OutputKind) -> bool {
        self.get(kind).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        OutputKind::ALL.iter().all(|kind| !self.wants(*kind))
    }

    pub fn requested(&self) -> impl Iterator<Item = (OutputKind, &Path)> + '_ {
        OutputKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|path| (kind, path)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    pub outputs: OutputPaths,
    /// Payload embedded verbatim as `image_data`.
    pub image_data: Vec<u8>,
    pub colocation: ColocationPolicy,
    pub opt_level: OptLevel,
    pub threads: ThreadSettings,
    /// Host description; detected when absent.
    pub host: Option<HostResources>,
}

/// Artifacts of one compiled module, text shard or data.
#[derive(Debug, Clone, Default)]
pub struct ModuleArtifacts {
    pub unopt_ir: Option<Vec<u8>>,
    pub opt_ir: Option<Vec<u8>>,
    pub object: Option<Vec<u8>>,
    pub assembly: Option<Vec<u8>>,
}

impl ModuleArtifacts {
    #[must_use]
    pub fn get(&self, kind: OutputKind) -> Option<&[u8]> {
        match kind {
            OutputKind::UnoptIr => self.unopt_ir.as_deref(),
            OutputKind::OptIr => self.opt_ir.as_deref(),
            OutputKind::Object => self.object.as_deref(),
            OutputKind::Assembly => self.assembly.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardOutput {
    pub index: usize,
    pub module: Module,
    pub artifacts: ModuleArtifacts,
    pub stats: MultiversionStats,
}

#[derive(Debug, Clone)]
pub struct NativeImage {
    pub triple: String,
    pub threads: usize,
    pub weights: Vec<u64>,
    pub shards: Vec<ShardOutput>,
    pub data: Module,
    pub data_artifacts: ModuleArtifacts,
}

#[derive(Debug)]
pub struct ArchiveReport {
    pub kind: OutputKind,
    pub path: PathBuf,
    /// blake3 digest of the written archive, or why it was not written.
    pub outcome: Result<String>,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub threads: usize,
    pub weights: Vec<u64>,
    pub archives: Vec<ArchiveReport>,
}

impl BuildReport {
    #[must_use]
    pub fn failures(&self) -> Vec<&ArchiveReport> {
        self.archives
            .iter()
            .filter(|report| report.outcome.is_err())
            .collect()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    /// Turn recorded write failures into an error once every archive was tried.
    pub fn into_result(self) -> Result<Self> {
        if let Some(position) = self.archives.iter().position(|report| report.outcome.is_err()) {
            let mut archives = self.archives;
            let failed = archives.swap_remove(position);
            return match failed.outcome {
                Err(err) => Err(err),
                Ok(_) => Err(Error::invariant("archive failure vanished")),
            };
        }
        Ok(self)
    }
}

pub struct ImageBuilder {
    backend: Box<dyn CodegenBackend>,
    options: ImageOptions,
}

impl fmt::Debug for ImageBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuilder")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .finish()
    }
}

impl ImageBuilder {
    #[must_use]
    pub fn new(options: ImageOptions) -> Self {
        Self {
            backend: Box::new(ReferenceBackend),
            options,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Box<dyn CodegenBackend>) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn options(&self) -> &ImageOptions {
        &self.options
    }

    /// Build every shard and the data module in memory.
    pub fn build(&self, mut module: Module, targets: &TargetList) -> Result<NativeImage> {
        let timer = StageTimer::start("image", "annotate");
        let summary = annotate_module_clones(&mut module, targets)?;
        timer.finish();

        let graph = DependencyGraphBuilder::new(self.options.colocation).build(&module);
        let host = self.options.host.unwrap_or_else(HostResources::detect);
        let threads = compute_image_thread_count(
            graph.total_weight(),
            graph.defined_count(),
            host,
            &self.options.threads,
        );
        let promoted = promote_locals(&mut module);
        tracing::info!(
            target: "image",
            stage = "plan",
            module = %module.name,
            threads,
            weight = graph.total_weight(),
            promoted,
            "building native image"
        );

        let timer = StageTimer::start("partition", "partition");
        let plan = Partitioner::new(threads)?.partition(&graph, &module.exports);
        verify_partitioning(&plan.partitions, &module)?;
        timer.finish();

        let snapshot = serialize(&module)?;
        let timer = StageTimer::start("image", "shards");
        let shards = run_shards(plan.partitions.len(), |index, diagnostics| {
            self.build_shard(&snapshot, &plan.partitions[index], targets, diagnostics)
        })?;
        timer.finish();

        let data_image = self.options.image_data.as_slice();
        let nfvars = export_count(&module.exports.function_idxs, module.exports.functions.len());
        let ngvars = export_count(&module.exports.global_idxs, module.exports.globals.len());
        let mut data = build_data_module(&DataLayout {
            triple: &module.triple,
            threads: shards.len(),
            nfvars,
            ngvars,
            has_veccall: summary.has_veccall,
            targets,
            image_data: data_image,
        })?;
        let data_artifacts = self.compile(&mut data, None)?;

        Ok(NativeImage {
            triple: module.triple.clone(),
            threads: shards.len(),
            weights: plan.weights(),
            shards,
            data,
            data_artifacts,
        })
    }

    fn build_shard(
        &self,
        snapshot: &[u8],
        partition: &Partition,
        targets: &TargetList,
        diagnostics: &mut Diagnostics,
    ) -> Result<ShardOutput> {
        let _span = shard_span(partition.index, partition.weight).entered();
        let mut module = prepare_shard(snapshot, partition)?;
        diagnostics.debug(format!(
            "owns {} values with weight {}",
            partition.globals.len(),
            partition.weight
        ));
        let mut stats = MultiversionStats::default();
        let artifacts = self.compile(&mut module, Some((targets, &mut stats)))?;
        diagnostics.debug(format!(
            "{} clones, {} slots, {} rewritten uses",
            stats.clones,
            stats.const_slots + stats.extern_slots,
            stats.rewritten_uses
        ));
        Ok(ShardOutput {
            index: partition.index,
            module,
            artifacts,
            stats,
        })
    }

    /// Verify, optionally multiversion, optimize and emit one module.
    fn compile(
        &self,
        module: &mut Module,
        multiversion: Option<(&TargetList, &mut MultiversionStats)>,
    ) -> Result<ModuleArtifacts> {
        let outputs = &self.options.outputs;
        let mut artifacts = ModuleArtifacts::default();
        if outputs.wants(OutputKind::UnoptIr) {
            artifacts.unopt_ir = Some(print_module(module).into_bytes());
        }
        verify_module(module)?;
        if let Some((targets, stats)) = multiversion {
            *stats = run_multiversioning(module, targets)?;
        }
        self.backend.optimize(module, self.options.opt_level)?;
        verify_module(module)?;
        if outputs.wants(OutputKind::OptIr) {
            artifacts.opt_ir = Some(print_module(module).into_bytes());
        }
        if outputs.wants(OutputKind::Object) {
            artifacts.object = Some(self.backend.emit_object(module)?);
        }
        if outputs.wants(OutputKind::Assembly) {
            artifacts.assembly = Some(self.backend.emit_assembly(module)?);
        }
        Ok(artifacts)
    }

    /// Write one archive per requested output kind. Failures are recorded and
    /// the remaining archives are still attempted.
    #[must_use]
    pub fn write_archives(&self, image: &NativeImage) -> BuildReport {
        let format = ArchiveFormat::for_triple(&image.triple);
        let mut report = BuildReport {
            threads: image.threads,
            weights: image.weights.clone(),
            archives: Vec::new(),
        };
        for (kind, path) in self.options.outputs.requested() {
            let mut members: Vec<ArchiveMember> = image
                .shards
                .iter()
                .filter_map(|shard| {
                    shard
                        .artifacts
                        .get(kind)
                        .map(|bytes| ArchiveMember::new(kind.text_member(shard.index), bytes.to_vec()))
                })
                .collect();
            if let Some(bytes) = image.data_artifacts.get(kind) {
                members.push(ArchiveMember::new(kind.data_member(), bytes.to_vec()));
            }
            let outcome = write_archive(path, format, &members);
            match &outcome {
                Ok(digest) => tracing::info!(
                    target: "image",
                    stage = "archive",
                    kind = %kind,
                    path = %path.display(),
                    members = members.len(),
                    digest = %digest,
                    "wrote archive"
                ),
                Err(err) => tracing::error!(
                    target: "image",
                    stage = "archive",
                    kind = %kind,
                    path = %path.display(),
                    error = %err,
                    "failed to write archive"
                ),
            }
            report.archives.push(ArchiveReport {
                kind,
                path: path.to_path_buf(),
                outcome,
            });
        }
        report
    }

    /// Build the image and write every requested archive.
    pub fn dump_native(&self, module: Module, targets: &TargetList) -> Result<BuildReport> {
        if self.options.outputs.is_empty() {
            tracing::info!(
                target: "image",
                stage = "plan",
                module = %module.name,
                "no outputs requested; skipping image build"
            );
            return Ok(BuildReport::default());
        }
        let image = self.build(module, targets)?;
        Ok(self.write_archives(&image))
    }
}

/// Size of an export table addressed by `idxs`.
fn export_count(idxs: &[u32], len: usize) -> usize {
    idxs.iter()
        .max()
        .map_or(0, |max| *max as usize + 1)
        .max(len)
}

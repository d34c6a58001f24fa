//! Execution of parsed commands.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

use crate::cli::{Cli, Command};
use crate::config::{ConfigOverrides, ImageConfig};
use crate::error::{Error, Result};
use crate::graph::{ColocationPolicy, DependencyGraphBuilder};
use crate::image::shard::promote_locals;
use crate::image::threads::{compute_image_thread_count, HostResources, ThreadSettings};
use crate::image::ImageBuilder;
use crate::ir::{self, Module};
use crate::multiversion::annotate_module_clones;
use crate::partition::{verify_partitioning, Partitioner};

mod logging;
mod reporting;
#[cfg(test)]
mod tests;

/// Run `cli`, writing command output to stdout.
pub fn run(cli: Cli) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_with_output(cli, &mut out)
}

pub fn run_with_output(cli: Cli, out: &mut dyn Write) -> Result<()> {
    match cli.command {
        Command::Help { topic } => {
            let text = match topic {
                Some(topic) => Cli::help_for(&topic)?,
                None => Cli::usage(),
            };
            out.write_all(text.as_bytes())?;
            Ok(())
        }
        Command::Version => {
            writeln!(out, "imgshard {}", env!("CARGO_PKG_VERSION"))?;
            Ok(())
        }
        command => {
            let log_options = cli.log_options.resolved();
            logging::init_logging(&log_options);
            let start = Instant::now();
            logging::log_run_start(&command, &log_options);
            let result = dispatch_command(&command, out);
            logging::log_run_complete(&command, start.elapsed(), &result);
            result
        }
    }
}

pub fn report_error(err: &Error) {
    reporting::report_error(err);
}

fn dispatch_command(command: &Command, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Build {
            input,
            config,
            overrides,
            threads,
        } => run_build(input, config.as_deref(), overrides, *threads, out),
        Command::Partition {
            input,
            config,
            threads,
            colocation,
        } => run_partition(input, config.as_deref(), *threads, *colocation, out),
        Command::Annotate {
            input,
            config,
            targets,
        } => run_annotate(input, config.as_deref(), targets.clone(), out),
        Command::Help { .. } | Command::Version => Ok(()),
    }
}

/// Read a JSON module, rebuilding the symbol index and export positions.
pub fn load_module(path: &Path) -> Result<Module> {
    let bytes = fs::read(path).map_err(|err| {
        Error::Io(io::Error::new(
            err.kind(),
            format!("failed to read module `{}`: {err}", path.display()),
        ))
    })?;
    let mut module = ir::deserialize(&bytes).map_err(|err| match err {
        Error::Serialization(message) => {
            Error::Serialization(format!("`{}`: {message}", path.display()))
        }
        other => other,
    })?;
    module.exports.normalize();
    Ok(module)
}

fn run_build(
    input: &Path,
    config: Option<&Path>,
    overrides: &ConfigOverrides,
    threads: Option<usize>,
    out: &mut dyn Write,
) -> Result<()> {
    let config = ImageConfig::resolve(config, overrides)?;
    let targets = config.target_list()?;
    let module = load_module(input)?;
    let builder = ImageBuilder::new(config.image_options(threads)?).with_backend(config.backend());
    let report = builder.dump_native(module, &targets)?;
    reporting::print_build_report(&report, out)?;
    report.into_result().map(|_| ())
}

fn run_partition(
    input: &Path,
    config: Option<&Path>,
    threads: Option<usize>,
    colocation: Option<ColocationPolicy>,
    out: &mut dyn Write,
) -> Result<()> {
    let config = ImageConfig::resolve(
        config,
        &ConfigOverrides {
            colocation,
            ..ConfigOverrides::default()
        },
    )?;
    let mut module = load_module(input)?;
    promote_locals(&mut module);
    let graph = DependencyGraphBuilder::new(config.colocation).build(&module);
    let count = match threads {
        Some(count) => count,
        None => compute_image_thread_count(
            graph.total_weight(),
            graph.defined_count(),
            HostResources::detect(),
            &ThreadSettings::from_env(config.threads.clone(), None),
        ),
    };
    let plan = Partitioner::new(count)?.partition(&graph, &module.exports);
    verify_partitioning(&plan.partitions, &module)?;
    reporting::print_partition_plan(&module, &plan, out)?;
    Ok(())
}

fn run_annotate(
    input: &Path,
    config: Option<&Path>,
    targets: Option<String>,
    out: &mut dyn Write,
) -> Result<()> {
    let config = ImageConfig::resolve(
        config,
        &ConfigOverrides {
            targets,
            ..ConfigOverrides::default()
        },
    )?;
    let targets = config.target_list()?;
    let mut module = load_module(input)?;
    let summary = annotate_module_clones(&mut module, &targets)?;
    reporting::print_annotations(&module, &summary, out)?;
    Ok(())
}

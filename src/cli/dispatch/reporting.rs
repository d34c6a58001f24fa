use std::io::{self, Write};

use crate::error::Error;
use crate::image::BuildReport;
use crate::ir::Module;
use crate::multiversion::{AnnotationSummary, ATTR_CLONES, ATTR_FVAR, ATTR_RELOC};
use crate::partition::PartitionPlan;

pub(super) fn report_error(err: &Error) {
    let mut out = io::stderr();
    if let Err(io_err) = report_error_to(err, &mut out) {
        let _ = writeln!(io::stderr(), "failed to report error: {io_err}");
    }
}

pub(super) fn report_error_to(err: &Error, out: &mut dyn Write) -> io::Result<()> {
    match err {
        Error::Cli(cli) => writeln!(out, "{cli}")?,
        _ => {
            writeln!(out, "error: {err}")?;
            if cfg!(debug_assertions) {
                if let Some(backtrace) = err.backtrace() {
                    writeln!(out, "stack trace:")?;
                    writeln!(out, "{backtrace}")?;
                }
            }
        }
    }
    Ok(())
}

pub(super) fn print_build_report(report: &BuildReport, out: &mut dyn Write) -> io::Result<()> {
    if report.archives.is_empty() {
        writeln!(out, "no outputs requested; nothing was built (use --emit)")?;
        return Ok(());
    }
    let weights: Vec<String> = report.weights.iter().map(ToString::to_string).collect();
    writeln!(out, "shards: {} (weights {})", report.threads, weights.join(" "))?;
    for archive in &report.archives {
        match &archive.outcome {
            Ok(digest) => writeln!(
                out,
                "  {:9} {} blake3:{digest}",
                archive.kind.as_str(),
                archive.path.display()
            )?,
            Err(err) => writeln!(
                out,
                "  {:9} {} FAILED: {err}",
                archive.kind.as_str(),
                archive.path.display()
            )?,
        }
    }
    Ok(())
}

pub(super) fn print_partition_plan(
    module: &Module,
    plan: &PartitionPlan,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(
        out,
        "module {}: {} partitions, {} components, spread {} (heaviest component {})",
        module.name,
        plan.partitions.len(),
        plan.components,
        plan.spread(),
        plan.heaviest_component
    )?;
    for partition in &plan.partitions {
        writeln!(
            out,
            "partition {}: weight {}, {} globals, {} fvars, {} gvars",
            partition.index,
            partition.weight,
            partition.globals.len(),
            partition.fvars.len(),
            partition.gvars.len()
        )?;
        for id in &partition.globals {
            writeln!(out, "  {}", module.name_of(*id))?;
        }
    }
    Ok(())
}

pub(super) fn print_annotations(
    module: &Module,
    summary: &AnnotationSummary,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(
        out,
        "module {}: {} functions, {} relocation slots, {} fvars, vector calls: {}",
        module.name,
        summary.functions,
        summary.relocs,
        summary.fvars,
        if summary.has_veccall { "yes" } else { "no" }
    )?;
    for (target, count) in summary.cloned.iter().enumerate().skip(1) {
        writeln!(out, "target {target}: {count} clones")?;
    }
    for (id, function) in module.functions() {
        let Some(clones) = function.attr(ATTR_CLONES) else {
            continue;
        };
        let mut line = format!("  {} clones={clones}", module.name_of(id));
        if function.has_attr(ATTR_RELOC) {
            line.push_str(" reloc");
        }
        if function.has_attr(ATTR_FVAR) {
            line.push_str(" fvar");
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}

mod common;

use std::fs;

use common::{caller, counter, export_all, heavy, host, leaf, module, pointer_table, vector_user};
use imgshard::error::Error;
use imgshard::image::archive::digest;
use imgshard::image::threads::{compute_image_thread_count, HostResources, ThreadSettings};
use imgshard::image::{ImageBuilder, ImageOptions, OutputKind, OutputPaths};
use imgshard::ir::{serialize, Module};
use imgshard::target::TargetList;
use tempfile::tempdir;

fn sample() -> Module {
    let mut m = module("pipeline");
    let f = vector_user(&mut m, "F", &[]);
    let g = caller(&mut m, "G", &[f]);
    let a = heavy(&mut m, "a", 20);
    caller(&mut m, "b", &[a]);
    leaf(&mut m, "c");
    pointer_table(&mut m, "table", &[g]);
    counter(&mut m, "hits");
    export_all(&mut m);
    m
}

fn options(outputs: OutputPaths) -> ImageOptions {
    ImageOptions {
        outputs,
        image_data: b"payload".to_vec(),
        threads: ThreadSettings {
            explicit: Some("2".into()),
            ..ThreadSettings::default()
        },
        host: Some(host()),
        ..ImageOptions::default()
    }
}

fn targets() -> TargetList {
    TargetList::parse("generic;haswell,+avx2,clone_simd").expect("targets")
}

#[test]
fn invalid_explicit_override_keeps_the_heuristic() {
    let host = HostResources {
        hardware_threads: 8,
        available_memory: None,
    };
    let settings = ThreadSettings {
        explicit: Some("0".into()),
        ..ThreadSettings::default()
    };
    assert_eq!(compute_image_thread_count(5000, 1000, host, &settings), 4);
}

#[test]
fn small_modules_build_on_one_thread_without_an_override() {
    let settings = ThreadSettings::default();
    assert_eq!(compute_image_thread_count(999, 1000, host(), &settings), 1);
    let hinted = ThreadSettings {
        cli_hint: Some(2),
        ..ThreadSettings::default()
    };
    assert_eq!(compute_image_thread_count(50_000, 1000, host(), &hinted), 2);
}

#[test]
fn dump_writes_one_archive_per_requested_kind() {
    let dir = tempdir().expect("tempdir");
    let outputs = OutputPaths::in_dir(dir.path(), &[OutputKind::Object, OutputKind::OptIr]);
    let report = ImageBuilder::new(options(outputs))
        .dump_native(sample(), &targets())
        .expect("dump")
        .into_result()
        .expect("archives");

    assert_eq!(report.threads, 2);
    assert_eq!(report.weights.len(), 2);
    assert_eq!(report.archives.len(), 2);
    for archive in &report.archives {
        let bytes = fs::read(&archive.path).expect("archive on disk");
        assert!(bytes.starts_with(b"!<arch>\n"));
        let recorded = archive.outcome.as_ref().expect("digest");
        assert_eq!(recorded, &digest(&bytes));
        assert_eq!(
            archive.path.file_name().and_then(|name| name.to_str()),
            Some(archive.kind.archive_name())
        );
    }
    assert!(!dir.path().join("image_asm.a").exists());
}

#[test]
fn nothing_requested_builds_nothing() {
    let report = ImageBuilder::new(options(OutputPaths::default()))
        .dump_native(sample(), &targets())
        .expect("dump");
    assert!(report.archives.is_empty());
    assert!(report.is_success());
}

#[test]
fn one_failed_archive_does_not_stop_the_others() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"not a directory").expect("blocker");
    let mut outputs = OutputPaths::default();
    outputs.set(OutputKind::Object, blocker.join("image_obj.a"));
    outputs.set(OutputKind::Assembly, dir.path().join("image_asm.a"));

    let report = ImageBuilder::new(options(outputs))
        .dump_native(sample(), &targets())
        .expect("dump");
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].kind, OutputKind::Object);
    assert!(dir.path().join("image_asm.a").exists());
    match report.into_result() {
        Err(Error::Output { artifact, .. }) => assert!(artifact.starts_with(&blocker)),
        other => panic!("expected an output error, got {other:?}"),
    }
}

#[test]
fn builds_are_reproducible() {
    let first_dir = tempdir().expect("first");
    let second_dir = tempdir().expect("second");
    let kinds = [OutputKind::Object, OutputKind::Assembly, OutputKind::UnoptIr];

    let build = |dir: &std::path::Path| {
        let builder = ImageBuilder::new(options(OutputPaths::in_dir(dir, &kinds)));
        let image = builder.build(sample(), &targets()).expect("build");
        let report = builder.write_archives(&image).into_result().expect("archives");
        let modules: Vec<Vec<u8>> = image
            .shards
            .iter()
            .map(|shard| serialize(&shard.module).expect("serialize"))
            .collect();
        let digests: Vec<String> = report
            .archives
            .into_iter()
            .map(|archive| archive.outcome.expect("digest"))
            .collect();
        (modules, serialize(&image.data).expect("data"), digests)
    };
    assert_eq!(build(first_dir.path()), build(second_dir.path()));
}

#[cfg(unix)]
#[test]
fn external_tool_receives_the_textual_module() {
    use imgshard::image::backend::ExternalToolBackend;

    let dir = tempdir().expect("tempdir");
    let outputs = OutputPaths::in_dir(dir.path(), &[OutputKind::Assembly]);
    let backend = ExternalToolBackend::new("sh", vec!["-c".into(), "cat".into(), "sh".into()]);
    let report = ImageBuilder::new(options(outputs))
        .with_backend(Box::new(backend))
        .dump_native(sample(), &targets())
        .expect("dump")
        .into_result()
        .expect("archive");
    let bytes = fs::read(&report.archives[0].path).expect("archive");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("text_0.s"));
    assert!(text.contains("F.reloc_slot"));
}

use super::reporting::{print_build_report, report_error_to};
use super::*;
use crate::cli::CliError;
use crate::image::{ArchiveReport, BuildReport, OutputKind};
use crate::ir::{Block, Constant, Function, FunctionType, Instruction, Operand, Type, Variable};
use crate::logging::LogOptions;
use std::path::PathBuf;
use tempfile::tempdir;

fn cli(command: Command) -> Cli {
    Cli {
        command,
        log_options: LogOptions {
            level: crate::logging::LogLevel::Error,
            ..LogOptions::DEFAULT
        },
    }
}

fn run_to_string(command: Command) -> Result<String> {
    let mut out = Vec::new();
    run_with_output(cli(command), &mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn define(module: &mut Module, name: &str, insts: Vec<Instruction>) -> crate::ir::ValueId {
    let mut function = Function::declaration(FunctionType::void());
    let mut insts = insts;
    insts.push(Instruction::ret(None));
    function.blocks.push(Block {
        name: "entry".into(),
        insts,
    });
    module.add_function(name, function).expect("define")
}

/// `vec` touches a vector, `user` calls it and `table` points at `user`.
fn write_sample(dir: &Path) -> PathBuf {
    let mut module = Module::new("sample", "x86_64-unknown-linux-gnu");
    let vector = define(
        &mut module,
        "vec",
        vec![Instruction::new(
            crate::ir::Opcode::Alloca,
            Type::vector(Type::Float, 4),
            Vec::new(),
        )
        .with_result(crate::ir::LocalId(0))],
    );
    let user = define(
        &mut module,
        "user",
        vec![Instruction::call(
            Operand::global(vector),
            FunctionType::void(),
            Vec::new(),
        )],
    );
    define(&mut module, "lonely", Vec::new());
    module
        .add_variable(
            "table",
            Variable::new(
                Type::array(Type::Ptr, 1),
                Constant::ptr_array(vec![Constant::global(user)]),
            ),
        )
        .expect("table");
    module.exports.functions = vec![vector, user];
    let path = dir.join("sample.json");
    fs::write(&path, ir::serialize(&module).expect("serialize")).expect("write module");
    path
}

#[test]
fn help_and_version_write_to_the_given_output() {
    let general = run_to_string(Command::Help { topic: None }).expect("help");
    assert!(general.contains("USAGE:"));
    let build = run_to_string(Command::Help {
        topic: Some("dump".into()),
    })
    .expect("build help");
    assert!(build.starts_with("imgshard build - "));
    let err = run_to_string(Command::Help {
        topic: Some("nope".into()),
    })
    .expect_err("unknown topic");
    assert!(matches!(err, Error::Cli(_)));

    let version = run_to_string(Command::Version).expect("version");
    assert_eq!(version, format!("imgshard {}\n", env!("CARGO_PKG_VERSION")));
}

#[test]
fn partition_prints_every_shard() {
    let dir = tempdir().expect("tempdir");
    let input = write_sample(dir.path());
    let text = run_to_string(Command::Partition {
        input,
        config: None,
        threads: Some(2),
        colocation: None,
    })
    .expect("partition");
    assert!(text.starts_with("module sample: 2 partitions"));
    assert!(text.contains("partition 0: weight "));
    assert!(text.contains("partition 1: weight "));
    for name in ["vec", "user", "lonely", "table"] {
        assert!(text.contains(&format!("\n  {name}\n")), "{name} missing:\n{text}");
    }
}

#[test]
fn annotate_reports_slots_and_clone_counts() {
    let dir = tempdir().expect("tempdir");
    let input = write_sample(dir.path());
    let text = run_to_string(Command::Annotate {
        input,
        config: None,
        targets: Some("generic;haswell,+avx2,clone_simd".into()),
    })
    .expect("annotate");
    assert!(text.starts_with(
        "module sample: 3 functions, 1 relocation slots, 0 fvars, vector calls: no\n"
    ));
    assert!(text.contains("target 1: 1 clones\n"));
    assert!(text.contains("  vec clones=2 reloc\n"));
}

#[test]
fn build_without_outputs_reports_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let input = write_sample(dir.path());
    let text = run_to_string(Command::Build {
        input,
        config: None,
        overrides: ConfigOverrides::default(),
        threads: None,
    })
    .expect("build");
    assert_eq!(text, "no outputs requested; nothing was built (use --emit)\n");
}

#[test]
fn missing_modules_name_the_path() {
    let err = load_module(Path::new("/definitely/not/here.json")).expect_err("missing");
    assert!(err.to_string().contains("/definitely/not/here.json"));

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("broken.json");
    fs::write(&path, b"{ not json").expect("write");
    let err = load_module(&path).expect_err("broken");
    assert!(matches!(err, Error::Serialization(ref message) if message.contains("broken.json")));
}

#[test]
fn report_error_prints_cli_errors_verbatim() {
    let mut out = Vec::new();
    report_error_to(&Error::Cli(CliError::new("bad flag")), &mut out).expect("report");
    assert_eq!(String::from_utf8_lossy(&out), "bad flag\n");

    let mut out = Vec::new();
    report_error_to(&Error::config("threads must be positive"), &mut out).expect("report");
    assert!(String::from_utf8_lossy(&out)
        .starts_with("error: configuration error: threads must be positive\n"));
}

#[test]
fn build_report_lists_digests_and_failures() {
    let report = BuildReport {
        threads: 2,
        weights: vec![7, 5],
        archives: vec![
            ArchiveReport {
                kind: OutputKind::Object,
                path: PathBuf::from("out/image_obj.a"),
                outcome: Ok("abc123".into()),
            },
            ArchiveReport {
                kind: OutputKind::Assembly,
                path: PathBuf::from("out/image_asm.a"),
                outcome: Err(Error::output(
                    "out/image_asm.a",
                    io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                )),
            },
        ],
    };
    let mut out = Vec::new();
    print_build_report(&report, &mut out).expect("print");
    let text = String::from_utf8_lossy(&out);
    assert!(text.starts_with("shards: 2 (weights 7 5)\n"));
    assert!(text.contains("  obj       out/image_obj.a blake3:abc123\n"));
    assert!(text.contains("  asm       out/image_asm.a FAILED: "));
}

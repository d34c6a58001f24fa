use super::*;
use crate::image::backend::OptLevel;
use crate::image::OutputKind;
use crate::logging::{LogFormat, LogLevel};

fn expect_cli_ok<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    match Cli::parse_from(args.into_iter()) {
        Ok(cli) => cli,
        Err(err) => panic!("expected CLI parse to succeed, found error: {err}"),
    }
}

fn expect_cli_err<I, T>(args: I) -> CliError
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    match Cli::parse_from(args.into_iter()) {
        Ok(cli) => panic!("expected CLI parse to fail, parsed {:?}", cli.command),
        Err(err) => err,
    }
}

#[test]
fn registry_resolves_canonical_and_alias_commands() {
    let registry = registry();
    let build = registry.resolve("build").expect("build registered");
    assert_eq!(build.name(), "build");
    assert_eq!(
        registry.resolve("dump").map(CommandDescriptor::name),
        Some("build")
    );
    assert_eq!(
        registry.resolve("plan").map(CommandDescriptor::name),
        Some("partition")
    );
    assert!(registry.resolve("link").is_none());
    let names: Vec<_> = registry.iter().map(CommandDescriptor::name).collect();
    assert_eq!(names, ["build", "partition", "annotate"]);
}

#[test]
fn parses_build_with_every_flag() {
    let cli = expect_cli_ok([
        "build",
        "app.json",
        "--targets",
        "generic;haswell,+avx2",
        "-t",
        "3",
        "--emit",
        "obj,asm,obj",
        "--out-dir=out",
        "--image-data",
        "payload.bin",
        "--colocation",
        "data-only",
        "-O",
        "3",
    ]);
    let Command::Build {
        input,
        config,
        overrides,
        threads,
    } = cli.command
    else {
        panic!("expected build, got {:?}", cli.command);
    };
    assert_eq!(input, PathBuf::from("app.json"));
    assert_eq!(config, None);
    assert_eq!(threads, Some(3));
    assert_eq!(overrides.targets.as_deref(), Some("generic;haswell,+avx2"));
    assert_eq!(overrides.emit, vec![OutputKind::Object, OutputKind::Assembly]);
    assert_eq!(overrides.out_dir, Some(PathBuf::from("out")));
    assert_eq!(overrides.image_data, Some(PathBuf::from("payload.bin")));
    assert_eq!(overrides.colocation, Some(ColocationPolicy::DataOnly));
    assert_eq!(overrides.opt_level, Some(OptLevel::O3));
}

#[test]
fn global_options_before_the_command_are_forwarded() {
    let cli = expect_cli_ok([
        "--log-format",
        "json",
        "--config",
        "imgshard.yaml",
        "plan",
        "app.json",
        "--log-level",
        "debug",
    ]);
    assert_eq!(cli.log_options.format, LogFormat::Json);
    assert_eq!(cli.log_options.level, LogLevel::Debug);
    assert_eq!(
        cli.command,
        Command::Partition {
            input: PathBuf::from("app.json"),
            config: Some(PathBuf::from("imgshard.yaml")),
            threads: None,
            colocation: None,
        }
    );
}

#[test]
fn annotate_takes_targets_only() {
    let cli = expect_cli_ok(["annotate", "app.json", "--targets", "generic;skylake,clone_all"]);
    assert_eq!(cli.command.name(), "annotate");
    let err = expect_cli_err(["annotate", "app.json", "--threads", "2"]);
    assert!(err
        .message()
        .starts_with("unsupported option '--threads' for imgshard annotate"));
}

#[test]
fn help_and_version_forms() {
    assert_eq!(expect_cli_ok(["--help"]).command, Command::Help { topic: None });
    assert_eq!(
        expect_cli_ok(["help", "Build"]).command,
        Command::Help {
            topic: Some("build".into())
        }
    );
    assert_eq!(
        expect_cli_ok(["partition", "--help"]).command,
        Command::Help {
            topic: Some("partition".into())
        }
    );
    assert_eq!(expect_cli_ok(["-V"]).command, Command::Version);
    assert_eq!(
        expect_cli_ok(["version", "-h"]).command,
        Command::Help {
            topic: Some("version".into())
        }
    );
    expect_cli_err(["version", "extra"]);
}

#[test]
fn help_text_covers_aliases_and_unknown_topics() {
    let text = Cli::help_for("dump").expect("dump help");
    assert!(text.starts_with("imgshard build - "));
    assert!(text.contains("ALIASES:\n  dump"));
    let usage = Cli::usage();
    assert!(usage.contains("COMMANDS:"));
    assert!(usage.contains("(alias: dump)\n"), "{usage}");
    assert!(usage.contains("(alias: plan)\n"), "{usage}");
    assert!(usage.contains("  annotate    Print which functions get per-target clones and relocation slots.\n"));
    let err = Cli::help_for("link").expect_err("unknown topic");
    assert!(err
        .message()
        .starts_with("unknown help topic 'link'; available commands: annotate, build, help"));
}

#[test]
fn rejects_malformed_invocations() {
    let cases: &[(&[&str], &str)] = &[
        (&[], "missing command"),
        (&["link"], "unknown command 'link'"),
        (&["--bogus", "build"], "unsupported global option '--bogus'"),
        (&["build"], "imgshard build requires a module path"),
        (&["build", "a.json", "b.json"], "accepts exactly one module path"),
        (&["build", "a.json", "--threads", "0"], "--threads expects a positive integer"),
        (&["build", "a.json", "--emit", "elf"], "unknown output kind 'elf'"),
        (&["build", "a.json", "--targets"], "expected value after --targets"),
        (&["build", "a.json", "--targets="], "--targets requires a non-empty value"),
        (&["partition", "a.json", "--colocation", "never"], "never"),
        (&["build", "a.json", "-O", "9"], "unknown optimization level"),
        (&["build", "a.json", "--log-level", "loud"], "unsupported log level 'loud'"),
        (&["--config"], "expected value after --config"),
    ];
    for (args, expected) in cases {
        let err = expect_cli_err(args.iter().copied());
        assert!(
            err.message().contains(expected),
            "{args:?}: expected '{expected}' in '{}'",
            err.message()
        );
        assert!(err.message().contains("USAGE:"), "{args:?} lacks usage");
    }
}

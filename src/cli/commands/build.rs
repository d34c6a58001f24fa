use crate::config::ConfigOverrides;

use super::super::{Cli, CliError, Command};
use super::common::{is_help_flag, parse_command_options, Flag};

const ACCEPTED: &[Flag] = &[
    Flag::Targets,
    Flag::Threads,
    Flag::Emit,
    Flag::OutDir,
    Flag::ImageData,
    Flag::Colocation,
    Flag::OptLevel,
];

pub(super) fn parse(args: Vec<String>) -> Result<Cli, CliError> {
    if args.iter().any(|value| is_help_flag(value)) {
        return Ok(Cli::help(Some("build".into())));
    }
    let options = parse_command_options("build", args, ACCEPTED)?;
    let input = options.require_input("build")?;
    Ok(Cli {
        command: Command::Build {
            input,
            config: options.config,
            overrides: ConfigOverrides {
                targets: options.targets,
                emit: options.emit,
                out_dir: options.out_dir,
                image_data: options.image_data,
                colocation: options.colocation,
                opt_level: options.opt_level,
            },
            threads: options.threads,
        },
        log_options: options.log.resolve(),
    })
}

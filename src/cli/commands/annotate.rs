use super::super::{Cli, CliError, Command};
use super::common::{is_help_flag, parse_command_options, Flag};

pub(super) fn parse(args: Vec<String>) -> Result<Cli, CliError> {
    if args.iter().any(|value| is_help_flag(value)) {
        return Ok(Cli::help(Some("annotate".into())));
    }
    let options = parse_command_options("annotate", args, &[Flag::Targets])?;
    Ok(Cli {
        command: Command::Annotate {
            input: options.require_input("annotate")?,
            config: options.config,
            targets: options.targets,
        },
        log_options: options.log.resolve(),
    })
}

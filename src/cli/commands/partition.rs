use super::super::{Cli, CliError, Command};
use super::common::{is_help_flag, parse_command_options, Flag};

pub(super) fn parse(args: Vec<String>) -> Result<Cli, CliError> {
    if args.iter().any(|value| is_help_flag(value)) {
        return Ok(Cli::help(Some("partition".into())));
    }
    let options =
        parse_command_options("partition", args, &[Flag::Threads, Flag::Colocation])?;
    Ok(Cli {
        command: Command::Partition {
            input: options.require_input("partition")?,
            config: options.config,
            threads: options.threads,
            colocation: options.colocation,
        },
        log_options: options.log.resolve(),
    })
}

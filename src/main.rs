#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

use imgshard::cli::{dispatch, Cli};
use imgshard::error::Result;
use std::process::ExitCode;

fn main() -> ExitCode {
    run_with_args(std::env::args().skip(1))
}

fn run_with_args<I, S>(args: I) -> ExitCode
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    match try_main(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            dispatch::report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn try_main<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli = Cli::parse_from(args.into_iter())?;
    dispatch::run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgshard::error::Error;

    #[test]
    fn run_with_args_returns_success_for_help() {
        assert_eq!(run_with_args(["help"]), ExitCode::SUCCESS);
    }

    #[test]
    fn run_with_args_reports_error_on_missing_command() {
        assert_eq!(run_with_args(std::iter::empty::<String>()), ExitCode::FAILURE);
    }

    #[test]
    fn try_main_forwards_parse_errors() {
        let err = try_main(["partition"]).expect_err("partition needs a module");
        match err {
            Error::Cli(cli) => assert!(cli.message().contains("requires a module path")),
            other => panic!("expected CLI error, found {other:?}"),
        }
    }

    #[test]
    fn missing_module_is_an_io_error() {
        let err = try_main(["annotate", "/no/such/module.json"]).expect_err("missing module");
        assert!(matches!(err, Error::Io(_)), "{err:?}");
    }
}

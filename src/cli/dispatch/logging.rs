use std::path::Path;
use std::time::Duration;

use crate::cli::Command;
use crate::logging::{LogFormat, LogOptions};

/// Install the stderr subscriber once per process; later calls are no-ops.
pub(super) fn init_logging(options: &LogOptions) {
    use std::io::IsTerminal;
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt, EnvFilter};

    static INITIALISED: OnceLock<()> = OnceLock::new();

    let _ = INITIALISED.get_or_init(|| {
        let use_ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
        let level = options.level.as_tracing_level();
        let make_filter = || {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(options.level.directive()))
        };

        match options.format {
            LogFormat::Json => {
                let subscriber = fmt::fmt()
                    .with_env_filter(make_filter())
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_names(true)
                    .json()
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
            _ => {
                let subscriber = fmt::fmt()
                    .with_env_filter(make_filter())
                    .with_max_level(level)
                    .with_ansi(use_ansi)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_names(true)
                    .compact()
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
    });
}

fn command_input(command: &Command) -> Option<&Path> {
    match command {
        Command::Build { input, .. }
        | Command::Partition { input, .. }
        | Command::Annotate { input, .. } => Some(input),
        Command::Help { .. } | Command::Version => None,
    }
}

pub(super) fn log_run_start(command: &Command, options: &LogOptions) {
    tracing::info!(
        target: "image",
        stage = "cli.run.start",
        command = command.name(),
        log_level = %options.level,
        log_format = %options.format,
        input = %command_input(command).map_or_else(|| "<none>".into(), |path| path.display().to_string()),
    );
}

pub(super) fn log_run_complete(
    command: &Command,
    elapsed: Duration,
    result: &crate::error::Result<()>,
) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok(()) => tracing::info!(
            target: "image",
            stage = "cli.run.footer",
            command = command.name(),
            status = "ok",
            elapsed_ms
        ),
        Err(err) => tracing::error!(
            target: "image",
            stage = "cli.run.footer",
            command = command.name(),
            status = "error",
            fatal = err.is_fatal(),
            elapsed_ms,
            error = %err
        ),
    }
}

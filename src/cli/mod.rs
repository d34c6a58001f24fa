//! CLI front-end: command parsing, registry, and dispatch used by the `imgshard` binary.

mod commands;
mod help;

use std::env;
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigOverrides;
use crate::graph::ColocationPolicy;
use crate::logging::LogOptions;
use commands::common::is_help_flag;

pub mod dispatch;

pub(crate) type CommandParser = fn(Vec<String>) -> Result<Cli, CliError>;

#[derive(Clone, Copy)]
pub(crate) struct CommandDescriptor {
    name: &'static str,
    aliases: &'static [&'static str],
    parser: CommandParser,
}

impl CommandDescriptor {
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn aliases(&self) -> &'static [&'static str] {
        self.aliases
    }

    pub(crate) fn parse(&self, args: Vec<String>) -> Result<Cli, CliError> {
        (self.parser)(args)
    }

    fn matches(&self, name: &str) -> bool {
        self.name() == name || self.aliases().iter().any(|alias| *alias == name)
    }
}

pub(crate) struct CommandRegistry {
    entries: &'static [CommandDescriptor],
}

impl CommandRegistry {
    pub(crate) fn new(entries: &'static [CommandDescriptor]) -> Self {
        Self { entries }
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&'static CommandDescriptor> {
        self.entries.iter().find(|descriptor| descriptor.matches(name))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &'static CommandDescriptor> {
        self.entries.iter()
    }
}

pub(crate) fn registry() -> CommandRegistry {
    CommandRegistry::new(commands::descriptors())
}

/// Top-level commands supported by the `imgshard` CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Build the sharded native image and write one archive per output kind.
    Build {
        input: PathBuf,
        config: Option<PathBuf>,
        overrides: ConfigOverrides,
        /// `-t/--threads`; only ever lowers the computed shard count.
        threads: Option<usize>,
    },
    /// Print the partition plan without compiling anything.
    Partition {
        input: PathBuf,
        config: Option<PathBuf>,
        threads: Option<usize>,
        colocation: Option<ColocationPolicy>,
    },
    /// Print the clone annotations for a target list.
    Annotate {
        input: PathBuf,
        config: Option<PathBuf>,
        targets: Option<String>,
    },
    Help {
        topic: Option<String>,
    },
    Version,
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Build { .. } => "build",
            Command::Partition { .. } => "partition",
            Command::Annotate { .. } => "annotate",
            Command::Help { .. } => "help",
            Command::Version => "version",
        }
    }
}

/// Parsed CLI invocation.
#[derive(Debug, Clone)]
pub struct Cli {
    pub command: Command,
    pub log_options: LogOptions,
}

impl Cli {
    fn help(topic: Option<String>) -> Self {
        Cli {
            command: Command::Help { topic },
            log_options: LogOptions::from_env(),
        }
    }
}

/// Error produced while parsing CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliError {
    message: String,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn with_usage(message: impl Into<String>) -> Self {
        let mut owned = message.into();
        owned.push_str("\n\n");
        owned.push_str(&Cli::usage());
        Self::new(owned)
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for CliError {}

impl Cli {
    /// Parse arguments from the environment.
    ///
    /// # Errors
    /// Returns a [`CliError`] when the arguments cannot be interpreted as a supported command.
    pub fn parse() -> Result<Self, CliError> {
        Self::parse_from(env::args().skip(1))
    }

    /// Parse arguments from an iterator (useful for testing).
    ///
    /// Logging flags given before the command apply to it as if they had
    /// been written after it.
    ///
    /// # Errors
    /// Returns a [`CliError`] when the provided iterator does not describe a valid invocation.
    pub fn parse_from<I, T>(args: I) -> Result<Self, CliError>
    where
        I: Iterator<Item = T>,
        T: Into<String>,
    {
        let mut iter = args.map(Into::into).peekable();
        let mut global_prefix = Vec::new();
        while let Some(flag) = iter.peek().cloned() {
            if !flag.starts_with('-') || flag == "--" {
                break;
            }
            if is_help_flag(&flag) || matches!(flag.as_str(), "--version" | "-V") {
                break;
            }
            if let Some(consumed) = consume_global_option(&mut iter)? {
                global_prefix.extend(consumed);
                continue;
            }
            return Err(CliError::with_usage(format!(
                "unsupported global option '{flag}'"
            )));
        }

        let Some(raw_command) = iter.next() else {
            return Err(CliError::with_usage("missing command"));
        };

        match raw_command.as_str() {
            "--help" | "-h" | "help" => {
                let topic = iter
                    .next()
                    .filter(|value| !is_help_flag(value))
                    .map(|value| value.to_ascii_lowercase());
                return Ok(Cli::help(topic));
            }
            "--version" | "-V" | "version" => {
                let remaining: Vec<String> = iter.collect();
                if remaining.iter().any(|value| is_help_flag(value)) {
                    return Ok(Cli::help(Some("version".into())));
                }
                if !remaining.is_empty() {
                    return Err(CliError::with_usage(
                        "imgshard version does not accept additional arguments",
                    ));
                }
                return Ok(Cli {
                    command: Command::Version,
                    log_options: LogOptions::from_env(),
                });
            }
            _ => {}
        }

        let mut remaining: Vec<String> = iter.collect();
        if !global_prefix.is_empty() {
            let mut merged = global_prefix;
            merged.append(&mut remaining);
            remaining = merged;
        }
        if let Some(descriptor) = registry().resolve(&raw_command) {
            return descriptor.parse(remaining);
        }

        Err(CliError::with_usage(format!(
            "unknown command '{raw_command}'"
        )))
    }

    /// Return formatted general help text.
    #[must_use]
    pub fn usage() -> String {
        help::render_general_help()
    }

    /// Return help text for a specific command.
    ///
    /// # Errors
    /// Returns a [`CliError`] when the requested topic is unknown.
    pub fn help_for(topic: &str) -> Result<String, CliError> {
        help::render_command_help(topic)
            .ok_or_else(|| CliError::with_usage(help::format_unknown_topic(topic)))
    }
}

fn consume_global_option<I>(
    iter: &mut std::iter::Peekable<I>,
) -> Result<Option<Vec<String>>, CliError>
where
    I: Iterator<Item = String>,
{
    let Some(flag) = iter.peek().cloned() else {
        return Ok(None);
    };
    match flag.as_str() {
        "--log-format" | "--log-level" | "--config" => {
            iter.next();
            let value = iter
                .next()
                .ok_or_else(|| CliError::with_usage(format!("expected value after {flag}")))?;
            Ok(Some(vec![flag, value]))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::str::FromStr;

use crate::graph::ColocationPolicy;
use crate::image::backend::OptLevel;
use crate::image::OutputKind;
use crate::logging::LogOverrides;

use super::super::CliError;

pub(crate) fn is_help_flag(value: &str) -> bool {
    matches!(value, "-h" | "--help")
}

/// Flags a command accepts besides `--config` and the logging flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flag {
    Targets,
    Threads,
    Emit,
    OutDir,
    ImageData,
    Colocation,
    OptLevel,
}

impl Flag {
    fn from_spelling(spelling: &str) -> Option<Self> {
        match spelling {
            "--targets" => Some(Flag::Targets),
            "-t" | "--threads" => Some(Flag::Threads),
            "--emit" => Some(Flag::Emit),
            "--out-dir" | "-o" => Some(Flag::OutDir),
            "--image-data" => Some(Flag::ImageData),
            "--colocation" => Some(Flag::Colocation),
            "-O" | "--opt-level" => Some(Flag::OptLevel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOptions {
    pub input: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub targets: Option<String>,
    pub threads: Option<usize>,
    pub emit: Vec<OutputKind>,
    pub out_dir: Option<PathBuf>,
    pub image_data: Option<PathBuf>,
    pub colocation: Option<ColocationPolicy>,
    pub opt_level: Option<OptLevel>,
    pub log: LogOverrides,
}

impl CommandOptions {
    pub(crate) fn require_input(&self, command: &str) -> Result<PathBuf, CliError> {
        self.input.clone().ok_or_else(|| {
            CliError::with_usage(format!("imgshard {command} requires a module path"))
        })
    }
}

/// Parse `args` for `command`, rejecting flags outside `accepted`.
pub(crate) fn parse_command_options(
    command: &str,
    args: Vec<String>,
    accepted: &[Flag],
) -> Result<CommandOptions, CliError> {
    let mut options = CommandOptions::default();
    let mut idx = 0;
    while idx < args.len() {
        let raw = &args[idx];
        idx += 1;
        let (spelling, inline) = match raw.split_once('=') {
            Some((flag, value)) if raw.starts_with("--") => (flag, Some(value.to_string())),
            _ => (raw.as_str(), None),
        };
        let mut value = |flag: &str| -> Result<String, CliError> {
            if let Some(value) = inline.clone() {
                return non_empty(flag, value);
            }
            let Some(value) = args.get(idx) else {
                return Err(CliError::with_usage(format!("expected value after {flag}")));
            };
            idx += 1;
            non_empty(flag, value.clone())
        };

        match spelling {
            "--config" => options.config = Some(PathBuf::from(value("--config")?)),
            "--log-format" => {
                let format = value("--log-format")?.parse().map_err(CliError::with_usage)?;
                options.log.format = Some(format);
            }
            "--log-level" => {
                let level = value("--log-level")?.parse().map_err(CliError::with_usage)?;
                options.log.level = Some(level);
            }
            other if other.starts_with('-') && other.len() > 1 => {
                let Some(flag) = Flag::from_spelling(other).filter(|flag| accepted.contains(flag))
                else {
                    return Err(CliError::with_usage(format!(
                        "unsupported option '{other}' for imgshard {command}"
                    )));
                };
                apply_flag(&mut options, flag, value(other)?)?;
            }
            other => {
                if options.input.is_some() {
                    return Err(CliError::with_usage(format!(
                        "imgshard {command} accepts exactly one module path"
                    )));
                }
                options.input = Some(PathBuf::from(other));
            }
        }
    }
    Ok(options)
}

fn non_empty(flag: &str, value: String) -> Result<String, CliError> {
    if value.trim().is_empty() {
        return Err(CliError::with_usage(format!("{flag} requires a non-empty value")));
    }
    Ok(value)
}

fn apply_flag(options: &mut CommandOptions, flag: Flag, value: String) -> Result<(), CliError> {
    match flag {
        Flag::Targets => options.targets = Some(value),
        Flag::Threads => {
            let count = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| {
                    CliError::with_usage(format!(
                        "--threads expects a positive integer, got '{value}'"
                    ))
                })?;
            options.threads = Some(count);
        }
        Flag::Emit => {
            for token in value.split(',').filter(|token| !token.trim().is_empty()) {
                let kind = OutputKind::parse(token).ok_or_else(|| {
                    CliError::with_usage(format!(
                        "unknown output kind '{}' (expected unopt-ir, opt-ir, obj or asm)",
                        token.trim()
                    ))
                })?;
                if !options.emit.contains(&kind) {
                    options.emit.push(kind);
                }
            }
        }
        Flag::OutDir => options.out_dir = Some(PathBuf::from(value)),
        Flag::ImageData => options.image_data = Some(PathBuf::from(value)),
        Flag::Colocation => {
            let policy = ColocationPolicy::from_str(&value)
                .map_err(|err| CliError::with_usage(err.to_string()))?;
            options.colocation = Some(policy);
        }
        Flag::OptLevel => {
            let level =
                OptLevel::from_str(&value).map_err(|err| CliError::with_usage(err.to_string()))?;
            options.opt_level = Some(level);
        }
    }
    Ok(())
}

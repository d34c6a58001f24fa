//! Logging controls for image builds.
//!
//! Pipeline events use the `image` tracing target and carry a `stage` field.
//! Work done on a shard worker runs inside a `shard` span, so every event a
//! worker raises is attributed to its shard index and partition weight.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use tracing::Span;

pub const LOG_FORMAT_ENV: &str = "IMGSHARD_LOG_FORMAT";
pub const LOG_LEVEL_ENV: &str = "IMGSHARD_LOG_LEVEL";

/// Rendering of build events on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Auto,
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Auto => "auto",
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        match spec.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unsupported log format '{spec}' (expected auto, text or json)"
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbosity. `debug` adds per-stage timings and per-shard summaries,
/// `trace` adds per-function clone decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[must_use]
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        match spec.to_ascii_lowercase().as_str() {
            "error" | "err" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" | "verbose" => Ok(Self::Trace),
            _ => Err(format!(
                "unsupported log level '{spec}' (expected error, warn, info, debug or trace)"
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

/// Effective logging configuration for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl LogOptions {
    pub const DEFAULT: Self = Self {
        format: LogFormat::Auto,
        level: LogLevel::Info,
    };

    /// Defaults with [`LOG_FORMAT_ENV`] and [`LOG_LEVEL_ENV`] applied.
    /// Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let read = |name: &str| env::var_os(name).map(|value| value.to_string_lossy().into_owned());
        LogOverrides::parse_lossy(read(LOG_FORMAT_ENV).as_deref(), read(LOG_LEVEL_ENV).as_deref())
            .apply_to(Self::DEFAULT)
    }

    /// Settle `auto` to the concrete format the subscriber installs.
    #[must_use]
    pub fn resolved(self) -> Self {
        let format = match self.format {
            LogFormat::Auto => LogFormat::Text,
            other => other,
        };
        Self { format, ..self }
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// `--log-format` / `--log-level` given on the command line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogOverrides {
    pub format: Option<LogFormat>,
    pub level: Option<LogLevel>,
}

impl LogOverrides {
    fn parse_lossy(format: Option<&str>, level: Option<&str>) -> Self {
        Self {
            format: format.and_then(|spec| spec.parse().ok()),
            level: level.and_then(|spec| spec.parse().ok()),
        }
    }

    #[must_use]
    pub fn apply_to(self, base: LogOptions) -> LogOptions {
        LogOptions {
            format: self.format.unwrap_or(base.format),
            level: self.level.unwrap_or(base.level),
        }
    }

    /// Command line over environment over defaults.
    #[must_use]
    pub fn resolve(self) -> LogOptions {
        self.apply_to(LogOptions::from_env())
    }
}

/// Span covering everything one shard worker does.
#[must_use]
pub fn shard_span(shard: usize, weight: u64) -> Span {
    tracing::info_span!(target: "image", "shard", shard, weight)
}

/// Wall-clock timer for one pipeline stage; logs `elapsed_ms` when finished.
///
/// Timers started on a worker inherit the surrounding [`shard_span`].
#[derive(Debug)]
pub struct StageTimer {
    component: &'static str,
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    #[must_use]
    pub fn start(component: &'static str, stage: &'static str) -> Self {
        Self {
            component,
            stage,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Emit the stage completion event and return the elapsed milliseconds.
    pub fn finish(self) -> u64 {
        let elapsed_ms = self.elapsed_ms();
        tracing::debug!(
            target: "image",
            component = self.component,
            stage = self.stage,
            status = "ok",
            elapsed_ms
        );
        elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_levels_parse_case_insensitively() {
        assert_eq!("text".parse(), Ok(LogFormat::Text));
        assert_eq!("JSON".parse(), Ok(LogFormat::Json));
        assert_eq!("plain".parse(), Ok(LogFormat::Text));
        let err = "xml".parse::<LogFormat>().expect_err("xml");
        assert!(err.starts_with("unsupported log format 'xml'"));

        assert_eq!("warning".parse(), Ok(LogLevel::Warn));
        assert_eq!("INFO".parse(), Ok(LogLevel::Info));
        assert_eq!("verbose".parse(), Ok(LogLevel::Trace));
        assert!("noop".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "debug");
    }

    #[test]
    fn environment_values_that_do_not_parse_are_ignored() {
        let overrides = LogOverrides::parse_lossy(Some("json"), Some("loud"));
        assert_eq!(
            overrides.apply_to(LogOptions::DEFAULT),
            LogOptions {
                format: LogFormat::Json,
                level: LogLevel::Info,
            }
        );
    }

    #[test]
    fn command_line_overrides_win_over_the_environment() {
        let env = LogOverrides::parse_lossy(Some("text"), Some("warn")).apply_to(LogOptions::DEFAULT);
        let merged = LogOverrides {
            format: Some(LogFormat::Json),
            level: None,
        }
        .apply_to(env);
        assert_eq!(merged.format, LogFormat::Json);
        assert_eq!(merged.level, LogLevel::Warn);
    }

    #[test]
    fn resolved_auto_defaults_to_text() {
        assert_eq!(LogOptions::DEFAULT.resolved().format, LogFormat::Text);
        let json = LogOptions {
            format: LogFormat::Json,
            level: LogLevel::Debug,
        };
        assert_eq!(json.resolved(), json);
    }

    #[test]
    fn shard_spans_record_index_and_weight() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = shard_span(3, 120);
            let metadata = span.metadata().expect("enabled span");
            assert_eq!(metadata.name(), "shard");
            assert_eq!(metadata.target(), "image");
            assert!(metadata.fields().field("shard").is_some());
            assert!(metadata.fields().field("weight").is_some());
        });
    }

    #[test]
    fn stage_timer_reports_monotonic_elapsed_time() {
        let timer = StageTimer::start("partition", "union-find");
        let first = timer.elapsed_ms();
        assert!(timer.finish() >= first);
    }
}

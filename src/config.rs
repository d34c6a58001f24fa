//! Image build configuration.
//!
//! Values come from an optional YAML file, then the environment, then the
//! command line; each layer replaces what the previous one set.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::graph::ColocationPolicy;
use crate::image::backend::{CodegenBackend, ExternalToolBackend, OptLevel, ReferenceBackend};
use crate::image::threads::ThreadSettings;
use crate::image::{ImageOptions, OutputKind, OutputPaths};
use crate::target::TargetList;

pub const DEFAULT_TARGETS: &str = "generic";

pub const TARGETS_ENV: &str = "IMGSHARD_TARGETS";
pub const IMAGE_THREADS_ENV: &str = crate::image::threads::IMAGE_THREADS_ENV;
pub const COLOCATION_ENV: &str = "IMGSHARD_COLOCATION";
pub const OPT_LEVEL_ENV: &str = "IMGSHARD_OPT_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendConfig {
    #[default]
    Reference,
    External {
        program: String,
        args: Vec<String>,
    },
}

impl BackendConfig {
    #[must_use]
    pub fn instantiate(&self, level: OptLevel) -> Box<dyn CodegenBackend> {
        match self {
            BackendConfig::Reference => Box::new(ReferenceBackend),
            BackendConfig::External { program, args } => Box::new(
                ExternalToolBackend::new(program.clone(), args.clone()).with_opt_level(level),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// `;`-separated target list.
    pub targets: String,
    /// Explicit shard count, kept as written so invalid values can be reported.
    pub threads: Option<String>,
    pub colocation: ColocationPolicy,
    pub opt_level: OptLevel,
    pub outputs: OutputPaths,
    pub image_data: Option<PathBuf>,
    pub backend: BackendConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            targets: DEFAULT_TARGETS.to_string(),
            threads: None,
            colocation: ColocationPolicy::default(),
            opt_level: OptLevel::default(),
            outputs: OutputPaths::default(),
            image_data: None,
            backend: BackendConfig::default(),
        }
    }
}

/// Command-line layer; `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub targets: Option<String>,
    pub emit: Vec<OutputKind>,
    pub out_dir: Option<PathBuf>,
    pub image_data: Option<PathBuf>,
    pub colocation: Option<ColocationPolicy>,
    pub opt_level: Option<OptLevel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImageConfig {
    #[serde(default)]
    targets: Option<String>,
    #[serde(default)]
    threads: Option<RawScalar>,
    #[serde(default)]
    colocation: Option<String>,
    #[serde(default)]
    opt_level: Option<RawScalar>,
    #[serde(default)]
    outputs: RawOutputs,
    #[serde(default)]
    image_data: Option<PathBuf>,
    #[serde(default)]
    backend: Option<RawBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(i64),
    Text(String),
}

impl RawScalar {
    fn into_string(self) -> String {
        match self {
            RawScalar::Int(value) => value.to_string(),
            RawScalar::Text(value) => value,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutputs {
    #[serde(default)]
    unopt_ir: Option<PathBuf>,
    #[serde(default)]
    opt_ir: Option<PathBuf>,
    #[serde(default)]
    object: Option<PathBuf>,
    #[serde(default)]
    assembly: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBackend {
    Named(String),
    External { external: RawExternal },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExternal {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl ImageConfig {
    /// Parse a YAML document. Relative paths resolve against `base_dir`.
    ///
    /// # Errors
    ///
    /// Malformed YAML, unknown keys and unknown enum values are
    /// configuration errors.
    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawImageConfig = if text.trim().is_empty() {
            RawImageConfig::default()
        } else {
            serde_yaml::from_str(text).map_err(|err| Error::config(err.to_string()))?
        };
        let mut config = Self::default();
        if let Some(targets) = raw.targets {
            config.targets = targets;
        }
        config.threads = raw.threads.map(RawScalar::into_string);
        if let Some(policy) = raw.colocation {
            config.colocation = ColocationPolicy::from_str(&policy)?;
        }
        if let Some(level) = raw.opt_level {
            config.opt_level = OptLevel::from_str(&level.into_string())?;
        }
        let resolve = |path: PathBuf| {
            if path.is_relative() {
                base_dir.join(path)
            } else {
                path
            }
        };
        config.outputs = OutputPaths {
            unopt_ir: raw.outputs.unopt_ir.map(resolve),
            opt_ir: raw.outputs.opt_ir.map(resolve),
            object: raw.outputs.object.map(resolve),
            assembly: raw.outputs.assembly.map(resolve),
        };
        config.image_data = raw.image_data.map(resolve);
        config.backend = match raw.backend {
            None => BackendConfig::Reference,
            Some(RawBackend::Named(name)) => match name.trim().to_ascii_lowercase().as_str() {
                "reference" => BackendConfig::Reference,
                other => {
                    return Err(Error::config(format!(
                        "unknown backend '{other}' (expected reference or external)"
                    )))
                }
            },
            Some(RawBackend::External { external }) => {
                if external.program.trim().is_empty() {
                    return Err(Error::config("external backend requires a program"));
                }
                BackendConfig::External {
                    program: external.program,
                    args: external.args,
                }
            }
        };
        Ok(config)
    }

    /// Load `path`, or the defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|err| {
            Error::config(format!("failed to read `{}`: {err}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_yaml(&text, base).map_err(|err| match err {
            Error::Config(message) => {
                Error::config(format!("`{}`: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Apply environment variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(targets) = lookup(TARGETS_ENV).filter(|value| !value.trim().is_empty()) {
            self.targets = targets;
        }
        if let Some(threads) = lookup(IMAGE_THREADS_ENV) {
            self.threads = Some(threads);
        }
        if let Some(policy) = lookup(COLOCATION_ENV) {
            self.colocation = ColocationPolicy::from_str(&policy)?;
        }
        if let Some(level) = lookup(OPT_LEVEL_ENV) {
            self.opt_level = OptLevel::from_str(&level)?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(targets) = &overrides.targets {
            self.targets.clone_from(targets);
        }
        if !overrides.emit.is_empty() {
            let dir = overrides
                .out_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            self.outputs = OutputPaths::in_dir(&dir, &overrides.emit);
        } else if let Some(dir) = &overrides.out_dir {
            let kinds: Vec<OutputKind> = self.outputs.requested().map(|(kind, _)| kind).collect();
            self.outputs = OutputPaths::in_dir(dir, &kinds);
        }
        if let Some(path) = &overrides.image_data {
            self.image_data = Some(path.clone());
        }
        if let Some(policy) = overrides.colocation {
            self.colocation = policy;
        }
        if let Some(level) = overrides.opt_level {
            self.opt_level = level;
        }
    }

    /// File, then process environment, then `overrides`.
    pub fn resolve(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|name| env::var(name).ok())?;
        config.apply_overrides(overrides);
        tracing::debug!(
            target: "image",
            stage = "config",
            targets = %config.targets,
            colocation = %config.colocation,
            opt_level = %config.opt_level,
            "resolved image configuration"
        );
        Ok(config)
    }

    pub fn target_list(&self) -> Result<TargetList> {
        TargetList::parse(&self.targets)
    }

    #[must_use]
    pub fn backend(&self) -> Box<dyn CodegenBackend> {
        self.backend.instantiate(self.opt_level)
    }

    /// Builder options; reads the image payload from disk.
    pub fn image_options(&self, cli_hint: Option<usize>) -> Result<ImageOptions> {
        let image_data = match &self.image_data {
            Some(path) => fs::read(path).map_err(|err| {
                Error::config(format!("failed to read image data `{}`: {err}", path.display()))
            })?,
            None => Vec::new(),
        };
        Ok(ImageOptions {
            outputs: self.outputs.clone(),
            image_data,
            colocation: self.colocation,
            opt_level: self.opt_level,
            threads: ThreadSettings::from_env(self.threads.clone(), cli_hint),
            host: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fields_parse_and_paths_resolve_against_the_file() {
        let config = ImageConfig::from_yaml(
            r"
targets: generic;haswell,+avx2,clone_all
threads: 4
colocation: data-only
opt_level: 3
outputs:
  object: out/image.a
  assembly: /abs/image_asm.a
image_data: payload.bin
backend:
  external:
    program: llc
    args: [-mtriple=x86_64]
",
            Path::new("proj"),
        )
        .expect("config");
        assert_eq!(config.targets, "generic;haswell,+avx2,clone_all");
        assert_eq!(config.threads.as_deref(), Some("4"));
        assert_eq!(config.colocation, ColocationPolicy::DataOnly);
        assert_eq!(config.opt_level, OptLevel::O3);
        assert_eq!(config.outputs.object, Some(PathBuf::from("proj/out/image.a")));
        assert_eq!(config.outputs.assembly, Some(PathBuf::from("/abs/image_asm.a")));
        assert_eq!(config.image_data, Some(PathBuf::from("proj/payload.bin")));
        assert_eq!(
            config.backend,
            BackendConfig::External {
                program: "llc".into(),
                args: vec!["-mtriple=x86_64".into()],
            }
        );
    }

    #[test]
    fn unknown_enum_values_are_configuration_errors() {
        for text in [
            "colocation: everything",
            "opt_level: 7",
            "backend: gcc",
            "mystery: 1",
        ] {
            let err = ImageConfig::from_yaml(text, Path::new("")).expect_err(text);
            assert!(matches!(err, Error::Config(_)), "{text}: {err:?}");
        }
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let mut config =
            ImageConfig::from_yaml("targets: generic\nthreads: 2\nopt_level: 1", Path::new(""))
                .expect("config");
        let env: HashMap<&str, &str> =
            HashMap::from([(TARGETS_ENV, "generic;haswell"), (IMAGE_THREADS_ENV, "8")]);
        config
            .apply_env(|name| env.get(name).map(ToString::to_string))
            .expect("env");
        assert_eq!(config.targets, "generic;haswell");
        assert_eq!(config.threads.as_deref(), Some("8"));

        config.apply_overrides(&ConfigOverrides {
            targets: Some("generic;skylake".into()),
            emit: vec![OutputKind::Object],
            out_dir: Some(PathBuf::from("build")),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.targets, "generic;skylake");
        assert_eq!(config.opt_level, OptLevel::O1);
        assert_eq!(
            config.outputs.get(OutputKind::Object),
            Some(Path::new("build/image_obj.a"))
        );
        assert!(!config.outputs.wants(OutputKind::Assembly));
    }

    #[test]
    fn out_dir_alone_moves_file_outputs() {
        let mut config =
            ImageConfig::from_yaml("outputs:\n  opt_ir: a/ir.a", Path::new("")).expect("config");
        config.apply_overrides(&ConfigOverrides {
            out_dir: Some(PathBuf::from("elsewhere")),
            ..ConfigOverrides::default()
        });
        assert_eq!(
            config.outputs.get(OutputKind::OptIr),
            Some(Path::new("elsewhere/image_opt_ir.a"))
        );
    }

    #[test]
    fn missing_payload_is_reported() {
        let config = ImageConfig {
            image_data: Some(PathBuf::from("/nonexistent/imgshard/payload")),
            ..ImageConfig::default()
        };
        let err = config.image_options(None).expect_err("missing file");
        assert!(err.to_string().contains("image data"));
    }
}

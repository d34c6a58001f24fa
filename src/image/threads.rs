//! How many shards to build in parallel.

use std::env;
use std::fs;

/// Modules lighter than this are not worth splitting.
pub const MIN_PARALLEL_WEIGHT: u64 = 1000;
/// Estimated bytes of compiler memory per unit of weight in one shard.
pub const BYTES_PER_WEIGHT: u64 = 10;
/// Exported globals a shard should own before another thread pays off.
pub const GLOBALS_PER_THREAD: usize = 100;

pub const IMAGE_THREADS_ENV: &str = "IMGSHARD_IMAGE_THREADS";
pub const NUM_THREADS_ENV: &str = "IMGSHARD_NUM_THREADS";

/// Operator-provided thread controls, highest precedence first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadSettings {
    /// Explicit override, as written by the operator.
    pub explicit: Option<String>,
    /// `--threads` on the command line.
    pub cli_hint: Option<usize>,
    /// Generic parallelism hint from the environment.
    pub env_hint: Option<String>,
}

impl ThreadSettings {
    /// Read both environment controls. The environment override replaces a
    /// `threads` value taken from the config file.
    #[must_use]
    pub fn from_env(explicit: Option<String>, cli_hint: Option<usize>) -> Self {
        Self {
            explicit: env::var(IMAGE_THREADS_ENV).ok().or(explicit),
            cli_hint,
            env_hint: env::var(NUM_THREADS_ENV).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub hardware_threads: usize,
    /// Bytes of available memory, when known.
    pub available_memory: Option<u64>,
}

impl HostResources {
    #[must_use]
    pub fn detect() -> Self {
        let hardware_threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let available_memory = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo(&text));
        Self {
            hardware_threads,
            available_memory,
        }
    }
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
#[must_use]
pub fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") | None => value.checked_mul(1024),
            Some(_) => None,
        }
    })
}

fn positive(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|count| *count > 0)
}

/// Pick the shard count for a module of `weight` with `globals` exported
/// definitions.
#[must_use]
pub fn compute_image_thread_count(
    weight: u64,
    globals: usize,
    host: HostResources,
    settings: &ThreadSettings,
) -> usize {
    let mut threads = if weight < MIN_PARALLEL_WEIGHT {
        tracing::debug!(target: "image", stage = "threads", weight, "module too small to split");
        1
    } else {
        heuristic_threads(weight, globals, host)
    };

    let mut explicit = false;
    if let Some(value) = settings.explicit.as_deref() {
        match positive(value) {
            Some(count) => {
                threads = count;
                explicit = true;
            }
            None => tracing::warn!(
                target: "image",
                stage = "threads",
                value,
                kept = threads,
                "invalid {IMAGE_THREADS_ENV} value; keeping computed thread count"
            ),
        }
    }

    if !explicit && threads > 1 {
        if let Some(hint) = settings.cli_hint.filter(|hint| *hint > 0) {
            lower(&mut threads, hint, "cli hint");
        } else if let Some(value) = settings.env_hint.as_deref() {
            match positive(value) {
                Some(hint) => lower(&mut threads, hint, NUM_THREADS_ENV),
                None => tracing::warn!(
                    target: "image",
                    stage = "threads",
                    value,
                    "ignoring invalid {NUM_THREADS_ENV} value"
                ),
            }
        }
    }
    threads.max(1)
}

fn heuristic_threads(weight: u64, globals: usize, host: HostResources) -> usize {
    let mut threads = (host.hardware_threads / 2).max(1);
    if let Some(memory) = host.available_memory {
        let budget = memory / weight.saturating_mul(BYTES_PER_WEIGHT).max(1);
        let budget = usize::try_from(budget).unwrap_or(usize::MAX).max(1);
        lower(&mut threads, budget, "available memory");
    }
    lower(&mut threads, (globals / GLOBALS_PER_THREAD).max(1), "exported globals");
    threads
}

fn lower(threads: &mut usize, limit: usize, reason: &str) {
    if limit < *threads {
        tracing::info!(
            target: "image",
            stage = "threads",
            from = *threads,
            to = limit,
            reason,
            "reduced image thread count"
        );
        *threads = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    const HOST: HostResources = HostResources {
        hardware_threads: 16,
        available_memory: None,
    };

    fn settings(explicit: Option<&str>, cli: Option<usize>, env: Option<&str>) -> ThreadSettings {
        ThreadSettings {
            explicit: explicit.map(str::to_string),
            cli_hint: cli,
            env_hint: env.map(str::to_string),
        }
    }

    #[test]
    fn light_modules_use_one_thread() {
        assert_eq!(compute_image_thread_count(999, 10_000, HOST, &settings(None, None, None)), 1);
    }

    #[test]
    fn heuristic_clamps_by_memory_and_globals() {
        assert_eq!(compute_image_thread_count(5000, 10_000, HOST, &settings(None, None, None)), 8);
        assert_eq!(compute_image_thread_count(5000, 350, HOST, &settings(None, None, None)), 3);
        let tight = HostResources {
            hardware_threads: 16,
            available_memory: Some(100_000),
        };
        assert_eq!(compute_image_thread_count(5000, 10_000, tight, &settings(None, None, None)), 2);
    }

    #[test]
    fn zero_override_is_rejected_and_heuristic_kept() {
        let count = compute_image_thread_count(5000, 10_000, HOST, &settings(Some("0"), None, None));
        assert_eq!(count, 8);
        let count = compute_image_thread_count(5000, 10_000, HOST, &settings(Some("many"), None, None));
        assert_eq!(count, 8);
    }

    #[test]
    fn explicit_override_wins_and_lifts_the_small_module_bailout() {
        let count = compute_image_thread_count(10, 1, HOST, &settings(Some("6"), Some(2), Some("1")));
        assert_eq!(count, 6);
    }

    #[test]
    fn hints_only_lower_the_count() {
        assert_eq!(compute_image_thread_count(5000, 10_000, HOST, &settings(None, Some(3), Some("2"))), 3);
        assert_eq!(compute_image_thread_count(5000, 10_000, HOST, &settings(None, Some(32), None)), 8);
        assert_eq!(compute_image_thread_count(5000, 10_000, HOST, &settings(None, None, Some("4"))), 4);
        assert_eq!(compute_image_thread_count(5000, 10_000, HOST, &settings(None, None, Some("x"))), 8);
    }

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn environment_override_replaces_the_file_value() {
        let _guard = ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        env::set_var(IMAGE_THREADS_ENV, "5");
        env::set_var(NUM_THREADS_ENV, "2");
        let from_env = ThreadSettings::from_env(Some("3".into()), Some(4));
        env::remove_var(IMAGE_THREADS_ENV);
        env::remove_var(NUM_THREADS_ENV);
        assert_eq!(from_env, settings(Some("5"), Some(4), Some("2")));

        let from_file = ThreadSettings::from_env(Some("3".into()), None);
        assert_eq!(from_file, settings(Some("3"), None, None));
    }

    #[test]
    fn meminfo_reports_bytes() {
        let text = "MemTotal:  100 kB\nMemAvailable:   2048 kB\n";
        assert_eq!(parse_meminfo(text), Some(2048 * 1024));
        assert_eq!(parse_meminfo("MemFree: 1 kB"), None);
    }
}

//! Scoped shard workers.
//!
//! Each worker runs on its own named thread, buffers its diagnostics and
//! reports through a channel. Nothing is surfaced until every worker has
//! finished; diagnostics are then flushed in shard order and the first
//! failure (by shard index) is returned.

use std::any::Any;
use std::sync::mpsc;
use std::thread;

use crate::error::{Error, Result};

const SHARD_WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warn,
}

/// Messages a worker wants logged once the join barrier has passed.
#[derive(Debug, Default)]
pub struct Diagnostics {
    shard: usize,
    entries: Vec<(DiagnosticLevel, String)>,
}

impl Diagnostics {
    #[must_use]
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            entries: Vec::new(),
        }
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.entries.push((DiagnosticLevel::Debug, message.into()));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.entries.push((DiagnosticLevel::Info, message.into()));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.entries.push((DiagnosticLevel::Warn, message.into()));
    }

    #[must_use]
    pub fn entries(&self) -> &[(DiagnosticLevel, String)] {
        &self.entries
    }

    fn flush(&self) {
        for (level, message) in &self.entries {
            match level {
                DiagnosticLevel::Debug => {
                    tracing::debug!(target: "image", stage = "worker", shard = self.shard, "{message}");
                }
                DiagnosticLevel::Info => {
                    tracing::info!(target: "image", stage = "worker", shard = self.shard, "{message}");
                }
                DiagnosticLevel::Warn => {
                    tracing::warn!(target: "image", stage = "worker", shard = self.shard, "{message}");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `job` once per shard index in `0..count`, each on its own thread.
///
/// # Errors
///
/// Returns the lowest-indexed worker error, or an invariant violation when a
/// worker panicked or could not be spawned.
pub fn run_shards<T, F>(count: usize, job: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize, &mut Diagnostics) -> Result<T> + Sync,
{
    let mut slots: Vec<Option<(Result<T>, Diagnostics)>> =
        std::iter::repeat_with(|| None).take(count).collect();
    let mut spawn_failures = Vec::new();
    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(count);
        for shard in 0..count {
            let tx = tx.clone();
            let job = &job;
            let spawned = thread::Builder::new()
                .name(format!("imgshard-shard-{shard}"))
                .stack_size(SHARD_WORKER_STACK_SIZE)
                .spawn_scoped(scope, move || {
                    let mut diagnostics = Diagnostics::new(shard);
                    let result = job(shard, &mut diagnostics);
                    let _ = tx.send((shard, result, diagnostics));
                });
            match spawned {
                Ok(handle) => handles.push((shard, handle)),
                Err(err) => spawn_failures.push((shard, err.to_string())),
            }
        }
        drop(tx);
        for (shard, handle) in handles {
            if let Err(payload) = handle.join() {
                let message = panic_message(payload.as_ref());
                slots[shard] = Some((
                    Err(Error::invariant(format!("shard worker {shard} panicked: {message}"))),
                    Diagnostics::new(shard),
                ));
            }
        }
        for (shard, result, diagnostics) in rx {
            slots[shard] = Some((result, diagnostics));
        }
    });

    for (shard, message) in spawn_failures {
        slots[shard] = Some((
            Err(Error::invariant(format!(
                "failed to spawn shard worker {shard}: {message}"
            ))),
            Diagnostics::new(shard),
        ));
    }

    let mut results = Vec::with_capacity(count);
    let mut first_error = None;
    for (shard, slot) in slots.into_iter().enumerate() {
        let Some((result, diagnostics)) = slot else {
            first_error.get_or_insert_with(|| {
                Error::invariant(format!("shard worker {shard} reported nothing"))
            });
            continue;
        };
        diagnostics.flush();
        match result {
            Ok(value) => results.push(value),
            Err(err) => {
                tracing::error!(target: "image", stage = "worker", shard, error = %err, "shard failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

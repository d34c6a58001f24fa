#![deny(clippy::all, clippy::perf, clippy::suspicious)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

//! Parallel sharded native image builder.
//!
//! A module is annotated for CPU-feature multiversioning, split into
//! balanced shards that compile independently, and described to the loader
//! by a separate data module. [`loader`] reads such an image back.

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod image;
pub mod ir;
pub mod loader;
pub mod logging;
pub mod multiversion;
pub mod partition;
pub mod target;

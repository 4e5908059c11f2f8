//! btcmon: recorder for the operational state of a Bitcoin Core node.
//!
//! Provides:
//! - `collector` - sources (RPC, kernel tracepoints, OS counters, debug log)
//! - `scheduler` - per-source tick loops with failure isolation
//! - `storage` - day-partitioned, append-only record store
//! - `runtime` - run state assembled once from configuration
//! - `config` - immutable configuration handed over by the binary
//! - `fmt` - formatting helpers for log lines

pub mod collector;
pub mod config;
pub mod error;
pub mod fmt;
pub mod runtime;
pub mod scheduler;
pub mod storage;

pub use error::StartupError;

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

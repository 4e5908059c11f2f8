//! Mock implementations for testing.
//!
//! This module provides `MockRunner` (scripted OS command output),
//! `ScriptedSource` (an in-memory source with a fixed sequence of
//! outcomes) and pre-built scenarios, so counter readers and the
//! scheduler can be exercised without `systemctl`, `iptables` or a node.

mod runner;
mod scenarios;
mod source;

pub use runner::{MockResponse, MockRunner};
pub use source::{ScriptedSource, Step};

//! Per-host self-healing daemon cooperating with a local Consul agent.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use tracing_subscriber as _;

/// Check runner.
pub mod check;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Consul agent client.
pub mod consul;

/// Daemon runtime and per-tick control flow.
pub mod daemon;

/// Hysteresis and cluster-safety decisions.
pub mod decision;

/// Errors.
pub mod error;

/// Heal orchestrator.
pub mod heal;

/// Retry ledger.
pub mod ledger;

/// Status report writer.
pub mod report;

/// Check and heal timers.
pub mod scheduler;

/// Verdicts, Consul statuses, and the child environment encoding.
pub mod status;

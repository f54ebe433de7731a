//! Check verdicts, the Consul status vocabulary, and the environment
//! encoding exported to child processes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::constants::{
    ENV_PREFIX, ENV_SNAPSHOT_PREFIX, ENV_STATUS_PREFIX, EXIT_BAD, EXIT_BAD_HEAL_NOW,
    EXIT_OK, EXIT_OK_HEAL_NOW, EXIT_OOR, EXIT_WARN, EXIT_WARN_HEAL_NOW,
};

/// The daemon's interpretation of a check exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// The check passed.
    Ok,
    /// The check found a degraded state, or returned an unknown code.
    Warn,
    /// The check failed.
    Bad,
    /// The host is out of rotation by external decision.
    Oor,
}

impl Verdict {
    /// The Consul health state this verdict maps to on the wire.
    pub fn consul_status(self) -> ConsulStatus {
        match self {
            Verdict::Ok => ConsulStatus::Passing,
            Verdict::Warn => ConsulStatus::Warning,
            Verdict::Bad | Verdict::Oor => ConsulStatus::Critical,
        }
    }
}

/// A check outcome as reported by the script: the base verdict plus the
/// fast-heal request carried by the `*_HEAL_NOW` exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawVerdict {
    /// The base verdict after decomposition.
    pub verdict: Verdict,
    /// Whether the script requested an immediate heal run.
    pub fast_heal: bool,
}

impl RawVerdict {
    /// Maps a raw exit code onto the verdict table. Codes outside the table
    /// are treated as UNKNOWN, which shares its value with WARN.
    pub fn from_exit_code(code: i32) -> Self {
        let (verdict, fast_heal) = match code {
            EXIT_OK => (Verdict::Ok, false),
            EXIT_WARN => (Verdict::Warn, false),
            EXIT_BAD => (Verdict::Bad, false),
            EXIT_OOR => (Verdict::Oor, false),
            EXIT_OK_HEAL_NOW => (Verdict::Ok, true),
            EXIT_WARN_HEAL_NOW => (Verdict::Warn, true),
            EXIT_BAD_HEAL_NOW => (Verdict::Bad, true),
            _ => (Verdict::Warn, false),
        };
        Self { verdict, fast_heal }
    }
}

/// Health states a Consul check can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ConsulStatus {
    /// The check is healthy.
    Passing,
    /// The check is degraded.
    Warning,
    /// The check is failing, or its TTL expired.
    Critical,
}

impl ConsulStatus {
    /// The keyword used in the agent's TTL update endpoint for this state.
    pub fn push_keyword(self) -> &'static str {
        match self {
            ConsulStatus::Passing => "pass",
            ConsulStatus::Warning => "warn",
            ConsulStatus::Critical => "fail",
        }
    }
}

/// Builds the environment key carrying a service's cluster status. The
/// on-the-wire service id is uppercased verbatim.
pub fn service_status_key(wire_id: &str) -> String {
    format!("{ENV_STATUS_PREFIX}{}", wire_id.to_uppercase())
}

/// Encodes one service's cluster status into the canonical string exported
/// to child processes. Percentages are integer-rounded; `any_pct` is 100
/// whenever any members are known at all.
pub fn service_status_value(
    status: ConsulStatus,
    since: f64,
    passing: usize,
    warning: usize,
    critical: usize,
) -> String {
    let any = passing + warning + critical;
    let pct = |count: usize| -> u32 {
        if any == 0 {
            0
        } else {
            ((count as f64 / any as f64) * 100.0).round() as u32
        }
    };
    let any_pct = if any > 0 { 100 } else { 0 };

    format!(
        "status={status},since={since},passing={passing},passing_pct={},\
         warning={warning},warning_pct={},critical={critical},critical_pct={},\
         any={any},any_pct={any_pct}",
        pct(passing),
        pct(warning),
        pct(critical),
    )
}

/// Rewrites a captured `APOLLO_*` environment into its `APOLLO_SNAPSHOT_*`
/// form. Keys outside the apollo namespace are dropped.
pub fn snapshot_environment(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX).map(|suffix| {
                (format!("{ENV_SNAPSHOT_PREFIX}{suffix}"), value.clone())
            })
        })
        .collect()
}

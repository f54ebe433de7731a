//! Plain-text status report written after every heal cycle.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::consul::ConsulClient;
use crate::error::ApolloError;
use crate::status::ConsulStatus;

/// Human-facing label for a check state.
fn report_label(status: ConsulStatus) -> &'static str {
    match status {
        ConsulStatus::Passing => "OK",
        ConsulStatus::Warning => "WARNING",
        ConsulStatus::Critical => "BAD",
    }
}

/// Renders the report body from the agent's check dump.
fn render(checks: &BTreeMap<String, ConsulStatus>, generated: DateTime<Utc>) -> String {
    let mut body = String::new();
    body.push_str("apollo check report\n");
    body.push_str(&format!(
        "generated {}\n",
        generated.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    body.push_str("========================================\n");

    if checks.is_empty() {
        body.push_str("no checks registered\n");
        return body;
    }

    let width = checks.keys().map(|id| id.len()).max().unwrap_or(0).max(20);
    for (check_id, status) in checks {
        body.push_str(&format!(
            "{check_id:<width$}  {}\n",
            report_label(*status)
        ));
    }
    body
}

/// Fetches all agent checks and atomically replaces the report file.
pub fn write_report(consul: &ConsulClient, path: &Path) -> Result<(), ApolloError> {
    let checks = consul.agent_checks()?;
    let body = render(&checks, Utc::now());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    debug!("Report written to {path:?} ({} checks)", checks.len());
    Ok(())
}

/// Writes the report and logs instead of failing; the report is advisory
/// and must never take a heal cycle down with it.
pub fn write_report_logged(consul: &ConsulClient, path: &Path) {
    if let Err(err) = write_report(consul, path) {
        error!("Report write to {path:?} failed: {err}");
    }
}

//! Narrow HTTP client for the local Consul agent.
//!
//! Apollo only touches five agent endpoints: service registration, the TTL
//! check update family, this node's check list, a service's member health,
//! and the agent-wide check dump used by the report writer.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::constants::{
    CONSUL_HTTP_TIMEOUT, NODE_READ_ATTEMPTS, NODE_READ_PAUSE, NOTE_BY_APOLLO,
    NOTE_LAST_CHANGE_PREFIX, NOTE_TTL_EXPIRED, REPORT_READ_ATTEMPTS, REPORT_READ_PAUSE,
    TTL_EXPIRED_SINCE,
};
use crate::error::ApolloError;
use crate::status::ConsulStatus;

/// A check attached to this node, as apollo reads it back from the agent.
#[derive(Debug, Clone)]
pub struct NodeCheck {
    /// The check id, e.g. `service:www`.
    pub check_id: String,
    /// The service the check belongs to.
    pub service_id: String,
    /// Current health state.
    pub status: ConsulStatus,
    /// Whether apollo authored the last transition.
    pub by_apollo: bool,
    /// Transition timestamp parsed from the note; -1 when the TTL expired
    /// or no marker is present.
    pub since: f64,
}

/// Cluster-wide member breakdown for one service. Hostname lists are kept
/// sorted so the first-N-bad tiebreak is deterministic across hosts.
#[derive(Debug, Clone, Default)]
pub struct ServiceHealth {
    /// Members whose service check passes.
    pub passing: Vec<String>,
    /// Members whose service check warns.
    pub warning: Vec<String>,
    /// Members failing the service check or serfHealth.
    pub critical: Vec<String>,
}

impl ServiceHealth {
    /// Number of passing members.
    pub fn passing_total(&self) -> usize {
        self.passing.len()
    }

    /// Number of warning members.
    pub fn warning_total(&self) -> usize {
        self.warning.len()
    }

    /// Number of critical members.
    pub fn critical_total(&self) -> usize {
        self.critical.len()
    }

    /// Number of known members in any state.
    pub fn any_total(&self) -> usize {
        self.passing.len() + self.warning.len() + self.critical.len()
    }
}

/// Composes the note attached to every TTL update. The `by:apollo` marker
/// is present exactly when apollo authored the current transition.
pub fn format_note(by_apollo: bool, since: f64) -> String {
    if by_apollo {
        format!("{NOTE_BY_APOLLO} {NOTE_LAST_CHANGE_PREFIX}{since}")
    } else {
        format!("{NOTE_LAST_CHANGE_PREFIX}{since}")
    }
}

/// Extracts the apollo markers from a check's `Output` field.
pub fn parse_output(output: &str) -> (bool, f64) {
    let by_apollo = output.contains(NOTE_BY_APOLLO);
    if output.contains(NOTE_TTL_EXPIRED) {
        return (by_apollo, TTL_EXPIRED_SINCE);
    }

    let since = output
        .split_once(NOTE_LAST_CHANGE_PREFIX)
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .and_then(|token| f64::from_str(token).ok())
        .unwrap_or(TTL_EXPIRED_SINCE);

    (by_apollo, since)
}

#[derive(Debug, Serialize)]
struct RegisterPayload {
    service: ServicePayload,
}

#[derive(Debug, Serialize)]
struct ServicePayload {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    check: CheckPayload,
}

#[derive(Debug, Serialize)]
struct CheckPayload {
    id: String,
    script: String,
    real_ttl: u64,
    ttl: String,
}

#[derive(Debug, Deserialize)]
struct RawCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Output", default)]
    output: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    #[serde(rename = "Node")]
    node: RawNode,
    #[serde(rename = "Checks", default)]
    checks: Vec<RawCheck>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(rename = "Node")]
    node: String,
}

#[derive(Debug, Deserialize)]
struct AgentCheck {
    #[serde(rename = "Status")]
    status: String,
}

/// Blocking client against one Consul agent endpoint.
pub struct ConsulClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl ConsulClient {
    /// Builds a client for the given agent endpoint, e.g.
    /// `http://127.0.0.1:8500`.
    pub fn new(endpoint: &str) -> Result<Self, ApolloError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(CONSUL_HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Registers a service with a TTL check of `frequency + penalty`
    /// seconds. Used for the main service and each sub-service.
    pub fn register_service(
        &self,
        wire_id: &str,
        script: &str,
        frequency: u64,
        penalty: u64,
        port: Option<u16>,
        tags: &[String],
    ) -> Result<(), ApolloError> {
        let payload = RegisterPayload {
            service: ServicePayload {
                name: wire_id.to_string(),
                port,
                tags: tags.to_vec(),
                check: CheckPayload {
                    id: wire_id.to_string(),
                    script: script.to_string(),
                    real_ttl: frequency,
                    ttl: format!("{}s", frequency + penalty),
                },
            },
        };

        let path = "/v1/agent/service/register";
        let response = self
            .client
            .put(format!("{}{path}", self.endpoint))
            .json(&payload)
            .send()?;
        self.ensure_success(path, &response)?;
        debug!("Registered service '{wire_id}' with ttl {}s", frequency + penalty);
        Ok(())
    }

    /// Pushes a TTL update for a service check, carrying the note verbatim.
    pub fn push(
        &self,
        wire_id: &str,
        status: ConsulStatus,
        note: &str,
    ) -> Result<(), ApolloError> {
        let path = format!(
            "/v1/agent/check/{}/service:{wire_id}",
            status.push_keyword()
        );
        let response = self
            .client
            .put(format!("{}{path}", self.endpoint))
            .query(&[("note", note)])
            .send()?;
        self.ensure_success(&path, &response)
    }

    /// All checks registered on this node.
    pub fn node_checks(&self, hostname: &str) -> Result<Vec<NodeCheck>, ApolloError> {
        let path = format!("/v1/health/node/{hostname}");
        let raw: Vec<RawCheck> =
            self.get_json(&path, NODE_READ_ATTEMPTS, NODE_READ_PAUSE)?;

        Ok(raw
            .into_iter()
            .map(|check| {
                let (by_apollo, since) = parse_output(&check.output);
                NodeCheck {
                    status: parse_status(&check.status),
                    by_apollo,
                    since,
                    check_id: check.check_id,
                    service_id: check.service_id,
                }
            })
            .collect())
    }

    /// The check of one service on this node, when registered.
    pub fn node_check(
        &self,
        hostname: &str,
        wire_id: &str,
    ) -> Result<Option<NodeCheck>, ApolloError> {
        let checks = self.node_checks(hostname)?;
        Ok(checks.into_iter().find(|check| check.service_id == wire_id))
    }

    /// Member health of a service across the cluster.
    pub fn service_health(&self, service: &str) -> Result<ServiceHealth, ApolloError> {
        let path = format!("/v1/health/service/{service}");
        let entries: Vec<ServiceEntry> =
            self.get_json(&path, NODE_READ_ATTEMPTS, NODE_READ_PAUSE)?;
        Ok(classify_members(entries))
    }

    /// All checks known to the agent, for the report writer. This read is
    /// allowed a long retry budget because the report is not on the
    /// decision path.
    pub fn agent_checks(&self) -> Result<BTreeMap<String, ConsulStatus>, ApolloError> {
        let raw: BTreeMap<String, AgentCheck> =
            self.get_json("/v1/agent/checks", REPORT_READ_ATTEMPTS, REPORT_READ_PAUSE)?;
        Ok(raw
            .into_iter()
            .map(|(id, check)| (id, parse_status(&check.status)))
            .collect())
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        attempts: usize,
        pause: Duration,
    ) -> Result<T, ApolloError> {
        let url = format!("{}{path}", self.endpoint);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.try_get_json(path, &url) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!("GET {path} attempt {attempt}/{attempts} failed: {err}");
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(pause);
                    }
                }
            }
        }

        let err = last_err.expect("at least one attempt was made");
        error!("GET {path} failed after {attempts} attempts: {err}");
        Err(err)
    }

    fn try_get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        url: &str,
    ) -> Result<T, ApolloError> {
        let response = self.client.get(url).send()?;
        self.ensure_success(path, &response)?;
        Ok(response.json()?)
    }

    fn ensure_success(
        &self,
        path: &str,
        response: &reqwest::blocking::Response,
    ) -> Result<(), ApolloError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApolloError::ConsulStatusError {
                path: path.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

/// Consul statuses outside the known vocabulary default to passing, per
/// the member classification rules.
fn parse_status(status: &str) -> ConsulStatus {
    ConsulStatus::from_str(status).unwrap_or(ConsulStatus::Passing)
}

/// Buckets service members by effective status. A member counts as
/// critical when either its service check or its serfHealth check is
/// critical; otherwise the service check's status wins, and an absent
/// status reads as passing.
fn classify_members(entries: Vec<ServiceEntry>) -> ServiceHealth {
    let mut health = ServiceHealth::default();

    for entry in entries {
        let serf_critical = entry.checks.iter().any(|check| {
            check.check_id == "serfHealth"
                && parse_status(&check.status) == ConsulStatus::Critical
        });
        let service_status = entry
            .checks
            .iter()
            .find(|check| !check.service_id.is_empty())
            .map(|check| parse_status(&check.status))
            .unwrap_or(ConsulStatus::Passing);

        let effective = if serf_critical {
            ConsulStatus::Critical
        } else {
            service_status
        };

        match effective {
            ConsulStatus::Passing => health.passing.push(entry.node.node),
            ConsulStatus::Warning => health.warning.push(entry.node.node),
            ConsulStatus::Critical => health.critical.push(entry.node.node),
        }
    }

    health.passing.sort();
    health.warning.sort();
    health.critical.sort();
    health
}

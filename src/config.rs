//! Config loading and validation for the apollo daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CHECK_FREQUENCY, DEFAULT_CHECK_RETRIES, DEFAULT_CONSUL_ENDPOINT,
    DEFAULT_HEAL_FREQUENCY, DEFAULT_PENALTY, DEFAULT_PID_FILE, DEFAULT_REPORT_FILE,
    DEFAULT_TRACK_DIRECTORY, HEAL_ACTIVE_FILE_NAME, LAST_HEAL_FILE_NAME,
};
use crate::error::ApolloError;
use crate::status::ConsulStatus;

/// On-disk shape of the configuration file. Unknown keys are rejected so
/// that typos surface at startup instead of silently becoming attributes.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    service_name: Option<String>,
    service_cmd: Option<String>,
    service_frequency: Option<u64>,
    extra_service: Option<BTreeMap<String, ExtraService>>,
    heal_cmd: Option<String>,
    heal_frequency: Option<u64>,
    heal_dryrun: Option<bool>,
    heal_on_status: Option<String>,
    keep_critical_secs: Option<u64>,
    keep_warning_secs: Option<u64>,
    threshold_down: Option<String>,
    allow_full_outage: Option<bool>,
    port: Option<u16>,
    hostname: Option<String>,
    colo: Option<String>,
    tags_list: Option<Vec<String>>,
    consul_endpoint: Option<String>,
    penalty: Option<u64>,
    track_directory: Option<String>,
    report_file: Option<String>,
    pid_file: Option<String>,
}

/// Configuration for one sub-service health dimension.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraService {
    /// The health-check command for this sub-service.
    pub healthcheck: String,
    /// Check interval in seconds.
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    /// Consecutive failures required before the check goes critical.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_frequency() -> u64 {
    DEFAULT_CHECK_FREQUENCY
}

fn default_retries() -> u32 {
    DEFAULT_CHECK_RETRIES
}

/// The failure budget: how many cluster members may be failing at once with
/// apollo's consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// A fixed member count.
    Count(u64),
    /// A percentage of the known members.
    Percent(u64),
}

impl Threshold {
    /// Resolves the budget against the current number of known members.
    /// Percentages floor, so a budget never rounds up into extra failures.
    pub fn resolve(&self, any_total: usize) -> usize {
        match self {
            Threshold::Count(n) => *n as usize,
            Threshold::Percent(p) => (any_total as u64 * p / 100) as usize,
        }
    }
}

impl FromStr for Threshold {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some(percent) = trimmed.strip_suffix('%') {
            let p: u64 = percent
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage '{trimmed}'"))?;
            if p > 100 {
                return Err(format!("percentage '{trimmed}' exceeds 100"));
            }
            Ok(Threshold::Percent(p))
        } else {
            trimmed
                .parse()
                .map(Threshold::Count)
                .map_err(|_| format!("invalid member count '{trimmed}'"))
        }
    }
}

/// Which main-service status allows the scheduled heal loop to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOnStatus {
    /// Heal regardless of the current status.
    Any,
    /// Heal only when the main service is in this state.
    Only(ConsulStatus),
}

impl FromStr for HealOnStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("any") {
            return Ok(HealOnStatus::Any);
        }
        ConsulStatus::from_str(value)
            .map(HealOnStatus::Only)
            .map_err(|_| format!("expected any, passing, warning or critical, got '{value}'"))
    }
}

/// Validated, immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the main service this host participates in.
    pub service_name: String,
    /// Health-check command for the main service, if any.
    pub service_cmd: Option<String>,
    /// Main check interval in seconds.
    pub service_frequency: u64,
    /// Sub-service checks, keyed by their human name.
    pub extra_service: BTreeMap<String, ExtraService>,
    /// Repair command invoked by the heal loop.
    pub heal_cmd: Option<String>,
    /// Heal loop interval in seconds.
    pub heal_frequency: u64,
    /// When set, the heal loop only logs what it would do.
    pub heal_dryrun: bool,
    /// Status gate for scheduled heal runs.
    pub heal_on_status: HealOnStatus,
    /// Minimum dwell time in critical before a recovery is allowed.
    pub keep_critical_secs: u64,
    /// Minimum dwell time in warning before a recovery is allowed.
    pub keep_warning_secs: u64,
    /// The cluster failure budget, if configured.
    pub threshold_down: Option<Threshold>,
    /// Permit going critical even when no member is passing.
    pub allow_full_outage: bool,
    /// Port the main service is registered with.
    pub port: Option<u16>,
    /// This host's name as known to Consul.
    pub hostname: String,
    /// Datacenter the host lives in.
    pub colo: String,
    /// Tags attached to the main service registration.
    pub tags_list: Vec<String>,
    /// HTTP endpoint of the local Consul agent.
    pub consul_endpoint: String,
    /// Seconds added to a check frequency to form its Consul TTL.
    pub penalty: u64,
    /// Directory holding the per-check retry ledgers.
    pub track_directory: PathBuf,
    /// Location of the plain-text status report.
    pub report_file: PathBuf,
    /// PID file guarding against duplicate instances.
    pub pid_file: PathBuf,
}

/// A scheduled health check, main or sub-service.
#[derive(Debug, Clone)]
pub struct CheckSpec {
    /// Internal name: the sub-service name, or the service name for main.
    pub id: String,
    /// Consul service id: `<sub>-<main>` for subs, the service name for main.
    pub wire_id: String,
    /// The check command, split on whitespace at execution time.
    pub script: String,
    /// Interval between check runs.
    pub frequency: Duration,
    /// Consecutive failures required before the check goes critical.
    pub retries: u32,
    /// Random startup offset applied before every tick body.
    pub start_jitter: Duration,
}

impl Config {
    /// Whether a check spec drives the main service.
    pub fn is_main_check(&self, spec: &CheckSpec) -> bool {
        spec.wire_id == self.service_name
    }

    /// The on-the-wire Consul service id for a sub-service.
    pub fn wire_id(&self, sub_name: &str) -> String {
        format!("{sub_name}-{}", self.service_name)
    }

    /// All wire service ids registered by this host, main service first.
    pub fn wire_ids(&self) -> Vec<String> {
        let mut ids = vec![self.service_name.clone()];
        ids.extend(self.extra_service.keys().map(|name| self.wire_id(name)));
        ids
    }

    /// Builds the check list in scheduling order: sub-services first, then
    /// the main service when it has a command. Jitter is assigned by the
    /// scheduler.
    pub fn check_specs(&self) -> Vec<CheckSpec> {
        let mut specs: Vec<CheckSpec> = self
            .extra_service
            .iter()
            .map(|(name, extra)| CheckSpec {
                id: name.clone(),
                wire_id: self.wire_id(name),
                script: extra.healthcheck.clone(),
                frequency: Duration::from_secs(extra.frequency),
                retries: extra.retries.max(1),
                start_jitter: Duration::ZERO,
            })
            .collect();

        if let Some(cmd) = &self.service_cmd {
            specs.push(CheckSpec {
                id: self.service_name.clone(),
                wire_id: self.service_name.clone(),
                script: cmd.clone(),
                frequency: Duration::from_secs(self.service_frequency),
                retries: DEFAULT_CHECK_RETRIES,
                start_jitter: Duration::ZERO,
            });
        }

        specs
    }

    /// Directory holding the PID file and the marker files.
    pub fn run_dir(&self) -> PathBuf {
        self.pid_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Flag file signalling the main service is currently critical.
    pub fn bad_flag_file(&self) -> PathBuf {
        self.run_dir().join(format!("{}.bad", self.service_name))
    }

    /// Marker touched while a heal command is running.
    pub fn heal_active_file(&self) -> PathBuf {
        self.run_dir().join(HEAL_ACTIVE_FILE_NAME)
    }

    /// Record of the most recent heal invocation.
    pub fn last_heal_file(&self) -> PathBuf {
        self.run_dir().join(LAST_HEAL_FILE_NAME)
    }
}

/// Loads and validates the configuration file.
///
/// # Errors
///
/// * `ApolloError::ConfigReadError` if the file cannot be read.
/// * `ApolloError::ConfigParseError` if the YAML is invalid or carries
///   unknown keys.
/// * `ApolloError::MissingConfigKey` / `InvalidConfigValue` when mandatory
///   keys are absent or malformed.
pub fn load_config(path: &str) -> Result<Config, ApolloError> {
    let content =
        std::fs::read_to_string(path).map_err(ApolloError::ConfigReadError)?;
    let raw: RawConfig = serde_yaml::from_str(&content)?;
    finalize(raw)
}

fn finalize(raw: RawConfig) -> Result<Config, ApolloError> {
    let service_name = raw
        .service_name
        .filter(|name| !name.is_empty())
        .ok_or(ApolloError::MissingConfigKey("service_name"))?;
    let hostname = raw
        .hostname
        .filter(|name| !name.is_empty())
        .ok_or(ApolloError::MissingConfigKey("hostname"))?;
    let colo = raw
        .colo
        .filter(|name| !name.is_empty())
        .ok_or(ApolloError::MissingConfigKey("colo"))?;

    let heal_on_status = match raw.heal_on_status {
        Some(value) => value.parse().map_err(|reason| {
            ApolloError::InvalidConfigValue {
                key: "heal_on_status",
                reason,
            }
        })?,
        None => HealOnStatus::Any,
    };

    let threshold_down = match raw.threshold_down {
        Some(value) => Some(value.parse().map_err(|reason| {
            ApolloError::InvalidConfigValue {
                key: "threshold_down",
                reason,
            }
        })?),
        None => None,
    };

    Ok(Config {
        service_name,
        service_cmd: raw.service_cmd,
        service_frequency: raw.service_frequency.unwrap_or(DEFAULT_CHECK_FREQUENCY),
        extra_service: raw.extra_service.unwrap_or_default(),
        heal_cmd: raw.heal_cmd,
        heal_frequency: raw.heal_frequency.unwrap_or(DEFAULT_HEAL_FREQUENCY),
        heal_dryrun: raw.heal_dryrun.unwrap_or(false),
        heal_on_status,
        keep_critical_secs: raw.keep_critical_secs.unwrap_or(0),
        keep_warning_secs: raw.keep_warning_secs.unwrap_or(0),
        threshold_down,
        allow_full_outage: raw.allow_full_outage.unwrap_or(false),
        port: raw.port,
        hostname,
        colo,
        tags_list: raw.tags_list.unwrap_or_default(),
        consul_endpoint: raw
            .consul_endpoint
            .unwrap_or_else(|| DEFAULT_CONSUL_ENDPOINT.to_string()),
        penalty: raw.penalty.unwrap_or(DEFAULT_PENALTY),
        track_directory: PathBuf::from(
            raw.track_directory
                .unwrap_or_else(|| DEFAULT_TRACK_DIRECTORY.to_string()),
        ),
        report_file: PathBuf::from(
            raw.report_file
                .unwrap_or_else(|| DEFAULT_REPORT_FILE.to_string()),
        ),
        pid_file: PathBuf::from(
            raw.pid_file.unwrap_or_else(|| DEFAULT_PID_FILE.to_string()),
        ),
    })
}

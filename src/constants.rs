//! Constants and default values for the apollo daemon.
//!
//! This module centralizes the exit-code vocabulary, Consul note markers,
//! timing values, and default filesystem paths used throughout the daemon.

use std::time::Duration;

// ============================================================================
// Check and Heal Script Exit Codes
// ============================================================================

/// The check passed; the service is healthy.
pub const EXIT_OK: i32 = 0;

/// The check found a degraded but serving state.
pub const EXIT_WARN: i32 = 1;

/// The check failed; the service is unhealthy.
pub const EXIT_BAD: i32 = 2;

/// The host has been taken out of rotation by an operator or external tool.
pub const EXIT_OOR: i32 = 3;

/// Healthy, but the check requests an immediate heal run.
pub const EXIT_OK_HEAL_NOW: i32 = 100;

/// Degraded, with an immediate heal request.
pub const EXIT_WARN_HEAL_NOW: i32 = 101;

/// Failed, with an immediate heal request.
pub const EXIT_BAD_HEAL_NOW: i32 = 102;

/// Exit code a heal command returns on success.
pub const EXIT_HEALED: i32 = 0;

// ============================================================================
// Consul Note Markers
// ============================================================================

/// Marker placed in the check note when apollo authored the last transition.
pub const NOTE_BY_APOLLO: &str = "by:apollo";

/// Prefix of the transition-timestamp marker in a check note.
pub const NOTE_LAST_CHANGE_PREFIX: &str = "Last change was on ";

/// Output Consul reports for a TTL check that was never refreshed in time.
pub const NOTE_TTL_EXPIRED: &str = "TTL expired";

/// Sentinel `since` value observed for an expired TTL check.
pub const TTL_EXPIRED_SINCE: f64 = -1.0;

// ============================================================================
// Consul HTTP Client
// ============================================================================

/// Timeout applied to every request against the Consul agent.
pub const CONSUL_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts for node and service health reads.
pub const NODE_READ_ATTEMPTS: usize = 4;

/// Pause between node and service health read attempts.
pub const NODE_READ_PAUSE: Duration = Duration::from_secs(1);

/// Attempts for the report fetch of all agent checks.
pub const REPORT_READ_ATTEMPTS: usize = 5;

/// Pause between report fetch attempts.
pub const REPORT_READ_PAUSE: Duration = Duration::from_secs(30);

// ============================================================================
// Child Process Management
// ============================================================================

/// Hard timeout for check and heal scripts.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);

/// Polling interval while waiting for a child process to exit.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Scheduler Timing
// ============================================================================

/// Initial delay before the first firing of every check timer.
pub const CHECK_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Initial delay before the first firing of the heal timer.
pub const HEAL_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Granularity of the scheduler poll loop.
pub const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lower bound (inclusive) of a sub-service start jitter, in milliseconds.
pub const SUB_JITTER_MIN_MS: u64 = 10;

/// Upper bound (exclusive) of a sub-service start jitter, in milliseconds.
pub const SUB_JITTER_MAX_MS: u64 = 200;

/// Offset added to the largest sub-service jitter to form the lower bound of
/// the main service's jitter window, in milliseconds.
pub const MAIN_JITTER_OFFSET_MS: u64 = 100;

/// Width of the main service jitter window, in milliseconds.
pub const MAIN_JITTER_WINDOW_MS: u64 = 200;

// ============================================================================
// Retry Ledger
// ============================================================================

/// Maximum number of entries kept per check ledger.
pub const LEDGER_CAPACITY: usize = 10;

// ============================================================================
// Environment Keys Exported to Child Processes
// ============================================================================

/// Prefix shared by every environment key apollo exports.
pub const ENV_PREFIX: &str = "APOLLO_";

/// Consul DNS record of the main service.
pub const ENV_RECORD: &str = "APOLLO_RECORD";

/// Datacenter (colo) the host lives in.
pub const ENV_DATACENTER: &str = "APOLLO_DATACENTER";

/// Name of the main service.
pub const ENV_SERVICE_NAME: &str = "APOLLO_SERVICE_NAME";

/// Prefix of the per-service cluster status keys.
pub const ENV_STATUS_PREFIX: &str = "APOLLO_SERVICE_STATUS_";

/// Prefix applied to snapshot copies of the environment.
pub const ENV_SNAPSHOT_PREFIX: &str = "APOLLO_SNAPSHOT_";

/// Set to `1` when a heal run was requested through a fast-heal exit code.
pub const ENV_FAST_HEALING: &str = "APOLLO_FAST_HEALING";

// ============================================================================
// Default Paths and Values
// ============================================================================

/// Default configuration file consumed by the daemon.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/apollo/config.yaml";

/// Default PID file guarding against duplicate instances.
pub const DEFAULT_PID_FILE: &str = "/var/apollo/run/apollo.pid";

/// Default directory holding the per-check retry ledgers.
pub const DEFAULT_TRACK_DIRECTORY: &str = "/var/apollo/track";

/// Default location of the plain-text status report.
pub const DEFAULT_REPORT_FILE: &str = "/var/apollo/report.txt";

/// Default HTTP endpoint of the local Consul agent.
pub const DEFAULT_CONSUL_ENDPOINT: &str = "http://127.0.0.1:8500";

/// Default number of seconds added to a check frequency to form its TTL.
pub const DEFAULT_PENALTY: u64 = 90;

/// Default frequency, in seconds, for the main and sub-service checks.
pub const DEFAULT_CHECK_FREQUENCY: u64 = 60;

/// Default frequency, in seconds, of the heal loop.
pub const DEFAULT_HEAL_FREQUENCY: u64 = 300;

/// Default consecutive-failure budget before a check goes critical.
pub const DEFAULT_CHECK_RETRIES: u32 = 1;

/// File name of the heal-in-progress marker, next to the PID file.
pub const HEAL_ACTIVE_FILE_NAME: &str = "heal.active";

/// File name of the last-heal record, next to the PID file.
pub const LAST_HEAL_FILE_NAME: &str = "last-heal.json";

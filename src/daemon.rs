//! Daemon runtime: shared state, the PID-file guard, and the per-tick
//! control flow that ties checks, decisions, the ledger, and Consul
//! together.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::check;
use crate::config::{CheckSpec, Config};
use crate::constants::{
    ENV_DATACENTER, ENV_RECORD, ENV_SERVICE_NAME, SCRIPT_TIMEOUT, TTL_EXPIRED_SINCE,
};
use crate::consul::{self, ConsulClient, NodeCheck};
use crate::decision::{self, Transition};
use crate::error::{ApolloError, PidFileError};
use crate::heal;
use crate::ledger::Ledger;
use crate::status::{ConsulStatus, Verdict, service_status_key, service_status_value};

/// Mutable state shared between check ticks and the heal loop.
#[derive(Debug, Default)]
pub(crate) struct Runtime {
    /// Environment captured when the main service first went non-OK.
    pub snapshot: Option<HashMap<String, String>>,
    /// Whether the heal loop has consumed its skipped first invocation.
    pub heal_ran_once: bool,
}

/// One apollo instance: immutable config, the Consul client, and the
/// runtime state the timers mutate.
pub struct Apollo {
    pub(crate) config: Config,
    pub(crate) consul: ConsulClient,
    pub(crate) runtime: Mutex<Runtime>,
    /// Single-flight flag for the heal orchestrator, shared between the
    /// heal timer and the fast-heal path.
    pub(crate) heal_in_flight: AtomicBool,
}

impl Apollo {
    /// Builds the daemon from a validated configuration.
    pub fn new(config: Config) -> Result<Self, ApolloError> {
        let consul = ConsulClient::new(&config.consul_endpoint)?;
        Ok(Self {
            config,
            consul,
            runtime: Mutex::new(Runtime::default()),
            heal_in_flight: AtomicBool::new(false),
        })
    }

    /// The daemon's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers the main service and every sub-service with the agent.
    /// The TTL leaves `penalty` seconds of slack past the check frequency.
    pub fn register_services(&self) -> Result<(), ApolloError> {
        let config = &self.config;

        self.consul.register_service(
            &config.service_name,
            config.service_cmd.as_deref().unwrap_or_default(),
            config.service_frequency,
            config.penalty,
            config.port,
            &config.tags_list,
        )?;

        for (name, extra) in &config.extra_service {
            self.consul.register_service(
                &config.wire_id(name),
                &extra.healthcheck,
                extra.frequency,
                config.penalty,
                None,
                &[],
            )?;
        }

        info!(
            "Registered '{}' and {} sub-service(s) with consul",
            config.service_name,
            config.extra_service.len()
        );
        Ok(())
    }

    /// Assembles the `APOLLO_*` environment exported to every child. The
    /// per-service status keys come from fresh agent reads; a failed read
    /// drops that key rather than exporting stale data.
    pub fn build_child_env(&self) -> Vec<(String, String)> {
        let config = &self.config;
        let mut env = vec![
            (
                ENV_RECORD.to_string(),
                format!("{}.service.{}.consul", config.service_name, config.colo),
            ),
            (ENV_DATACENTER.to_string(), config.colo.clone()),
            (ENV_SERVICE_NAME.to_string(), config.service_name.clone()),
        ];

        let node_checks = match self.consul.node_checks(&config.hostname) {
            Ok(checks) => checks,
            Err(err) => {
                warn!("Node check read failed while building the environment: {err}");
                Vec::new()
            }
        };

        for wire_id in config.wire_ids() {
            let (status, since) = node_checks
                .iter()
                .find(|check| check.service_id == wire_id)
                .map(|check| (check.status, check.since))
                .unwrap_or((ConsulStatus::Critical, TTL_EXPIRED_SINCE));

            match self.consul.service_health(&wire_id) {
                Ok(health) => env.push((
                    service_status_key(&wire_id),
                    service_status_value(
                        status,
                        since,
                        health.passing_total(),
                        health.warning_total(),
                        health.critical_total(),
                    ),
                )),
                Err(err) => {
                    warn!("Skipping status key for '{wire_id}': {err}");
                }
            }
        }

        env
    }

    /// Runs one full tick of a check: script, safety gate, transition
    /// decision, ledger, bad flag, TTL push, and the fast-heal hook.
    /// Errors stay inside the tick; the next tick starts from fresh reads.
    pub fn run_check_tick(&self, spec: &CheckSpec) {
        let env = self.build_child_env();
        let result = check::run_script(&spec.id, &spec.script, &env, SCRIPT_TIMEOUT);
        let raw = result.check_verdict();
        let is_main = self.config.is_main_check(spec);
        let now = Utc::now().timestamp();

        debug!(
            "Check '{}' came back {:?} (fast_heal: {})",
            spec.id, raw.verdict, raw.fast_heal
        );

        let mut verdict = raw.verdict;

        // The safety predicate runs against a members read taken inside
        // this tick; a cached view could overshoot the failure budget.
        if is_main
            && !matches!(verdict, Verdict::Ok | Verdict::Oor)
            && !self.cluster_allows_going_down()
        {
            info!(
                "Verdict {:?} for '{}' downgraded to OK by the cluster failure budget",
                verdict, spec.id
            );
            verdict = Verdict::Ok;
        }

        let current = match self.consul.node_check(&self.config.hostname, &spec.wire_id)
        {
            Ok(current) => current,
            Err(err) => {
                warn!("Current status read for '{}' failed: {err}", spec.wire_id);
                None
            }
        };

        let transition = decision::can_change_status(
            current.as_ref(),
            verdict,
            self.config.keep_critical_secs,
            self.config.keep_warning_secs,
            now as f64,
        );

        if is_main
            && !matches!(verdict, Verdict::Ok | Verdict::Oor)
            && transition == Transition::Allow
        {
            self.capture_snapshot(&env);
        }

        let decided = match transition {
            Transition::Allow | Transition::Noop => verdict,
            Transition::Suppress(overwrite) => overwrite,
        };

        let wire = if raw.verdict == Verdict::Oor {
            decided
        } else {
            self.apply_retry_budget(spec, decided, now)
        };

        if is_main {
            self.update_bad_flag(wire);
        }

        self.push_status(spec, wire, raw.verdict != Verdict::Oor, current.as_ref(), now);

        if raw.fast_heal {
            info!("Check '{}' requested an immediate heal", spec.id);
            heal::run_heal(self, true);
        }
    }

    /// Whether this host may keep a non-OK verdict under the failure
    /// budget. A failed members read denies.
    fn cluster_allows_going_down(&self) -> bool {
        match self.consul.service_health(&self.config.service_name) {
            Ok(health) => decision::can_host_go_down(
                &health,
                &self.config.hostname,
                self.config.threshold_down,
                self.config.allow_full_outage,
            ),
            Err(err) => {
                warn!("Cluster safety read failed: {err}; refusing to go down");
                false
            }
        }
    }

    /// Records the verdict in the check's ledger and demotes BAD to WARN
    /// on the wire while the consecutive-failure run is still below the
    /// configured retries.
    fn apply_retry_budget(&self, spec: &CheckSpec, decided: Verdict, now: i64) -> Verdict {
        let mut ledger = match Ledger::load(&self.config.track_directory, &spec.id) {
            Ok(ledger) => ledger,
            Err(err) => {
                error!("Ledger read for '{}' failed: {err}", spec.id);
                Ledger::default()
            }
        };

        ledger.record(decided, now);
        if let Err(err) = ledger.save(&self.config.track_directory, &spec.id) {
            error!("Ledger write for '{}' failed: {err}", spec.id);
        }

        if decided == Verdict::Bad && !ledger.hard_failing(spec.retries) {
            debug!(
                "Check '{}' is within its retry budget of {}; sending warning",
                spec.id, spec.retries
            );
            Verdict::Warn
        } else {
            decided
        }
    }

    /// Pushes the TTL update. The note claims authorship unless the raw
    /// verdict was OOR, and renews the transition timestamp only when the
    /// pushed state differs from the stored one.
    fn push_status(
        &self,
        spec: &CheckSpec,
        wire: Verdict,
        by_apollo: bool,
        current: Option<&NodeCheck>,
        now: i64,
    ) {
        let pushed = wire.consul_status();
        let since = match current {
            Some(current) if current.status == pushed => current.since,
            _ => now as f64,
        };
        let note = consul::format_note(by_apollo, since);

        match self.consul.push(&spec.wire_id, pushed, &note) {
            Ok(()) => debug!("Pushed {pushed} for '{}' ({note})", spec.wire_id),
            Err(err) => error!("Push for '{}' failed: {err}", spec.wire_id),
        }
    }

    /// Captures the cluster environment at the first non-OK crossing. A
    /// snapshot already in hand is kept; the heal call consumes it.
    fn capture_snapshot(&self, env: &[(String, String)]) {
        let mut runtime = match self.runtime.lock() {
            Ok(runtime) => runtime,
            Err(poisoned) => poisoned.into_inner(),
        };
        if runtime.snapshot.is_none() {
            info!("Capturing cluster snapshot for the next heal run");
            runtime.snapshot = Some(env.iter().cloned().collect());
        }
    }

    /// Whether a snapshot is waiting for the next heal run.
    pub fn snapshot_active(&self) -> bool {
        self.runtime
            .lock()
            .map(|runtime| runtime.snapshot.is_some())
            .unwrap_or(false)
    }

    /// Creates the bad-flag file on BAD and removes it on anything else.
    fn update_bad_flag(&self, wire: Verdict) {
        let path = self.config.bad_flag_file();
        if wire == Verdict::Bad {
            if !path.exists() {
                if let Err(err) = fs::write(&path, format!("{}\n", Utc::now().timestamp()))
                {
                    error!("Failed to create bad flag {path:?}: {err}");
                }
            }
        } else if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                error!("Failed to remove bad flag {path:?}: {err}");
            }
        }
    }
}

/// Guards against a second live apollo instance via a PID file.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    /// Claims the PID file. A stored PID that still answers signal 0 means
    /// another instance is alive and startup must abort; a stale file is
    /// replaced.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let pid: i32 = content.trim().parse()?;
                if process_alive(pid) {
                    return Err(PidFileError::AlreadyRunning(pid as u32));
                }
                warn!("Removing stale PID file {path:?} (PID {pid} is gone)");
                fs::remove_file(path)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!("Wrote PID file {path:?}");

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Releases the PID file on shutdown.
    pub fn release(self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {:?}: {err}", self.path);
        }
    }
}

fn process_alive(pid: i32) -> bool {
    // EPERM still means the process exists, just under another user.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

//! Interval scheduler for the checks and the heal loop.
//!
//! A single poll loop owns all timer state; every due tick runs on its own
//! short-lived thread. Per-check and heal in-flight flags drop overlapping
//! ticks instead of queueing them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::CheckSpec;
use crate::constants::{
    CHECK_INITIAL_DELAY, HEAL_INITIAL_DELAY, MAIN_JITTER_OFFSET_MS,
    MAIN_JITTER_WINDOW_MS, SCHEDULER_POLL_INTERVAL, SUB_JITTER_MAX_MS,
    SUB_JITTER_MIN_MS,
};
use crate::daemon::Apollo;
use crate::error::ApolloError;
use crate::heal;
use crate::report;

/// Timer bookkeeping for one check.
struct CheckState {
    spec: Arc<CheckSpec>,
    next_due: Instant,
    in_flight: Arc<AtomicBool>,
}

/// Drives all check timers and the heal timer until shutdown.
pub struct Scheduler {
    apollo: Arc<Apollo>,
    checks: Vec<CheckState>,
    heal_due: Instant,
    heal_frequency: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    /// Builds the scheduler: wipes the track directory, assembles the
    /// check list (sub-services first, then main), and draws the start
    /// jitter for each check.
    pub fn new(apollo: Arc<Apollo>, shutdown: Arc<AtomicBool>) -> Result<Self, ApolloError> {
        let config = apollo.config();
        clear_track_directory(&config.track_directory)?;

        let mut specs = config.check_specs();
        assign_start_jitter(&mut specs, &config.service_name);
        let heal_frequency = Duration::from_secs(config.heal_frequency);

        let start = Instant::now();
        let checks = specs
            .into_iter()
            .map(|spec| {
                info!(
                    "Scheduling check '{}' every {}s (start jitter {}ms)",
                    spec.id,
                    spec.frequency.as_secs(),
                    spec.start_jitter.as_millis()
                );
                CheckState {
                    spec: Arc::new(spec),
                    next_due: start + CHECK_INITIAL_DELAY,
                    in_flight: Arc::new(AtomicBool::new(false)),
                }
            })
            .collect();

        Ok(Self {
            apollo,
            checks,
            heal_due: start + HEAL_INITIAL_DELAY,
            heal_frequency,
            shutdown,
        })
    }

    /// Runs the poll loop until the shutdown flag flips.
    pub fn run(&mut self) {
        info!(
            "Scheduler running with {} check(s), heal every {}s",
            self.checks.len(),
            self.heal_frequency.as_secs()
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();

            for check in &mut self.checks {
                if now >= check.next_due {
                    check.next_due += check.spec.frequency;
                    fire_check(&self.apollo, check);
                }
            }

            if now >= self.heal_due {
                self.heal_due += self.heal_frequency;
                fire_heal(&self.apollo);
            }

            thread::sleep(SCHEDULER_POLL_INTERVAL);
        }

        info!("Scheduler stopped");
    }
}

/// Spawns one check tick, unless the previous tick is still running.
fn fire_check(apollo: &Arc<Apollo>, check: &CheckState) {
    if check
        .in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!(
            "Check '{}' is still running from its previous tick; dropping this one",
            check.spec.id
        );
        return;
    }

    let apollo = Arc::clone(apollo);
    let spec = Arc::clone(&check.spec);
    let in_flight = Arc::clone(&check.in_flight);

    thread::spawn(move || {
        thread::sleep(spec.start_jitter);
        debug!("Tick for check '{}'", spec.id);
        apollo.run_check_tick(&spec);
        in_flight.store(false, Ordering::SeqCst);
    });
}

/// Spawns one heal cycle; the report follows whether or not the heal ran.
/// Overlap protection lives inside the orchestrator, shared with the
/// fast-heal path.
fn fire_heal(apollo: &Arc<Apollo>) {
    let apollo = Arc::clone(apollo);
    thread::spawn(move || {
        heal::run_heal(&apollo, false);
        report::write_report_logged(&apollo.consul, &apollo.config().report_file);
    });
}

/// Draws the start offsets: each sub-service lands in [10, 200) ms and the
/// main service lands 100-300 ms past the latest sub-service, so the subs
/// have published before the main check first fires.
pub fn assign_start_jitter(specs: &mut [CheckSpec], main_id: &str) {
    let mut rng = rand::thread_rng();
    let mut max_sub_ms = 0;

    for spec in specs.iter_mut() {
        if spec.wire_id != main_id {
            let jitter = rng.gen_range(SUB_JITTER_MIN_MS..SUB_JITTER_MAX_MS);
            spec.start_jitter = Duration::from_millis(jitter);
            max_sub_ms = max_sub_ms.max(jitter);
        }
    }

    for spec in specs.iter_mut() {
        if spec.wire_id == main_id {
            let lower = max_sub_ms + MAIN_JITTER_OFFSET_MS;
            let jitter = rng.gen_range(lower..lower + MAIN_JITTER_WINDOW_MS);
            spec.start_jitter = Duration::from_millis(jitter);
        }
    }
}

/// Empties the track directory so retry history never survives a restart.
fn clear_track_directory(dir: &std::path::Path) -> Result<(), ApolloError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    use crate::config::{Config, ExtraService};

    fn config_with_subs(dir: &std::path::Path) -> Config {
        let mut extra = BTreeMap::new();
        for name in ["httpok", "disk", "memcache"] {
            extra.insert(
                name.to_string(),
                ExtraService {
                    healthcheck: format!("/usr/local/bin/check_{name}"),
                    frequency: 30,
                    retries: 1,
                },
            );
        }
        Config {
            service_name: "www".to_string(),
            service_cmd: Some("/usr/local/bin/check_www".to_string()),
            service_frequency: 60,
            extra_service: extra,
            heal_cmd: None,
            heal_frequency: 300,
            heal_dryrun: false,
            heal_on_status: crate::config::HealOnStatus::Any,
            keep_critical_secs: 0,
            keep_warning_secs: 0,
            threshold_down: None,
            allow_full_outage: false,
            port: None,
            hostname: "w01".to_string(),
            colo: "lga".to_string(),
            tags_list: vec![],
            consul_endpoint: "http://127.0.0.1:1".to_string(),
            penalty: 90,
            track_directory: dir.join("track"),
            report_file: dir.join("report.txt"),
            pid_file: dir.join("apollo.pid"),
        }
    }

    #[test]
    fn jitter_lands_in_the_specified_windows() {
        let dir = tempdir().unwrap();
        let config = config_with_subs(dir.path());

        // Draw repeatedly; the windows are tight enough that an off-by-one
        // would trip at least one iteration.
        for _ in 0..50 {
            let mut specs = config.check_specs();
            assign_start_jitter(&mut specs, &config.service_name);

            let max_sub = specs
                .iter()
                .filter(|spec| spec.wire_id != "www")
                .map(|spec| spec.start_jitter.as_millis() as u64)
                .max()
                .unwrap();

            for spec in &specs {
                let ms = spec.start_jitter.as_millis() as u64;
                if spec.wire_id == "www" {
                    assert!(ms >= max_sub + 100 && ms < max_sub + 300);
                } else {
                    assert!((10..200).contains(&ms));
                }
            }
        }
    }

    #[test]
    fn main_jitter_without_subs_starts_at_the_offset() {
        let dir = tempdir().unwrap();
        let mut config = config_with_subs(dir.path());
        config.extra_service.clear();

        for _ in 0..20 {
            let mut specs = config.check_specs();
            assign_start_jitter(&mut specs, &config.service_name);
            let ms = specs[0].start_jitter.as_millis() as u64;
            assert!((100..300).contains(&ms));
        }
    }

    #[test]
    fn track_directory_is_wiped_on_startup() {
        let dir = tempdir().unwrap();
        let track = dir.path().join("track");
        std::fs::create_dir_all(&track).unwrap();
        std::fs::write(track.join("httpok"), "[]").unwrap();

        clear_track_directory(&track).unwrap();
        assert!(track.exists());
        assert!(std::fs::read_dir(&track).unwrap().next().is_none());
    }
}

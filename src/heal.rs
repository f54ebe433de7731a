//! Heal orchestrator: decides whether the repair command may run, feeds it
//! the cluster snapshot, and maintains the heal marker files.

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::check::{self, ScriptResult};
use crate::config::HealOnStatus;
use crate::constants::{ENV_FAST_HEALING, SCRIPT_TIMEOUT};
use crate::daemon::Apollo;
use crate::status::snapshot_environment;

/// Record of the most recent heal invocation, kept next to the PID file
/// for login banners and operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastHeal {
    /// Wall-clock seconds when the run started.
    pub time: i64,
    /// Whether this was a fast-heal request.
    pub fast: bool,
    /// `starting`, then `healed` or `failed`.
    pub status: String,
}

/// Runs one heal cycle. `fast` marks an immediate request from a check's
/// `*_HEAL_NOW` exit code and bypasses the status gate, nothing else.
/// Overlapping invocations are dropped.
pub fn run_heal(apollo: &Apollo, fast: bool) {
    if apollo
        .heal_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("A heal run is already in progress; dropping this one");
        return;
    }

    run_heal_guarded(apollo, fast);
    apollo.heal_in_flight.store(false, Ordering::SeqCst);
}

fn run_heal_guarded(apollo: &Apollo, fast: bool) {
    let config = apollo.config();

    if config.heal_dryrun {
        info!("Heal dry-run: would evaluate heal preconditions and run the command");
        return;
    }

    // The very first invocation only arms the loop, so the first round of
    // checks gets to publish status before anything is repaired.
    {
        let mut runtime = match apollo.runtime.lock() {
            Ok(runtime) => runtime,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !runtime.heal_ran_once {
            runtime.heal_ran_once = true;
            debug!("Skipping the first heal invocation");
            return;
        }
    }

    let current = match apollo
        .consul
        .node_check(&config.hostname, &config.service_name)
    {
        Ok(Some(current)) => current,
        Ok(None) => {
            warn!("Main service has no check registered; not healing");
            return;
        }
        Err(err) => {
            warn!("Status read before heal failed: {err}; not healing");
            return;
        }
    };

    if !current.by_apollo {
        info!("Current status was not set by apollo; not healing");
        return;
    }

    if !fast
        && let HealOnStatus::Only(gate) = config.heal_on_status
        && current.status != gate
    {
        debug!(
            "Heal gated on {gate} but the main service is {}; skipping",
            current.status
        );
        return;
    }

    let Some(heal_cmd) = config.heal_cmd.as_deref() else {
        warn!("No heal_cmd configured; nothing to run");
        return;
    };
    if check::resolve_command(heal_cmd).is_none() {
        warn!("Heal command '{heal_cmd}' is not executable; not healing");
        return;
    }

    let mut env = apollo.build_child_env();
    if let Some(snapshot) = take_snapshot(apollo) {
        env.extend(snapshot_environment(&snapshot));
    }
    if fast {
        env.push((ENV_FAST_HEALING.to_string(), "1".to_string()));
    }

    let active_file = config.heal_active_file();
    let last_heal_file = config.last_heal_file();
    let started = Utc::now().timestamp();

    touch(&active_file);
    write_last_heal(
        &last_heal_file,
        &LastHeal {
            time: started,
            fast,
            status: "starting".to_string(),
        },
    );

    info!("Running heal command '{heal_cmd}' (fast: {fast})");
    let result = check::run_script("heal", heal_cmd, &env, SCRIPT_TIMEOUT);
    let status = if result.healed() { "healed" } else { "failed" };
    match result {
        ScriptResult::Exited(code) => info!("Heal command exited {code}: {status}"),
        other => warn!("Heal command did not finish cleanly ({other:?}): {status}"),
    }

    if let Err(err) = fs::remove_file(&active_file) {
        warn!("Failed to remove heal marker {active_file:?}: {err}");
    }
    write_last_heal(
        &last_heal_file,
        &LastHeal {
            time: started,
            fast,
            status: status.to_string(),
        },
    );
}

/// Takes the pending snapshot, if any. The snapshot belongs to exactly one
/// heal run; later runs see live data only.
fn take_snapshot(apollo: &Apollo) -> Option<std::collections::HashMap<String, String>> {
    let mut runtime = match apollo.runtime.lock() {
        Ok(runtime) => runtime,
        Err(poisoned) => poisoned.into_inner(),
    };
    runtime.snapshot.take()
}

fn touch(path: &Path) {
    if let Err(err) = fs::write(path, format!("{}\n", Utc::now().timestamp())) {
        error!("Failed to touch heal marker {path:?}: {err}");
    }
}

fn write_last_heal(path: &Path, record: &LastHeal) {
    match serde_json::to_string(record) {
        Ok(body) => {
            if let Err(err) = fs::write(path, body) {
                error!("Failed to write {path:?}: {err}");
            }
        }
        Err(err) => error!("Failed to encode last-heal record: {err}"),
    }
}

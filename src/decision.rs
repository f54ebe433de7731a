//! Hysteresis and cluster-safety predicates.
//!
//! Both predicates are pure functions over freshly-read Consul state, so a
//! decision never acts on anything staler than its own tick.

use tracing::debug;

use crate::config::Threshold;
use crate::consul::{NodeCheck, ServiceHealth};
use crate::status::{ConsulStatus, Verdict};

/// What to do with a freshly computed verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Push the new verdict as an apollo-authored transition.
    Allow,
    /// Push this verdict instead; the dwell window is still open.
    Suppress(Verdict),
    /// No transition to author: push the verdict as-is and preserve the
    /// stored transition timestamp.
    Noop,
}

/// Decides whether a new verdict may change the stored status.
///
/// Rules, in order: OOR never authors a transition; an externally-authored
/// status is never fought (which also means recovery after OOR bypasses
/// the dwell windows below); a repeated BAD or WARN is a no-op so `since`
/// survives; a recovery out of critical or warning must outwait
/// `keep_critical_secs` / `keep_warning_secs`.
pub fn can_change_status(
    current: Option<&NodeCheck>,
    new: Verdict,
    keep_critical_secs: u64,
    keep_warning_secs: u64,
    now: f64,
) -> Transition {
    if new == Verdict::Oor {
        return Transition::Noop;
    }

    let Some(current) = current else {
        return Transition::Noop;
    };
    if !current.by_apollo {
        return Transition::Noop;
    }

    match new {
        Verdict::Bad if current.status == ConsulStatus::Critical => Transition::Noop,
        Verdict::Bad => Transition::Allow,
        Verdict::Warn if current.status == ConsulStatus::Warning => Transition::Noop,
        Verdict::Warn => Transition::Allow,
        Verdict::Ok => match current.status {
            ConsulStatus::Critical => {
                if dwell_elapsed(keep_critical_secs, current.since, now) {
                    Transition::Allow
                } else {
                    Transition::Suppress(Verdict::Bad)
                }
            }
            ConsulStatus::Warning => {
                if dwell_elapsed(keep_warning_secs, current.since, now) {
                    Transition::Allow
                } else {
                    Transition::Suppress(Verdict::Warn)
                }
            }
            ConsulStatus::Passing => Transition::Allow,
        },
        Verdict::Oor => unreachable!("handled above"),
    }
}

fn dwell_elapsed(keep_secs: u64, since: f64, now: f64) -> bool {
    keep_secs == 0 || now - since > keep_secs as f64
}

/// Decides whether this host may go bad without blowing the cluster's
/// failure budget.
pub fn can_host_go_down(
    health: &ServiceHealth,
    hostname: &str,
    threshold: Option<Threshold>,
    allow_full_outage: bool,
) -> bool {
    if health.passing_total() == 0 && !allow_full_outage {
        debug!("No passing members left; refusing to go down");
        return false;
    }
    if health.critical_total() == 0 {
        return true;
    }
    let Some(threshold) = threshold else {
        return true;
    };

    let down_threshold = threshold.resolve(health.any_total());
    if health.critical_total() < down_threshold {
        return true;
    }

    // The budget is spent. Every instance computes the same sorted prefix,
    // so exactly the lowest-hostname members keep their failing status and
    // the rest flap back to passing.
    let first_bad = &health.critical[..down_threshold.min(health.critical.len())];
    let permitted = first_bad.iter().any(|member| member == hostname);
    if !permitted {
        debug!(
            "Failure budget of {down_threshold} spent and '{hostname}' is not among \
             the accepted failures"
        );
    }
    permitted
}

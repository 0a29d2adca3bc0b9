//! Recovery policy normalisation.
//!
//! # Design
//! - Converts operator-supplied millisecond values into `Duration`s.
//! - Clamps out-of-range values to safe ones instead of rejecting the document.
//! - Records one warning per guard rail applied so the effective view is auditable.

use std::collections::HashSet;
use std::time::Duration;

use salvor_torrent_core::BlockReason;
use serde::Serialize;

use crate::model::RecoveryPolicy;

/// Smallest interval accepted for recurring loops and probe freshness.
pub const MIN_LOOP_INTERVAL_MS: u64 = 1_000;
/// Upper bound for the backoff cap (one hour).
pub const MAX_BACKOFF_CAP_MS: u64 = 3_600_000;
/// Upper bound for the escalation grace window.
pub const MAX_ESCALATION_GRACE_MS: u64 = 30_000;
const MAX_FINALIZE_DISPLAY_MS: u64 = 10_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;

/// Effective recovery policy after guard rails.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPolicyEffective {
    /// Delay before a user-initiated failure surfaces a decision prompt.
    pub escalation_grace: Duration,
    /// Display hold before a resolved session auto-dismisses.
    pub finalize_display: Duration,
    /// Interval between background recovery passes.
    pub background_interval: Duration,
    /// Debounce applied to requested background passes.
    pub background_debounce: Duration,
    /// Interval between probe refresh passes.
    pub probe_refresh_interval: Duration,
    /// Age after which cached probes are stale.
    pub probe_ttl: Duration,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Backoff upper bound.
    pub backoff_cap: Duration,
    /// Whether missing local directories may be recreated silently.
    pub auto_create_directories: bool,
    /// Block reasons that never escalate to a user decision.
    pub non_decision_reasons: Vec<BlockReason>,
    /// Enables internal consistency diagnostics.
    pub development_checks: bool,
    /// Guard-rail warnings applied while normalising.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Default for RecoveryPolicyEffective {
    fn default() -> Self {
        normalize_recovery_policy(&RecoveryPolicy::default())
    }
}

/// Produce the effective recovery policy for runtime use.
#[must_use]
pub fn normalize_recovery_policy(policy: &RecoveryPolicy) -> RecoveryPolicyEffective {
    let mut warnings = Vec::new();

    let escalation_grace = clamp_max(
        "escalation_grace_ms",
        policy.escalation_grace_ms,
        MAX_ESCALATION_GRACE_MS,
        &mut warnings,
    );
    let finalize_display = clamp_max(
        "finalize_display_ms",
        policy.finalize_display_ms,
        MAX_FINALIZE_DISPLAY_MS,
        &mut warnings,
    );
    let background_interval = clamp_min(
        "background_interval_ms",
        policy.background_interval_ms,
        MIN_LOOP_INTERVAL_MS,
        &mut warnings,
    );
    let probe_refresh_interval = clamp_min(
        "probe_refresh_interval_ms",
        policy.probe_refresh_interval_ms,
        MIN_LOOP_INTERVAL_MS,
        &mut warnings,
    );
    let probe_ttl = clamp_min(
        "probe_ttl_ms",
        policy.probe_ttl_ms,
        MIN_LOOP_INTERVAL_MS,
        &mut warnings,
    );

    let backoff_base_ms = if policy.backoff_base_ms == 0 {
        warnings.push(format!(
            "backoff_base_ms 0 disables backoff; using {DEFAULT_BACKOFF_BASE_MS}"
        ));
        DEFAULT_BACKOFF_BASE_MS
    } else {
        policy.backoff_base_ms
    };
    let mut backoff_cap_ms = policy.backoff_cap_ms;
    if backoff_cap_ms > MAX_BACKOFF_CAP_MS {
        warnings.push(format!(
            "backoff_cap_ms {backoff_cap_ms} exceeds guard rail; clamping to {MAX_BACKOFF_CAP_MS}"
        ));
        backoff_cap_ms = MAX_BACKOFF_CAP_MS;
    }
    if backoff_cap_ms < MIN_LOOP_INTERVAL_MS {
        warnings.push(format!(
            "backoff_cap_ms {backoff_cap_ms} below guard rail; raising to {MIN_LOOP_INTERVAL_MS}"
        ));
        backoff_cap_ms = MIN_LOOP_INTERVAL_MS;
    }
    let backoff_base_ms = if backoff_base_ms > backoff_cap_ms {
        warnings.push(format!(
            "backoff_base_ms {backoff_base_ms} exceeds backoff_cap_ms {backoff_cap_ms}; using cap"
        ));
        backoff_cap_ms
    } else {
        backoff_base_ms
    };

    let non_decision_reasons = parse_reasons(&policy.non_decision_reasons, &mut warnings);

    RecoveryPolicyEffective {
        escalation_grace,
        finalize_display,
        background_interval,
        background_debounce: Duration::from_millis(policy.background_debounce_ms),
        probe_refresh_interval,
        probe_ttl,
        backoff_base: Duration::from_millis(backoff_base_ms),
        backoff_cap: Duration::from_millis(backoff_cap_ms),
        auto_create_directories: policy.auto_create_directories,
        non_decision_reasons,
        development_checks: policy.development_checks,
        warnings,
    }
}

fn clamp_max(field: &str, value: u64, max: u64, warnings: &mut Vec<String>) -> Duration {
    if value > max {
        warnings.push(format!("{field} {value} exceeds guard rail; clamping to {max}"));
        return Duration::from_millis(max);
    }
    Duration::from_millis(value)
}

fn clamp_min(field: &str, value: u64, min: u64, warnings: &mut Vec<String>) -> Duration {
    if value < min {
        warnings.push(format!("{field} {value} below guard rail; raising to {min}"));
        return Duration::from_millis(min);
    }
    Duration::from_millis(value)
}

fn parse_reasons(values: &[String], warnings: &mut Vec<String>) -> Vec<BlockReason> {
    let mut seen = HashSet::new();
    let mut reasons = Vec::with_capacity(values.len());
    for value in values {
        match value.parse::<BlockReason>() {
            Ok(reason) => {
                if seen.insert(reason) {
                    reasons.push(reason);
                }
            }
            Err(_) => warnings.push(format!("unknown non_decision_reason '{value}' ignored")),
        }
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_normalise_without_warnings() {
        let effective = RecoveryPolicyEffective::default();
        assert!(effective.warnings.is_empty(), "{:?}", effective.warnings);
        assert_eq!(effective.escalation_grace, Duration::from_millis(2_500));
        assert_eq!(effective.backoff_cap, Duration::from_secs(300));
        assert_eq!(
            effective.non_decision_reasons,
            vec![BlockReason::DiskFull, BlockReason::FreeSpaceCheckUnsupported]
        );
    }

    #[test]
    fn guard_rails_clamp_and_warn() {
        let policy = RecoveryPolicy {
            escalation_grace_ms: 120_000,
            background_interval_ms: 0,
            probe_ttl_ms: 10,
            backoff_base_ms: 900_000,
            backoff_cap_ms: 600_000,
            ..RecoveryPolicy::default()
        };
        let effective = normalize_recovery_policy(&policy);

        assert_eq!(
            effective.escalation_grace,
            Duration::from_millis(MAX_ESCALATION_GRACE_MS)
        );
        assert_eq!(
            effective.background_interval,
            Duration::from_millis(MIN_LOOP_INTERVAL_MS)
        );
        assert_eq!(effective.probe_ttl, Duration::from_millis(MIN_LOOP_INTERVAL_MS));
        assert_eq!(effective.backoff_cap, Duration::from_millis(600_000));
        assert_eq!(effective.backoff_base, effective.backoff_cap);
        assert_eq!(effective.warnings.len(), 4);
    }

    #[test]
    fn oversized_cap_and_zero_base_are_repaired() {
        let policy = RecoveryPolicy {
            backoff_base_ms: 0,
            backoff_cap_ms: u64::MAX,
            ..RecoveryPolicy::default()
        };
        let effective = normalize_recovery_policy(&policy);
        assert_eq!(effective.backoff_base, Duration::from_millis(DEFAULT_BACKOFF_BASE_MS));
        assert_eq!(effective.backoff_cap, Duration::from_millis(MAX_BACKOFF_CAP_MS));
        assert!(effective.warnings.iter().any(|w| w.contains("guard rail")));
    }

    #[test]
    fn zero_cap_keeps_a_nonzero_backoff() {
        let policy = RecoveryPolicy {
            backoff_cap_ms: 0,
            ..RecoveryPolicy::default()
        };
        let effective = normalize_recovery_policy(&policy);
        assert_eq!(effective.backoff_cap, Duration::from_millis(MIN_LOOP_INTERVAL_MS));
        assert_eq!(effective.backoff_base, effective.backoff_cap);
        assert!(!effective.backoff_base.is_zero());
        assert_eq!(effective.warnings.len(), 2, "{:?}", effective.warnings);
    }

    #[test]
    fn unknown_and_duplicate_reasons_are_filtered() {
        let policy = RecoveryPolicy {
            non_decision_reasons: vec![
                "disk_full".into(),
                "disk_full".into(),
                "solar_flare".into(),
            ],
            ..RecoveryPolicy::default()
        };
        let effective = normalize_recovery_policy(&policy);
        assert_eq!(effective.non_decision_reasons, vec![BlockReason::DiskFull]);
        assert!(effective.warnings[0].contains("solar_flare"));
    }
}

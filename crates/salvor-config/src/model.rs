//! Typed configuration models.
//!
//! # Design
//! - Pure data carriers deserialised from the optional JSON document.
//! - Every field has a serde default so partial documents are valid.

use serde::{Deserialize, Serialize};

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SalvorConfig {
    /// Recovery timing and decision policy.
    pub recovery: RecoveryPolicy,
    /// Logging output settings.
    pub logging: LoggingSettings,
}

/// Recovery timing and decision policy as written by operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Delay before a user-initiated failure surfaces a decision prompt.
    pub escalation_grace_ms: u64,
    /// How long a resolved session stays visible before it auto-dismisses.
    pub finalize_display_ms: u64,
    /// Interval between background recovery passes.
    pub background_interval_ms: u64,
    /// Debounce applied to explicitly requested background passes.
    pub background_debounce_ms: u64,
    /// Interval between probe cache refresh passes.
    pub probe_refresh_interval_ms: u64,
    /// Age after which a cached probe is considered stale.
    pub probe_ttl_ms: u64,
    /// First backoff delay after a failed background attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for the backoff delay.
    pub backoff_cap_ms: u64,
    /// Whether missing local directories may be recreated silently.
    pub auto_create_directories: bool,
    /// Block reasons that never escalate to a user decision.
    pub non_decision_reasons: Vec<String>,
    /// Enables internal consistency diagnostics.
    pub development_checks: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            escalation_grace_ms: 2_500,
            finalize_display_ms: 1_500,
            background_interval_ms: 15_000,
            background_debounce_ms: 750,
            probe_refresh_interval_ms: 60_000,
            probe_ttl_ms: 30_000,
            backoff_base_ms: 5_000,
            backoff_cap_ms: 300_000,
            auto_create_directories: true,
            non_decision_reasons: vec![
                "disk_full".to_string(),
                "free_space_check_unsupported".to_string(),
            ],
            development_checks: cfg!(debug_assertions),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Fallback level when `RUST_LOG` is unset.
    pub level: String,
    /// `json` or `pretty`; inferred from the build profile when absent.
    pub format: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let parsed: SalvorConfig =
            serde_json::from_str(r#"{"recovery": {"backoff_base_ms": 1000}}"#).expect("parse");
        assert_eq!(parsed.recovery.backoff_base_ms, 1_000);
        assert_eq!(parsed.recovery.backoff_cap_ms, 300_000);
        assert!(parsed.recovery.auto_create_directories);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn default_policy_excludes_disk_full_from_decisions() {
        let policy = RecoveryPolicy::default();
        assert!(policy.non_decision_reasons.iter().any(|r| r == "disk_full"));
    }
}

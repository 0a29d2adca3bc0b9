//! Recovery outcomes and the single upgrade rule that turns a block into a decision.
//!
//! # Design
//! - `RecoveryOutcome` is a tagged union consumed verbatim by every layer.
//! - `upgrade_outcome_for_session` is the only place a `Blocked` outcome becomes
//!   `NeedsUserDecision`; the recovery gate is its only caller.
//! - The set of reasons that never warrant a decision is product policy and comes
//!   from configuration through [`DecisionPolicy`].

use std::collections::HashSet;

use salvor_torrent_core::BlockReason;
use serde::Serialize;

use crate::classifier::{Classification, Confidence, EscalationSignal};

/// Machine-readable cause recorded when a recovery resolves.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedLog {
    /// The torrent is downloading again.
    DownloadResumed,
    /// Verification found every piece and the torrent resumed.
    AllVerifiedResuming,
    /// Verification completed and the torrent stays paused.
    VerifyCompletedPaused,
}

impl ResolvedLog {
    /// Render the log as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DownloadResumed => "download_resumed",
            Self::AllVerifiedResuming => "all_verified_resuming",
            Self::VerifyCompletedPaused => "verify_completed_paused",
        }
    }

    /// Whether the torrent was left paused by the recovery.
    #[must_use]
    pub const fn keeps_paused(self) -> bool {
        matches!(self, Self::VerifyCompletedPaused)
    }
}

/// Outcome of a recovery attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Recovery completed.
    Resolved {
        /// Why the recovery is considered complete.
        log: ResolvedLog,
    },
    /// Recovery cannot proceed without more information.
    Blocked {
        /// Machine-readable reason.
        reason: BlockReason,
        /// Optional diagnostic.
        message: Option<String>,
    },
    /// The user can act meaningfully on the block.
    NeedsUserDecision {
        /// Machine-readable reason.
        reason: BlockReason,
        /// Optional diagnostic.
        message: Option<String>,
    },
}

impl RecoveryOutcome {
    /// Shorthand for a block without diagnostic.
    #[must_use]
    pub const fn blocked(reason: BlockReason) -> Self {
        Self::Blocked {
            reason,
            message: None,
        }
    }

    /// Machine-friendly discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::Blocked { .. } => "blocked",
            Self::NeedsUserDecision { .. } => "needs_user_decision",
        }
    }

    /// Blocking reason, when the outcome is not resolved.
    #[must_use]
    pub const fn reason(&self) -> Option<BlockReason> {
        match self {
            Self::Resolved { .. } => None,
            Self::Blocked { reason, .. } | Self::NeedsUserDecision { reason, .. } => Some(*reason),
        }
    }

    /// Whether the outcome requires a user decision.
    #[must_use]
    pub const fn is_decision(&self) -> bool {
        matches!(self, Self::NeedsUserDecision { .. })
    }
}

/// Which block reasons may ever escalate to a user decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPolicy {
    non_decision: HashSet<BlockReason>,
}

impl DecisionPolicy {
    /// Policy excluding the given reasons from escalation.
    #[must_use]
    pub fn excluding<I>(reasons: I) -> Self
    where
        I: IntoIterator<Item = BlockReason>,
    {
        Self {
            non_decision: reasons.into_iter().collect(),
        }
    }

    /// Whether a block with `reason` may become a user decision.
    #[must_use]
    pub fn allows_decision(&self, reason: BlockReason) -> bool {
        !self.non_decision.contains(&reason)
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::excluding([BlockReason::DiskFull, BlockReason::FreeSpaceCheckUnsupported])
    }
}

/// Upgrade a blocked outcome to a user decision when the classification shows the
/// user can act meaningfully. Any other outcome is returned unchanged.
#[must_use]
pub fn upgrade_outcome_for_session(
    outcome: RecoveryOutcome,
    classification: &Classification,
    policy: &DecisionPolicy,
) -> RecoveryOutcome {
    match outcome {
        RecoveryOutcome::Blocked { reason, message }
            if policy.allows_decision(reason) && warrants_decision(classification) =>
        {
            RecoveryOutcome::NeedsUserDecision { reason, message }
        }
        other => other,
    }
}

const fn warrants_decision(classification: &Classification) -> bool {
    matches!(
        classification.confidence,
        Confidence::Certain | Confidence::Probable
    ) || !matches!(classification.escalation, EscalationSignal::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassificationKind;

    fn classification(confidence: Confidence, escalation: EscalationSignal) -> Classification {
        Classification {
            kind: ClassificationKind::VolumeLoss,
            confidence,
            escalation,
        }
    }

    #[test]
    fn confident_blocks_upgrade() {
        let policy = DecisionPolicy::default();
        let upgraded = upgrade_outcome_for_session(
            RecoveryOutcome::blocked(BlockReason::VolumeMissing),
            &classification(Confidence::Probable, EscalationSignal::None),
            &policy,
        );
        assert_eq!(
            upgraded,
            RecoveryOutcome::NeedsUserDecision {
                reason: BlockReason::VolumeMissing,
                message: None
            }
        );
    }

    #[test]
    fn unknown_confidence_without_escalation_stays_blocked() {
        let outcome = upgrade_outcome_for_session(
            RecoveryOutcome::blocked(BlockReason::VolumeMissing),
            &classification(Confidence::Unknown, EscalationSignal::None),
            &DecisionPolicy::default(),
        );
        assert_eq!(outcome.kind(), "blocked");

        let escalated = upgrade_outcome_for_session(
            RecoveryOutcome::blocked(BlockReason::VolumeMissing),
            &classification(Confidence::Unknown, EscalationSignal::MultipleCandidates),
            &DecisionPolicy::default(),
        );
        assert!(escalated.is_decision());
    }

    #[test]
    fn non_decision_reasons_never_upgrade() {
        let certain = classification(Confidence::Certain, EscalationSignal::Conflict);
        for reason in [BlockReason::DiskFull, BlockReason::FreeSpaceCheckUnsupported] {
            let outcome = upgrade_outcome_for_session(
                RecoveryOutcome::blocked(reason),
                &certain,
                &DecisionPolicy::default(),
            );
            assert_eq!(outcome, RecoveryOutcome::blocked(reason));
        }

        let permissive = DecisionPolicy::excluding([]);
        assert!(
            upgrade_outcome_for_session(
                RecoveryOutcome::blocked(BlockReason::DiskFull),
                &certain,
                &permissive
            )
            .is_decision()
        );
    }

    #[test]
    fn upgrade_is_idempotent() {
        let policy = DecisionPolicy::default();
        let samples = [
            classification(Confidence::Certain, EscalationSignal::None),
            classification(Confidence::Unknown, EscalationSignal::None),
            classification(Confidence::Unknown, EscalationSignal::Conflict),
        ];
        let outcomes = [
            RecoveryOutcome::blocked(BlockReason::PathMissing),
            RecoveryOutcome::blocked(BlockReason::DiskFull),
            RecoveryOutcome::Resolved {
                log: ResolvedLog::DownloadResumed,
            },
        ];
        for class in &samples {
            for outcome in &outcomes {
                let once = upgrade_outcome_for_session(outcome.clone(), class, &policy);
                let twice = upgrade_outcome_for_session(once.clone(), class, &policy);
                assert_eq!(once, twice);
            }
        }
    }
}

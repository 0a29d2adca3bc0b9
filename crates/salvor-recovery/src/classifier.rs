//! Pure classification of failing torrents.
//!
//! # Design
//! - Total over every error class; unrecognised classes map to `unknown`/`unknown`.
//! - Path loss is only certain when the engine shares this filesystem and could
//!   recreate the directory itself, so remote execution caps it at probable.
//! - Derived fresh on every evaluation; nothing here is stored.

use salvor_torrent_core::{Capabilities, ErrorClass, ErrorEnvelope, RecoveryState};
use serde::Serialize;

/// Inferred failure category.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    /// Save directory is gone.
    PathLoss,
    /// Hosting volume is gone.
    VolumeLoss,
    /// Directory present, payload missing.
    DataMissing,
    /// Destination out of space.
    DiskFull,
    /// Nothing more specific is known.
    Unknown,
}

impl ClassificationKind {
    /// Render the kind as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PathLoss => "path_loss",
            Self::VolumeLoss => "volume_loss",
            Self::DataMissing => "data_missing",
            Self::DiskFull => "disk_full",
            Self::Unknown => "unknown",
        }
    }
}

/// How much the classification can be trusted.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// The engine confirmed the failure.
    Certain,
    /// Signals agree but nothing confirmed them.
    Probable,
    /// Under-committed on purpose.
    Unknown,
}

/// Signal that the user must pick between alternatives.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSignal {
    /// Nothing to escalate.
    None,
    /// The engine reported conflicting state.
    Conflict,
    /// More than one candidate location holds matching data.
    MultipleCandidates,
}

/// Derived judgement about why a torrent is failing.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Classification {
    /// Failure category.
    pub kind: ClassificationKind,
    /// Trust level.
    pub confidence: Confidence,
    /// Escalation signal.
    pub escalation: EscalationSignal,
}

impl Classification {
    /// Classification that commits to nothing.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            kind: ClassificationKind::Unknown,
            confidence: Confidence::Unknown,
            escalation: EscalationSignal::None,
        }
    }

    /// Whether a decision may surface without waiting out the escalation grace.
    #[must_use]
    pub const fn has_immediate_certainty(&self) -> bool {
        matches!(self.confidence, Confidence::Certain)
            || !matches!(self.escalation, EscalationSignal::None)
    }
}

/// Classify a failing torrent from its envelope, path hint and execution capabilities.
#[must_use]
pub fn classify(
    envelope: &ErrorEnvelope,
    path_hint: Option<&str>,
    capabilities: &Capabilities,
) -> Classification {
    let needs_action = envelope.recovery_state == RecoveryState::NeedsUserAction;
    let (kind, confidence) = match envelope.error_class {
        ErrorClass::PathMissing => {
            let confidence = if needs_action && capabilities.allows_local_directory_creation() {
                Confidence::Certain
            } else if path_hint.is_some() {
                Confidence::Probable
            } else {
                Confidence::Unknown
            };
            (ClassificationKind::PathLoss, confidence)
        }
        ErrorClass::VolumeMissing => (
            ClassificationKind::VolumeLoss,
            if needs_action {
                Confidence::Certain
            } else {
                Confidence::Unknown
            },
        ),
        ErrorClass::DataMissing => (
            ClassificationKind::DataMissing,
            if needs_action {
                Confidence::Certain
            } else {
                Confidence::Probable
            },
        ),
        ErrorClass::DiskFull => (ClassificationKind::DiskFull, Confidence::Certain),
        ErrorClass::TrackerError | ErrorClass::LocalError | ErrorClass::Unknown => {
            (ClassificationKind::Unknown, Confidence::Unknown)
        }
    };

    let escalation = if envelope.recovery_state == RecoveryState::Conflict {
        EscalationSignal::Conflict
    } else if envelope.candidates.len() > 1 {
        EscalationSignal::MultipleCandidates
    } else {
        EscalationSignal::None
    };

    Classification {
        kind,
        confidence,
        escalation,
    }
}

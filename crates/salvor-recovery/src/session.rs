//! Single-active-session queue and per-fingerprint recovery marks.
//!
//! # Design
//! - At most one slot is active; later decision-worthy entries wait in FIFO order.
//! - Outcome writes name the fingerprint they target and fail when it is no longer
//!   the active session, since sessions can be replaced across await points.
//! - Each slot owns a completion channel so callers can await the user's answer,
//!   and a cancellation token that aborts flows running on its behalf.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use salvor_torrent_core::{ErrorEnvelope, Fingerprint, TorrentSnapshot};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classifier::Classification;
use crate::error::{RecoveryError, RecoveryResult, fingerprint_of};
use crate::gate::RecoveryAction;
use crate::outcome::{RecoveryOutcome, ResolvedLog};

/// Lifecycle of the active session. Idle is the absence of one.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Recovery is still being attempted.
    AwaitingOutcome,
    /// Recovery completed; the session is about to close.
    Resolved,
    /// The user must decide.
    NeedsDecision,
}

impl SessionState {
    /// Render the state as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingOutcome => "awaiting_outcome",
            Self::Resolved => "resolved",
            Self::NeedsDecision => "needs_decision",
        }
    }

    const fn for_outcome(outcome: &RecoveryOutcome) -> Self {
        match outcome {
            RecoveryOutcome::Resolved { .. } => Self::Resolved,
            RecoveryOutcome::NeedsUserDecision { .. } => Self::NeedsDecision,
            RecoveryOutcome::Blocked { .. } => Self::AwaitingOutcome,
        }
    }
}

/// How a session closed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionResolution {
    /// Recovery completed while the session was open.
    Resolved {
        /// Why the recovery is considered complete.
        log: ResolvedLog,
    },
    /// The user closed the session after deciding.
    Dismissed,
    /// The user cancelled the session.
    Cancelled,
}

/// A decision-worthy recovery waiting for, or holding, the session slot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueEntry {
    /// Torrent snapshot when the entry was built.
    pub torrent: TorrentSnapshot,
    /// Action that produced the outcome.
    pub action: RecoveryAction,
    /// Outcome as produced by the recovery gate.
    pub outcome: RecoveryOutcome,
    /// Classification behind the outcome.
    pub classification: Classification,
    /// Identity key.
    pub fingerprint: Fingerprint,
    /// Whether the outcome requires a user decision.
    pub has_decision: bool,
    /// Creation time.
    pub enqueued_at: DateTime<Utc>,
}

/// Build a queue entry from a blocking outcome and its classification.
///
/// # Errors
///
/// Returns [`RecoveryError::MissingIdentity`] when the torrent has neither id nor hash.
pub fn create_recovery_queue_entry(
    torrent: TorrentSnapshot,
    action: RecoveryAction,
    outcome: RecoveryOutcome,
    classification: Classification,
) -> RecoveryResult<QueueEntry> {
    let fingerprint = fingerprint_of(&torrent)?;
    Ok(QueueEntry::new(
        torrent,
        fingerprint,
        action,
        outcome,
        classification,
    ))
}

impl QueueEntry {
    pub(crate) fn new(
        torrent: TorrentSnapshot,
        fingerprint: Fingerprint,
        action: RecoveryAction,
        outcome: RecoveryOutcome,
        classification: Classification,
    ) -> Self {
        Self {
            has_decision: outcome.is_decision(),
            torrent,
            action,
            outcome,
            classification,
            fingerprint,
            enqueued_at: Utc::now(),
        }
    }
}

/// Where an enqueued entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// Became the active session.
    Activated,
    /// Appended to the pending queue at `position` (0-based).
    Queued {
        /// Index in the pending queue.
        position: usize,
    },
    /// Replaced the existing entry for the same fingerprint in place.
    Updated,
}

/// Result of closing the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Fingerprint of the closed session.
    pub finalized: Fingerprint,
    /// Fingerprint promoted into the slot, if any.
    pub promoted: Option<Fingerprint>,
}

/// Read-only view of the active session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActiveSessionView {
    /// Session identifier, stable while the slot is occupied.
    pub session_id: Uuid,
    /// Lifecycle state.
    pub state: SessionState,
    /// Entry shown to the user.
    pub entry: QueueEntry,
}

/// Read-only view of the whole session queue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct SessionView {
    /// Active session, if any.
    pub active: Option<ActiveSessionView>,
    /// Pending fingerprints in promotion order.
    pub pending: Vec<Fingerprint>,
}

impl SessionView {
    /// Fingerprint of the active session.
    #[must_use]
    pub fn active_fingerprint(&self) -> Option<&Fingerprint> {
        self.active.as_ref().map(|active| &active.entry.fingerprint)
    }
}

type Completion = watch::Sender<Option<SessionResolution>>;

#[derive(Debug)]
struct SessionSlot {
    id: Uuid,
    entry: QueueEntry,
    state: SessionState,
    cancel: CancellationToken,
    completion: Completion,
}

impl SessionSlot {
    fn new(entry: QueueEntry) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            state: SessionState::for_outcome(&entry.outcome),
            entry,
            cancel: CancellationToken::new(),
            completion,
        }
    }

    fn replace_entry(&mut self, entry: QueueEntry) {
        self.state = SessionState::for_outcome(&entry.outcome);
        self.entry = entry;
    }
}

/// The active session slot plus its FIFO of pending entries.
#[derive(Debug, Default)]
pub struct SessionQueue {
    active: Option<SessionSlot>,
    pending: VecDeque<SessionSlot>,
}

impl SessionQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate the entry, queue it, or update the entry already held for its fingerprint.
    pub fn enqueue(&mut self, entry: QueueEntry) -> EnqueueDisposition {
        if let Some(active) = self.active.as_mut()
            && active.entry.fingerprint == entry.fingerprint
        {
            active.replace_entry(entry);
            return EnqueueDisposition::Updated;
        }
        if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|slot| slot.entry.fingerprint == entry.fingerprint)
        {
            slot.replace_entry(entry);
            return EnqueueDisposition::Updated;
        }
        if self.active.is_none() {
            self.active = Some(SessionSlot::new(entry));
            return EnqueueDisposition::Activated;
        }
        self.pending.push_back(SessionSlot::new(entry));
        EnqueueDisposition::Queued {
            position: self.pending.len() - 1,
        }
    }

    /// Update the outcome of the active session in place.
    ///
    /// # Errors
    ///
    /// Fails when there is no active session or it belongs to another fingerprint.
    pub fn set_outcome(
        &mut self,
        fingerprint: &Fingerprint,
        outcome: RecoveryOutcome,
        classification: Option<Classification>,
    ) -> RecoveryResult<()> {
        let operation = "set_recovery_session_outcome";
        let active = self
            .active
            .as_mut()
            .ok_or(RecoveryError::NoActiveSession { operation })?;
        if &active.entry.fingerprint != fingerprint {
            return Err(RecoveryError::SessionMismatch {
                fingerprint: fingerprint.clone(),
                operation,
            });
        }
        active.state = SessionState::for_outcome(&outcome);
        active.entry.has_decision = outcome.is_decision();
        active.entry.outcome = outcome;
        if let Some(classification) = classification {
            active.entry.classification = classification;
        }
        Ok(())
    }

    /// Close the active session and promote the next pending entry.
    pub fn finalize(&mut self, resolution: SessionResolution) -> Option<FinalizeReport> {
        let closed = self.active.take()?;
        closed.completion.send_replace(Some(resolution));
        self.active = self.pending.pop_front();
        Some(FinalizeReport {
            finalized: closed.entry.fingerprint,
            promoted: self
                .active
                .as_ref()
                .map(|slot| slot.entry.fingerprint.clone()),
        })
    }

    /// Close the active session only when it is still the session `id`.
    pub fn finalize_session(
        &mut self,
        id: Uuid,
        resolution: SessionResolution,
    ) -> Option<FinalizeReport> {
        if self.active.as_ref().map(|slot| slot.id) != Some(id) {
            return None;
        }
        self.finalize(resolution)
    }

    /// Fingerprint of the active session.
    #[must_use]
    pub fn active_fingerprint(&self) -> Option<&Fingerprint> {
        self.active.as_ref().map(|slot| &slot.entry.fingerprint)
    }

    /// Identifier of the active session.
    #[must_use]
    pub fn active_session_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|slot| slot.id)
    }

    /// Entry held by the active session.
    #[must_use]
    pub fn active_entry(&self) -> Option<&QueueEntry> {
        self.active.as_ref().map(|slot| &slot.entry)
    }

    /// Whether `fingerprint` holds the active session.
    #[must_use]
    pub fn is_active(&self, fingerprint: &Fingerprint) -> bool {
        self.active_fingerprint() == Some(fingerprint)
    }

    /// Whether `fingerprint` is waiting in the pending queue.
    #[must_use]
    pub fn is_pending(&self, fingerprint: &Fingerprint) -> bool {
        self.pending
            .iter()
            .any(|slot| &slot.entry.fingerprint == fingerprint)
    }

    /// Whether `fingerprint` is active or pending.
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.is_active(fingerprint) || self.is_pending(fingerprint)
    }

    /// Cancellation token of the active session when it belongs to `fingerprint`.
    #[must_use]
    pub fn cancel_token_for(&self, fingerprint: &Fingerprint) -> Option<CancellationToken> {
        self.active
            .as_ref()
            .filter(|slot| &slot.entry.fingerprint == fingerprint)
            .map(|slot| slot.cancel.clone())
    }

    /// Abort flows running on behalf of the active session.
    pub fn cancel_active(&self) {
        if let Some(slot) = self.active.as_ref() {
            slot.cancel.cancel();
        }
    }

    /// Completion receiver for the slot (active or pending) held by `fingerprint`.
    #[must_use]
    pub fn completion_for(
        &self,
        fingerprint: &Fingerprint,
    ) -> Option<watch::Receiver<Option<SessionResolution>>> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .find(|slot| &slot.entry.fingerprint == fingerprint)
            .map(|slot| slot.completion.subscribe())
    }

    /// Number of entries waiting behind the active session.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the queue for observers.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            active: self.active.as_ref().map(|slot| ActiveSessionView {
                session_id: slot.id,
                state: slot.state,
                entry: slot.entry.clone(),
            }),
            pending: self
                .pending
                .iter()
                .map(|slot| slot.entry.fingerprint.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Marks {
    cancelled_against: Option<Option<ErrorEnvelope>>,
    paused_by_user: bool,
    paused_by_system: bool,
    recovering: bool,
}

impl Marks {
    const fn is_clear(&self) -> bool {
        self.cancelled_against.is_none()
            && !self.paused_by_user
            && !self.paused_by_system
            && !self.recovering
    }
}

/// Per-fingerprint flags consulted by the background loop.
#[derive(Debug, Default)]
pub struct RecoveryMarks {
    marks: HashMap<Fingerprint, Marks>,
}

impl RecoveryMarks {
    /// Remember that the user cancelled recovery while the torrent carried `envelope`.
    pub fn mark_cancelled(&mut self, fingerprint: &Fingerprint, envelope: Option<ErrorEnvelope>) {
        self.entry(fingerprint).cancelled_against = Some(envelope);
    }

    /// The user paused the torrent; it must not be resumed silently.
    pub fn mark_paused_by_user(&mut self, fingerprint: &Fingerprint) {
        let marks = self.entry(fingerprint);
        marks.paused_by_user = true;
        marks.paused_by_system = false;
    }

    /// Recovery left the torrent paused after verification.
    pub fn mark_paused_by_system(&mut self, fingerprint: &Fingerprint) {
        let marks = self.entry(fingerprint);
        marks.paused_by_system = true;
        marks.paused_by_user = false;
    }

    /// The torrent resumed; cancel and pause marks no longer apply.
    pub fn mark_resumed(&mut self, fingerprint: &Fingerprint) {
        let marks = self.entry(fingerprint);
        marks.cancelled_against = None;
        marks.paused_by_user = false;
        marks.paused_by_system = false;
        self.prune(fingerprint);
    }

    /// Whether recovery is cancelled for the torrent as it currently fails. A
    /// different envelope than the one cancelled against lifts the cancellation.
    pub fn is_cancelled(
        &mut self,
        fingerprint: &Fingerprint,
        current: Option<&ErrorEnvelope>,
    ) -> bool {
        let Some(marks) = self.marks.get_mut(fingerprint) else {
            return false;
        };
        let Some(cancelled) = marks.cancelled_against.as_ref() else {
            return false;
        };
        if cancelled.as_ref() == current {
            return true;
        }
        marks.cancelled_against = None;
        self.prune(fingerprint);
        false
    }

    /// Whether the user paused the torrent.
    #[must_use]
    pub fn is_paused_by_user(&self, fingerprint: &Fingerprint) -> bool {
        self.marks
            .get(fingerprint)
            .is_some_and(|marks| marks.paused_by_user)
    }

    /// Whether recovery left the torrent paused.
    #[must_use]
    pub fn is_paused_by_system(&self, fingerprint: &Fingerprint) -> bool {
        self.marks
            .get(fingerprint)
            .is_some_and(|marks| marks.paused_by_system)
    }

    /// Toggle the silent-recovery overlay. Returns whether the flag changed.
    pub fn set_recovering(&mut self, fingerprint: &Fingerprint, recovering: bool) -> bool {
        let marks = self.entry(fingerprint);
        let changed = marks.recovering != recovering;
        marks.recovering = recovering;
        self.prune(fingerprint);
        changed
    }

    /// Whether a silent recovery is running for the torrent.
    #[must_use]
    pub fn is_recovering(&self, fingerprint: &Fingerprint) -> bool {
        self.marks
            .get(fingerprint)
            .is_some_and(|marks| marks.recovering)
    }

    /// Keep only marks for which `keep` holds or a silent recovery is running.
    /// Returns how many were dropped.
    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&Fingerprint) -> bool,
    {
        let before = self.marks.len();
        self.marks
            .retain(|fingerprint, marks| marks.recovering || keep(fingerprint));
        before - self.marks.len()
    }

    fn entry(&mut self, fingerprint: &Fingerprint) -> &mut Marks {
        self.marks.entry(fingerprint.clone()).or_default()
    }

    fn prune(&mut self, fingerprint: &Fingerprint) {
        if self.marks.get(fingerprint).is_some_and(Marks::is_clear) {
            self.marks.remove(fingerprint);
        }
    }
}

//! Recovery engine facade owning all shared recovery state.
//!
//! # Design
//! - One mutex guards the probe cache, overrides, retry schedules, session queue and
//!   marks; it is never held across an await.
//! - Session changes fan out through a `watch` channel and the event bus.
//! - Flow, gate and background behaviour live in their own modules as further
//!   `impl RecoveryEngine` blocks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use salvor_config::RecoveryPolicyEffective;
use salvor_events::{Event, EventBus};
use salvor_telemetry::Metrics;
use salvor_torrent_core::{
    EngineClient, ErrorClass, Fingerprint, ProbeResult, RecoveryRefresh, TorrentSnapshot,
};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult, fingerprint_of};
use crate::gate::SharedGate;
use crate::outcome::{DecisionPolicy, RecoveryOutcome};
use crate::probe_cache::ProbeCache;
use crate::scheduler::{BackoffPolicy, RetrySchedule, RetryScheduler};
use crate::session::{
    EnqueueDisposition, FinalizeReport, QueueEntry, RecoveryMarks, SessionQueue,
    SessionResolution, SessionView,
};

/// Collaborators required to build a [`RecoveryEngine`].
pub struct RecoveryEngineDeps {
    /// Engine client capability.
    pub client: Arc<dyn EngineClient>,
    /// Host hook invoked after resolutions.
    pub refresh: Option<Arc<dyn RecoveryRefresh>>,
    /// Effective recovery policy.
    pub policy: RecoveryPolicyEffective,
    /// Feedback and notification channel.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
}

/// Cloneable handle to the recovery orchestration engine.
#[derive(Clone)]
pub struct RecoveryEngine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) client: Arc<dyn EngineClient>,
    pub(crate) refresh: Option<Arc<dyn RecoveryRefresh>>,
    pub(crate) policy: RecoveryPolicyEffective,
    pub(crate) decisions: DecisionPolicy,
    pub(crate) events: EventBus,
    pub(crate) metrics: Metrics,
    pub(crate) background_wake: Notify,
    state: Mutex<EngineState>,
    session_tx: watch::Sender<SessionView>,
}

pub(crate) struct EngineState {
    pub(crate) probes: ProbeCache,
    pub(crate) overrides: HashMap<Fingerprint, ErrorClass>,
    pub(crate) scheduler: RetryScheduler,
    pub(crate) sessions: SessionQueue,
    pub(crate) marks: RecoveryMarks,
    pub(crate) inflight: HashMap<Fingerprint, SharedGate>,
}

impl EngineState {
    /// Drop bookkeeping for fingerprints that are neither listed nor held by a
    /// session or an in-flight gate. Returns how many entries were dropped.
    pub(crate) fn forget_unlisted(&mut self, listed: &HashSet<Fingerprint>) -> usize {
        let Self {
            probes,
            overrides,
            scheduler,
            sessions,
            marks,
            inflight,
        } = self;
        let keep = |fingerprint: &Fingerprint| {
            listed.contains(fingerprint)
                || sessions.contains(fingerprint)
                || inflight.contains_key(fingerprint)
        };
        let overrides_before = overrides.len();
        overrides.retain(|fingerprint, _| keep(fingerprint));
        (overrides_before - overrides.len())
            + probes.retain(keep)
            + scheduler.retain(keep)
            + marks.retain(keep)
    }
}

impl RecoveryEngine {
    /// Build an engine from its collaborators.
    #[must_use]
    pub fn new(deps: RecoveryEngineDeps) -> Self {
        let RecoveryEngineDeps {
            client,
            refresh,
            policy,
            events,
            metrics,
        } = deps;
        let state = EngineState {
            probes: ProbeCache::new(policy.probe_ttl),
            overrides: HashMap::new(),
            scheduler: RetryScheduler::new(BackoffPolicy {
                base: policy.backoff_base,
                cap: policy.backoff_cap,
            }),
            sessions: SessionQueue::new(),
            marks: RecoveryMarks::default(),
            inflight: HashMap::new(),
        };
        let (session_tx, _) = watch::channel(SessionView::default());
        Self {
            inner: Arc::new(EngineInner {
                client,
                refresh,
                decisions: DecisionPolicy::excluding(policy.non_decision_reasons.iter().copied()),
                policy,
                events,
                metrics,
                background_wake: Notify::new(),
                state: Mutex::new(state),
                session_tx,
            }),
        }
    }

    /// Effective policy the engine runs with.
    #[must_use]
    pub fn policy(&self) -> &RecoveryPolicyEffective {
        &self.inner.policy
    }

    /// Event bus carrying feedback and session notifications.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Metrics registry updated by the engine.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Receiver that observes every session queue change.
    #[must_use]
    pub fn subscribe_session(&self) -> watch::Receiver<SessionView> {
        self.inner.session_tx.subscribe()
    }

    /// Current session queue snapshot.
    #[must_use]
    pub fn session_view(&self) -> SessionView {
        self.lock_state().sessions.view()
    }

    /// Activate, queue or update a session entry.
    pub fn enqueue_recovery_entry(&self, entry: QueueEntry) -> EnqueueDisposition {
        let fingerprint = entry.fingerprint.clone();
        let disposition = self.lock_state().sessions.enqueue(entry);
        info!(
            fingerprint = %fingerprint,
            disposition = ?disposition,
            "recovery session entry enqueued"
        );
        self.publish_session();
        disposition
    }

    /// Replace the outcome of the active session.
    ///
    /// # Errors
    ///
    /// Fails when no session is active or `fingerprint` is not the active one.
    pub fn set_recovery_session_outcome(
        &self,
        fingerprint: &Fingerprint,
        outcome: RecoveryOutcome,
    ) -> RecoveryResult<()> {
        self.lock_state()
            .sessions
            .set_outcome(fingerprint, outcome, None)?;
        self.publish_session();
        Ok(())
    }

    /// Close the active session now and promote the next pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NoActiveSession`] when nothing is active.
    pub fn finalize_recovery(&self, resolution: SessionResolution) -> RecoveryResult<FinalizeReport> {
        let report = self
            .lock_state()
            .sessions
            .finalize(resolution)
            .ok_or(RecoveryError::NoActiveSession {
                operation: "finalize_recovery",
            })?;
        self.after_finalize(&report, resolution);
        Ok(report)
    }

    /// Close the active session after `delay`, unless it was replaced meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NoActiveSession`] when nothing is active.
    pub fn schedule_recovery_finalize(
        &self,
        resolution: SessionResolution,
        delay: Duration,
    ) -> RecoveryResult<JoinHandle<Option<FinalizeReport>>> {
        let id = self.lock_state().sessions.active_session_id().ok_or(
            RecoveryError::NoActiveSession {
                operation: "schedule_recovery_finalize",
            },
        )?;
        Ok(self.spawn_finalize(id, resolution, delay))
    }

    /// Cancel the active session: abort its flows, suppress further recovery for the
    /// torrent and promote the next entry.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NoActiveSession`] when nothing is active.
    pub fn cancel_active_session(&self) -> RecoveryResult<Fingerprint> {
        let report = {
            let mut state = self.lock_state();
            let entry = state
                .sessions
                .active_entry()
                .ok_or(RecoveryError::NoActiveSession {
                    operation: "cancel_active_session",
                })?;
            let fingerprint = entry.fingerprint.clone();
            let envelope = entry.torrent.error.clone();
            state.sessions.cancel_active();
            state.marks.mark_cancelled(&fingerprint, envelope);
            state.scheduler.clear_schedule(&fingerprint);
            state.sessions.finalize(SessionResolution::Cancelled)
        };
        let report = report.ok_or(RecoveryError::NoActiveSession {
            operation: "cancel_active_session",
        })?;
        self.after_finalize(&report, SessionResolution::Cancelled);
        Ok(report.finalized)
    }

    /// Suppress silent recovery for the torrent until it is resumed or its envelope changes.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::MissingIdentity`] when the torrent has no identity.
    pub fn mark_recovery_cancelled(&self, torrent: &TorrentSnapshot) -> RecoveryResult<()> {
        let fingerprint = fingerprint_of(torrent)?;
        let mut state = self.lock_state();
        state
            .marks
            .mark_cancelled(&fingerprint, torrent.error.clone());
        state.scheduler.clear_schedule(&fingerprint);
        Ok(())
    }

    /// The user paused the torrent; background recovery leaves it alone.
    pub fn mark_recovery_paused_by_user(&self, fingerprint: &Fingerprint) {
        self.lock_state().marks.mark_paused_by_user(fingerprint);
    }

    /// Recovery left the torrent paused after verification; it stays eligible.
    pub fn mark_recovery_paused_by_system(&self, fingerprint: &Fingerprint) {
        self.lock_state().marks.mark_paused_by_system(fingerprint);
    }

    /// The user resumed the torrent; cancellation and pause marks are lifted.
    pub fn mark_recovery_resumed(&self, fingerprint: &Fingerprint) {
        self.lock_state().marks.mark_resumed(fingerprint);
    }

    /// Whether a silent recovery is running for the torrent.
    #[must_use]
    pub fn is_recovering(&self, fingerprint: &Fingerprint) -> bool {
        self.lock_state().marks.is_recovering(fingerprint)
    }

    /// Whether background recovery is currently suppressed for the torrent.
    #[must_use]
    pub fn is_recovery_cancelled(&self, torrent: &TorrentSnapshot) -> bool {
        fingerprint_of(torrent).is_ok_and(|fingerprint| {
            self.lock_state()
                .marks
                .is_cancelled(&fingerprint, torrent.error.as_ref())
        })
    }

    /// Retry bookkeeping for the torrent.
    #[must_use]
    pub fn retry_schedule(&self, fingerprint: &Fingerprint) -> Option<RetrySchedule> {
        self.lock_state().scheduler.schedule(fingerprint)
    }

    /// Class recorded when a probe contradicted the torrent's envelope.
    #[must_use]
    pub fn classification_override(&self, fingerprint: &Fingerprint) -> Option<ErrorClass> {
        self.lock_state().overrides.get(fingerprint).copied()
    }

    /// Probe cached for the torrent, if still fresh.
    #[must_use]
    pub fn cached_probe(&self, fingerprint: &Fingerprint) -> Option<ProbeResult> {
        self.lock_state()
            .probes
            .get_fresh(fingerprint, Instant::now())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("recovery state mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn clear_override(&self, fingerprint: &Fingerprint) {
        self.lock_state().overrides.remove(fingerprint);
    }

    pub(crate) fn set_recovering(&self, fingerprint: &Fingerprint, recovering: bool) {
        let changed = self
            .lock_state()
            .marks
            .set_recovering(fingerprint, recovering);
        if changed {
            self.inner.events.publish(Event::RecoveringChanged {
                fingerprint: fingerprint.clone(),
                recovering,
            });
        }
    }

    pub(crate) fn spawn_finalize(
        &self,
        id: Uuid,
        resolution: SessionResolution,
        delay: Duration,
    ) -> JoinHandle<Option<FinalizeReport>> {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let report = engine
                .lock_state()
                .sessions
                .finalize_session(id, resolution);
            if let Some(report) = report.as_ref() {
                engine.after_finalize(report, resolution);
            }
            report
        })
    }

    pub(crate) fn publish_session(&self) {
        let view = self.lock_state().sessions.view();
        let active = view.active_fingerprint().cloned();
        let pending = view.pending.len();
        self.inner.metrics.set_sessions_active(active.is_some());
        self.inner.metrics.set_queue_depth(pending);
        self.inner.session_tx.send_replace(view);
        self.inner
            .events
            .publish(Event::SessionChanged { active, pending });
    }

    fn after_finalize(&self, report: &FinalizeReport, resolution: SessionResolution) {
        info!(
            fingerprint = %report.finalized,
            resolution = ?resolution,
            promoted = ?report.promoted.as_ref().map(Fingerprint::as_str),
            "recovery session finalized"
        );
        self.publish_session();
    }
}

//! Recovery gate: the single entry point deciding what a recovery request does.
//!
//! # Design
//! - Concurrent non-recheck requests for one fingerprint share a single flow run;
//!   a recheck always runs its own.
//! - Requests for the fingerprint holding the active session join that session
//!   instead of starting a new flow.
//! - Blocked flows are upgraded to decisions here and nowhere else; a short grace
//!   delay applies before low-confidence escalation of user resumes.
//! - Background requests honour cancellation marks. A user resume is the explicit
//!   resume that lifts them.

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use salvor_events::{Event, FeedbackLevel};
use salvor_torrent_core::{BlockReason, Fingerprint, TorrentSnapshot};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::Classification;
use crate::engine::RecoveryEngine;
use crate::error::{RecoveryError, RecoveryResult, fingerprint_of};
use crate::flow::{FlowOptions, FlowResult};
use crate::outcome::{RecoveryOutcome, ResolvedLog, upgrade_outcome_for_session};
use crate::session::{QueueEntry, SessionResolution};

/// Auto-dismiss delay attached to recovery toasts.
pub const FEEDBACK_AUTO_DISMISS_MS: u64 = 6_000;

pub(crate) type SharedGate = Shared<BoxFuture<'static, GateOutcome>>;

/// User-facing recovery actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Resume the torrent, verifying first when needed.
    Resume,
    /// Verify data on disk and leave the torrent paused.
    Recheck,
    /// Resume and fetch whatever is missing.
    DownloadMissing,
    /// Relocation; handled by the location flow, not by recovery.
    SetLocation,
}

impl RecoveryAction {
    /// Render the action as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Recheck => "recheck",
            Self::DownloadMissing => "download_missing",
            Self::SetLocation => "set_location",
        }
    }

    const fn escalates_after_grace(self) -> bool {
        matches!(self, Self::Resume | Self::DownloadMissing)
    }
}

/// Who asked for the recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    /// An explicit user action.
    User,
    /// The background loop.
    Background,
}

impl RequestOrigin {
    /// Render the origin as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Background => "background",
        }
    }
}

/// Per-request switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Whether the flow may recreate a missing directory.
    pub allow_directory_creation: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            allow_directory_creation: true,
        }
    }
}

/// A request to recover a torrent.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    /// Torrent snapshot the request refers to.
    pub torrent: TorrentSnapshot,
    /// Requested action.
    pub action: RecoveryAction,
    /// Per-request switches.
    pub options: RequestOptions,
    /// Who asked.
    pub origin: RequestOrigin,
}

impl RecoveryRequest {
    /// Request issued by a user action.
    #[must_use]
    pub fn user(torrent: TorrentSnapshot, action: RecoveryAction) -> Self {
        Self {
            torrent,
            action,
            options: RequestOptions::default(),
            origin: RequestOrigin::User,
        }
    }

    /// Silent resume issued by the background loop.
    #[must_use]
    pub fn background(torrent: TorrentSnapshot) -> Self {
        Self {
            torrent,
            action: RecoveryAction::Resume,
            options: RequestOptions::default(),
            origin: RequestOrigin::Background,
        }
    }
}

/// Why the gate declined to run a flow.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotRequiredReason {
    /// Relocation is handled elsewhere.
    LocationChange,
    /// The torrent's error class is not a storage failure.
    NonActionable,
    /// Recovery was cancelled for this torrent.
    Cancelled,
    /// The torrent stopped failing on its own.
    NoLongerFailing,
    /// An attempt for the torrent is already running.
    AlreadyInFlight,
}

impl NotRequiredReason {
    /// Render the reason as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocationChange => "location_change",
            Self::NonActionable => "non_actionable",
            Self::Cancelled => "cancelled",
            Self::NoLongerFailing => "no_longer_failing",
            Self::AlreadyInFlight => "already_in_flight",
        }
    }
}

/// What the gate did with a handled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandledOutcome {
    /// The torrent recovered.
    Resolved {
        /// Why the recovery is considered complete.
        log: ResolvedLog,
    },
    /// Recovery stopped without involving the user beyond a toast.
    Blocked {
        /// Machine-readable reason.
        reason: BlockReason,
        /// Optional diagnostic.
        message: Option<String>,
    },
    /// A decision session was surfaced or queued.
    DecisionSurfaced {
        /// Reason shown to the user.
        reason: BlockReason,
    },
}

/// Disposition of a recovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// The gate handled the request.
    Handled(HandledOutcome),
    /// Recovery does not apply.
    NotRequired {
        /// Why the gate declined.
        reason: NotRequiredReason,
    },
    /// The torrent is not failing; the caller proceeds with its plain action.
    Continue,
    /// The owning session was cancelled.
    Cancelled,
}

impl GateOutcome {
    /// Label used for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Handled(HandledOutcome::Resolved { .. }) => "resolved",
            Self::Handled(HandledOutcome::Blocked { .. }) => "blocked",
            Self::Handled(HandledOutcome::DecisionSurfaced { .. }) => "decision_surfaced",
            Self::NotRequired { .. } => "not_required",
            Self::Continue => "continue",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_outcome(outcome: RecoveryOutcome) -> Self {
        match outcome {
            RecoveryOutcome::Resolved { log } => Self::Handled(HandledOutcome::Resolved { log }),
            RecoveryOutcome::Blocked { reason, message } => {
                Self::Handled(HandledOutcome::Blocked { reason, message })
            }
            RecoveryOutcome::NeedsUserDecision { reason, .. } => {
                Self::Handled(HandledOutcome::DecisionSurfaced { reason })
            }
        }
    }
}

type Completion = watch::Receiver<Option<SessionResolution>>;

enum Route {
    Run(SharedGate),
    Join(SharedGate),
    Session {
        completion: Option<Completion>,
        reason: BlockReason,
    },
}

impl RecoveryEngine {
    /// Decide and carry out what a recovery request does.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::MissingIdentity`] when the torrent has neither id nor hash.
    pub async fn request_recovery(&self, request: RecoveryRequest) -> RecoveryResult<GateOutcome> {
        let outcome = self.route_request(request).await?;
        self.inner.metrics.inc_gate_outcome(outcome.label());
        Ok(outcome)
    }

    async fn route_request(&self, request: RecoveryRequest) -> RecoveryResult<GateOutcome> {
        if request.action == RecoveryAction::SetLocation {
            return Ok(GateOutcome::NotRequired {
                reason: NotRequiredReason::LocationChange,
            });
        }
        let fingerprint = fingerprint_of(&request.torrent)?;
        let Some(envelope) = request.torrent.error.as_ref() else {
            return Ok(GateOutcome::Continue);
        };
        if !envelope.error_class.is_actionable() {
            self.clear_override(&fingerprint);
            return Ok(GateOutcome::NotRequired {
                reason: NotRequiredReason::NonActionable,
            });
        }

        let origin = request.origin;
        {
            let mut state = self.lock_state();
            match origin {
                RequestOrigin::Background => {
                    if state.marks.is_cancelled(&fingerprint, Some(envelope)) {
                        debug!(fingerprint = %fingerprint, "background recovery suppressed");
                        return Ok(GateOutcome::NotRequired {
                            reason: NotRequiredReason::Cancelled,
                        });
                    }
                }
                RequestOrigin::User if request.action.escalates_after_grace() => {
                    state.marks.mark_resumed(&fingerprint);
                }
                RequestOrigin::User => {}
            }
        }

        let outcome = match self.route(request, &fingerprint) {
            Route::Run(shared) | Route::Join(shared) => shared.await,
            Route::Session { completion, reason } => {
                return Ok(match (origin, completion) {
                    (RequestOrigin::User, Some(completion)) => {
                        await_resolution(completion, reason).await
                    }
                    _ => GateOutcome::Handled(HandledOutcome::DecisionSurfaced { reason }),
                });
            }
        };

        if origin == RequestOrigin::User
            && let GateOutcome::Handled(HandledOutcome::DecisionSurfaced { reason }) = outcome
        {
            let completion = self.lock_state().sessions.completion_for(&fingerprint);
            if let Some(completion) = completion {
                return Ok(await_resolution(completion, reason).await);
            }
        }
        Ok(outcome)
    }

    fn route(&self, request: RecoveryRequest, fingerprint: &Fingerprint) -> Route {
        let mut state = self.lock_state();
        let dedup = request.action != RecoveryAction::Recheck;
        if dedup {
            if let Some(existing) = state.inflight.get(fingerprint) {
                debug!(fingerprint = %fingerprint, "joining in-flight recovery");
                return Route::Join(existing.clone());
            }
            if let Some(entry) = state
                .sessions
                .active_entry()
                .filter(|entry| &entry.fingerprint == fingerprint)
            {
                let reason = entry.outcome.reason().unwrap_or(BlockReason::Unknown);
                return Route::Session {
                    completion: state.sessions.completion_for(fingerprint),
                    reason,
                };
            }
        }

        let engine = self.clone();
        let key = fingerprint.clone();
        let started = Instant::now();
        let shared = async move {
            let outcome = engine.run_gate(request, &key, started).await;
            if dedup {
                engine.lock_state().inflight.remove(&key);
            }
            outcome
        }
        .boxed()
        .shared();
        if dedup {
            state.inflight.insert(fingerprint.clone(), shared.clone());
        }
        Route::Run(shared)
    }

    async fn run_gate(
        &self,
        request: RecoveryRequest,
        fingerprint: &Fingerprint,
        started: Instant,
    ) -> GateOutcome {
        let RecoveryRequest {
            torrent,
            action,
            options,
            origin,
        } = request;
        let cancel = self.lock_state().sessions.cancel_token_for(fingerprint);
        let flow_options = FlowOptions::for_action(
            action,
            self.inner.policy.auto_create_directories && options.allow_directory_creation,
        );

        let outcome = match self.run_flow(&torrent, flow_options, cancel.as_ref()).await {
            None => GateOutcome::NotRequired {
                reason: NotRequiredReason::NonActionable,
            },
            Some(FlowResult::Cancelled) => GateOutcome::Cancelled,
            Some(FlowResult::Resolved { log }) => {
                self.complete_resolution(&torrent, fingerprint, log).await;
                GateOutcome::Handled(HandledOutcome::Resolved { log })
            }
            Some(FlowResult::NeedsModal {
                blocking,
                classification,
            }) => {
                let outcome =
                    upgrade_outcome_for_session(blocking, &classification, &self.inner.decisions);
                let decision = outcome.is_decision();
                if origin == RequestOrigin::User
                    && action.escalates_after_grace()
                    && !classification.has_immediate_certainty()
                {
                    tokio::time::sleep_until(started + self.inner.policy.escalation_grace).await;
                }
                let disposed =
                    self.dispose(torrent, fingerprint, action, origin, outcome, classification);
                self.check_decision_surfaced(fingerprint, decision);
                disposed
            }
        };
        info!(
            fingerprint = %fingerprint,
            action = action.as_str(),
            origin = origin.as_str(),
            outcome = outcome.label(),
            "recovery gate disposition"
        );
        outcome
    }

    fn dispose(
        &self,
        torrent: TorrentSnapshot,
        fingerprint: &Fingerprint,
        action: RecoveryAction,
        origin: RequestOrigin,
        outcome: RecoveryOutcome,
        classification: Classification,
    ) -> GateOutcome {
        match outcome {
            resolved @ RecoveryOutcome::Resolved { .. } => GateOutcome::from_outcome(resolved),
            RecoveryOutcome::Blocked { reason, message } => {
                let updated = self.lock_state().sessions.set_outcome(
                    fingerprint,
                    RecoveryOutcome::Blocked {
                        reason,
                        message: message.clone(),
                    },
                    Some(classification),
                );
                if updated.is_ok() {
                    self.publish_session();
                }
                if origin == RequestOrigin::User {
                    self.publish_feedback(
                        FeedbackLevel::Warning,
                        format!("recovery.blocked.{}", reason.as_str()),
                        fingerprint,
                    );
                }
                self.inner.events.publish(Event::RecoveryBlocked {
                    fingerprint: fingerprint.clone(),
                    reason,
                });
                GateOutcome::Handled(HandledOutcome::Blocked { reason, message })
            }
            decision @ RecoveryOutcome::NeedsUserDecision { .. } => {
                let reason = decision.reason().unwrap_or(BlockReason::Unknown);
                let entry = QueueEntry::new(
                    torrent,
                    fingerprint.clone(),
                    action,
                    decision,
                    classification,
                );
                let disposition = self.lock_state().sessions.enqueue(entry);
                info!(
                    fingerprint = %fingerprint,
                    reason = reason.as_str(),
                    disposition = ?disposition,
                    "recovery decision surfaced"
                );
                self.publish_session();
                GateOutcome::Handled(HandledOutcome::DecisionSurfaced { reason })
            }
        }
    }

    /// Apply the side effects of a successful flow.
    pub(crate) async fn complete_resolution(
        &self,
        torrent: &TorrentSnapshot,
        fingerprint: &Fingerprint,
        log: ResolvedLog,
    ) {
        let session = {
            let mut state = self.lock_state();
            if log.keeps_paused() {
                state.marks.mark_paused_by_system(fingerprint);
            } else {
                state.marks.mark_resumed(fingerprint);
            }
            state.probes.invalidate(fingerprint);
            state.scheduler.clear_schedule(fingerprint);
            state.overrides.remove(fingerprint);
            match state
                .sessions
                .set_outcome(fingerprint, RecoveryOutcome::Resolved { log }, None)
            {
                Ok(()) => state.sessions.active_session_id(),
                Err(_) => None,
            }
        };
        if let Some(id) = session {
            self.publish_session();
            self.spawn_finalize(
                id,
                SessionResolution::Resolved { log },
                self.inner.policy.finalize_display,
            );
        }

        self.inner.events.publish(Event::RecoveryResolved {
            fingerprint: fingerprint.clone(),
            log: log.as_str().to_string(),
        });
        self.publish_feedback(
            FeedbackLevel::Success,
            format!("recovery.resolved.{}", log.as_str()),
            fingerprint,
        );
        if let Some(refresh) = self.inner.refresh.as_ref()
            && let Err(err) = refresh.refresh_after_recovery(torrent).await
        {
            warn!(fingerprint = %fingerprint, error = %err, "post-recovery refresh failed");
        }
    }

    /// Upgrade a blocked outcome and record it on the active session.
    ///
    /// # Errors
    ///
    /// Fails when `fingerprint` no longer holds the active session.
    pub fn refine_session_outcome(
        &self,
        fingerprint: &Fingerprint,
        blocking: RecoveryOutcome,
        classification: Classification,
    ) -> RecoveryResult<RecoveryOutcome> {
        let outcome = upgrade_outcome_for_session(blocking, &classification, &self.inner.decisions);
        self.record_session_outcome(fingerprint, &outcome, classification)?;
        Ok(outcome)
    }

    fn record_session_outcome(
        &self,
        fingerprint: &Fingerprint,
        outcome: &RecoveryOutcome,
        classification: Classification,
    ) -> RecoveryResult<()> {
        self.lock_state()
            .sessions
            .set_outcome(fingerprint, outcome.clone(), Some(classification))?;
        self.publish_session();
        Ok(())
    }

    /// Re-run recovery for the active session immediately, bypassing any cooldown.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NoActiveSession`] when nothing is active.
    pub async fn retry_active_session(&self) -> RecoveryResult<GateOutcome> {
        let (torrent, fingerprint, action) = {
            let state = self.lock_state();
            let entry = state
                .sessions
                .active_entry()
                .ok_or(RecoveryError::NoActiveSession {
                    operation: "retry_active_session",
                })?;
            (entry.torrent.clone(), entry.fingerprint.clone(), entry.action)
        };
        if !self.lock_state().scheduler.begin_immediate(&fingerprint) {
            return Ok(GateOutcome::NotRequired {
                reason: NotRequiredReason::AlreadyInFlight,
            });
        }

        let torrent = match self.inner.client.get_details(&torrent).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => torrent,
            Err(err) => {
                warn!(
                    fingerprint = %fingerprint,
                    error = %err,
                    "torrent details unavailable; retrying with the session snapshot"
                );
                torrent
            }
        };
        let outcome = if torrent.error.is_none() {
            self.lock_state().marks.mark_resumed(&fingerprint);
            self.finalize_if_active(&fingerprint, SessionResolution::Dismissed);
            GateOutcome::NotRequired {
                reason: NotRequiredReason::NoLongerFailing,
            }
        } else {
            self.retry_session(&torrent, &fingerprint, action, true).await
        };
        self.lock_state().scheduler.finish_attempt(&fingerprint);
        self.inner.metrics.inc_gate_outcome(outcome.label());
        Ok(outcome)
    }

    /// Run a flow on behalf of the active session and record its result there.
    pub(crate) async fn retry_session(
        &self,
        torrent: &TorrentSnapshot,
        fingerprint: &Fingerprint,
        action: RecoveryAction,
        fresh_probe: bool,
    ) -> GateOutcome {
        let cancel = self.lock_state().sessions.cancel_token_for(fingerprint);
        let options = FlowOptions {
            fresh_probe,
            ..FlowOptions::for_action(action, self.inner.policy.auto_create_directories)
        };
        match self.run_flow(torrent, options, cancel.as_ref()).await {
            None => GateOutcome::NotRequired {
                reason: NotRequiredReason::NonActionable,
            },
            Some(FlowResult::Cancelled) => GateOutcome::Cancelled,
            Some(FlowResult::Resolved { log }) => {
                self.complete_resolution(torrent, fingerprint, log).await;
                GateOutcome::Handled(HandledOutcome::Resolved { log })
            }
            Some(FlowResult::NeedsModal {
                blocking,
                classification,
            }) => {
                let outcome =
                    upgrade_outcome_for_session(blocking, &classification, &self.inner.decisions);
                if let Err(err) = self.record_session_outcome(fingerprint, &outcome, classification)
                {
                    debug!(
                        fingerprint = %fingerprint,
                        error = %err,
                        outcome = outcome.kind(),
                        "session closed during retry; outcome not recorded"
                    );
                }
                self.check_decision_surfaced(fingerprint, outcome.is_decision());
                GateOutcome::from_outcome(outcome)
            }
        }
    }

    fn finalize_if_active(&self, fingerprint: &Fingerprint, resolution: SessionResolution) {
        let closed = {
            let mut state = self.lock_state();
            if state.sessions.is_active(fingerprint) {
                state.sessions.finalize(resolution)
            } else {
                None
            }
        };
        if let Some(report) = closed {
            info!(
                fingerprint = %report.finalized,
                resolution = ?resolution,
                "recovery session finalized"
            );
            self.publish_session();
        }
    }

    fn check_decision_surfaced(&self, fingerprint: &Fingerprint, decision: bool) {
        if !decision || !self.inner.policy.development_checks {
            return;
        }
        let surfaced = self.lock_state().sessions.contains(fingerprint);
        if !surfaced {
            error!(
                fingerprint = %fingerprint,
                "decision-worthy outcome produced no recovery session"
            );
            self.inner.metrics.inc_consistency_violation();
        }
    }

    fn publish_feedback(&self, level: FeedbackLevel, key: String, fingerprint: &Fingerprint) {
        self.inner.events.publish(Event::Feedback {
            level,
            key,
            fingerprint: Some(fingerprint.clone()),
            auto_dismiss_ms: Some(FEEDBACK_AUTO_DISMISS_MS),
        });
    }
}

async fn await_resolution(mut completion: Completion, reason: BlockReason) -> GateOutcome {
    let resolution = match completion.wait_for(Option::is_some).await {
        Ok(value) => *value,
        Err(_) => None,
    };
    match resolution {
        Some(SessionResolution::Resolved { log }) => {
            GateOutcome::Handled(HandledOutcome::Resolved { log })
        }
        Some(SessionResolution::Dismissed) => {
            GateOutcome::Handled(HandledOutcome::DecisionSurfaced { reason })
        }
        Some(SessionResolution::Cancelled) | None => GateOutcome::Cancelled,
    }
}

//! Background recovery: periodic and on-demand passes over failing torrents.
//!
//! # Design
//! - A pass examines every failing, actionable torrent concurrently.
//! - The torrent holding the active session is retried on its own schedule through
//!   the flow executor; every other torrent goes through the recovery gate with a
//!   background origin.
//! - The retry scheduler guarantees one attempt per fingerprint and enforces backoff.
//! - On-demand passes are debounced and coalesced with the periodic timer.
//! - A pass over the inspector's list forgets state for torrents no longer listed.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::join_all;
use salvor_torrent_core::{Fingerprint, TorrentInspector, TorrentSnapshot};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::RecoveryEngine;
use crate::error::fingerprint_of;
use crate::gate::{GateOutcome, HandledOutcome, RecoveryAction, RecoveryRequest};
use crate::scheduler::AttemptGate;

/// Tally of one background pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BackgroundReport {
    /// Failing, actionable torrents examined.
    pub examined: usize,
    /// Silent recoveries started through the gate.
    pub attempted: usize,
    /// Retries run for the active session.
    pub session_retries: usize,
    /// Attempts that resolved.
    pub resolved: usize,
    /// Torrents skipped for cancellation, pause, queueing, cooldown or an attempt in flight.
    pub skipped: usize,
}

enum TickOutcome {
    Ineligible,
    Skipped(&'static str),
    Attempted { resolved: bool },
    SessionRetried { resolved: bool },
}

fn is_background_candidate(torrent: &TorrentSnapshot) -> bool {
    torrent.state.is_recovery_candidate()
        && torrent
            .error_class()
            .is_some_and(|class| class.is_actionable())
}

const fn needs_retry(outcome: &GateOutcome) -> bool {
    matches!(
        outcome,
        GateOutcome::Handled(
            HandledOutcome::Blocked { .. } | HandledOutcome::DecisionSurfaced { .. }
        )
    )
}

impl RecoveryEngine {
    /// Run one pass over the torrents listed by `inspector`.
    ///
    /// # Errors
    ///
    /// Fails when the inspector cannot list torrents.
    pub async fn run_background_pass(
        &self,
        inspector: &dyn TorrentInspector,
    ) -> anyhow::Result<BackgroundReport> {
        let torrents = inspector.list().await?;
        self.forget_unlisted(&torrents);
        Ok(self.background_tick(torrents).await)
    }

    /// Drop recovery state for torrents the host no longer lists. Returns how many
    /// entries were dropped.
    pub fn forget_unlisted(&self, torrents: &[TorrentSnapshot]) -> usize {
        let listed: HashSet<Fingerprint> = torrents
            .iter()
            .filter_map(|torrent| fingerprint_of(torrent).ok())
            .collect();
        let forgotten = self.lock_state().forget_unlisted(&listed);
        if forgotten > 0 {
            debug!(forgotten, "recovery state dropped for unlisted torrents");
        }
        forgotten
    }

    /// Run one pass over an already listed set of torrents.
    pub async fn background_tick(&self, torrents: Vec<TorrentSnapshot>) -> BackgroundReport {
        let outcomes = join_all(
            torrents
                .into_iter()
                .map(|torrent| self.process_candidate(torrent)),
        )
        .await;

        let mut report = BackgroundReport::default();
        for outcome in outcomes {
            match outcome {
                TickOutcome::Ineligible => continue,
                TickOutcome::Skipped(reason) => {
                    debug!(reason, "background recovery skipped a torrent");
                    report.skipped += 1;
                }
                TickOutcome::Attempted { resolved } => {
                    report.attempted += 1;
                    report.resolved += usize::from(resolved);
                }
                TickOutcome::SessionRetried { resolved } => {
                    report.session_retries += 1;
                    report.resolved += usize::from(resolved);
                }
            }
            report.examined += 1;
        }
        report
    }

    /// Ask the background loop for an extra pass soon. Bursts are coalesced.
    pub fn request_background_pass(&self) {
        self.inner.background_wake.notify_one();
    }

    /// Re-probe failing torrents whose cached probe expired. Returns how many were refreshed.
    pub async fn refresh_stale_probes(&self, torrents: &[TorrentSnapshot]) -> usize {
        let now = Instant::now();
        let stale: Vec<(&TorrentSnapshot, Fingerprint)> = {
            let state = self.lock_state();
            torrents
                .iter()
                .filter(|torrent| is_background_candidate(torrent))
                .filter_map(|torrent| fingerprint_of(torrent).ok().map(|fp| (torrent, fp)))
                .filter(|(_, fingerprint)| state.probes.is_stale(fingerprint, now))
                .collect()
        };

        let client = &self.inner.client;
        let results = join_all(stale.into_iter().map(|(torrent, fingerprint)| async move {
            let result = client.probe(torrent).await;
            (fingerprint, result)
        }))
        .await;

        let mut refreshed = 0;
        let mut state = self.lock_state();
        for (fingerprint, result) in results {
            match result {
                Ok(probe) => {
                    state.probes.insert(fingerprint, probe, Instant::now());
                    refreshed += 1;
                }
                Err(err) => warn!(fingerprint = %fingerprint, error = %err, "probe refresh failed"),
            }
        }
        refreshed
    }

    /// Spawn the periodic recovery loop and the probe refresh loop. Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn_background_loops(
        &self,
        inspector: Arc<dyn TorrentInspector>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_recovery_loop(Arc::clone(&inspector), shutdown.clone()),
            self.spawn_probe_refresh_loop(inspector, shutdown),
        ]
    }

    fn spawn_recovery_loop(
        &self,
        inspector: Arc<dyn TorrentInspector>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let policy = engine.policy().clone();
            let mut ticker = interval(policy.background_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms =
                    u64::try_from(policy.background_interval.as_millis()).unwrap_or(u64::MAX),
                "background recovery loop started"
            );
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    () = engine.inner.background_wake.notified() => {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = sleep(policy.background_debounce) => {}
                        }
                        // Requests that arrived during the debounce ride along.
                        let _ = engine.inner.background_wake.notified().now_or_never();
                        ticker.reset();
                    }
                }
                match engine.run_background_pass(inspector.as_ref()).await {
                    Ok(report) => debug!(
                        examined = report.examined,
                        attempted = report.attempted,
                        session_retries = report.session_retries,
                        resolved = report.resolved,
                        skipped = report.skipped,
                        "background recovery pass finished"
                    ),
                    Err(err) => warn!(error = %err, "background recovery pass skipped"),
                }
            }
            info!("background recovery loop stopped");
        })
    }

    fn spawn_probe_refresh_loop(
        &self,
        inspector: Arc<dyn TorrentInspector>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(engine.policy().probe_refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match inspector.list().await {
                    Ok(torrents) => {
                        let refreshed = engine.refresh_stale_probes(&torrents).await;
                        debug!(refreshed, "probe refresh pass finished");
                    }
                    Err(err) => warn!(error = %err, "probe refresh skipped"),
                }
            }
            debug!("probe refresh loop stopped");
        })
    }

    async fn process_candidate(&self, torrent: TorrentSnapshot) -> TickOutcome {
        if !is_background_candidate(&torrent) {
            return TickOutcome::Ineligible;
        }
        let Ok(fingerprint) = fingerprint_of(&torrent) else {
            return TickOutcome::Ineligible;
        };
        let active_action = self
            .lock_state()
            .sessions
            .active_entry()
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.action);
        match active_action {
            Some(action) => self.retry_active(torrent, fingerprint, action).await,
            None => self.attempt_silently(torrent, fingerprint).await,
        }
    }

    async fn retry_active(
        &self,
        torrent: TorrentSnapshot,
        fingerprint: Fingerprint,
        action: RecoveryAction,
    ) -> TickOutcome {
        {
            let mut state = self.lock_state();
            if state.marks.is_cancelled(&fingerprint, torrent.error.as_ref()) {
                return TickOutcome::Skipped("cancelled");
            }
            let gate = state.scheduler.try_begin_attempt(&fingerprint, Instant::now());
            if gate != AttemptGate::Started {
                return TickOutcome::Skipped(gate.as_str());
            }
        }

        let outcome = self
            .retry_session(&torrent, &fingerprint, action, false)
            .await;
        self.settle_attempt(&fingerprint, &outcome);
        TickOutcome::SessionRetried {
            resolved: matches!(outcome, GateOutcome::Handled(HandledOutcome::Resolved { .. })),
        }
    }

    async fn attempt_silently(
        &self,
        torrent: TorrentSnapshot,
        fingerprint: Fingerprint,
    ) -> TickOutcome {
        {
            let mut state = self.lock_state();
            if state.marks.is_cancelled(&fingerprint, torrent.error.as_ref()) {
                return TickOutcome::Skipped("cancelled");
            }
            if state.marks.is_paused_by_user(&fingerprint) {
                return TickOutcome::Skipped("paused_by_user");
            }
            if state.sessions.is_pending(&fingerprint) {
                return TickOutcome::Skipped("queued");
            }
            let gate = state.scheduler.try_begin_attempt(&fingerprint, Instant::now());
            if gate != AttemptGate::Started {
                return TickOutcome::Skipped(gate.as_str());
            }
        }

        self.set_recovering(&fingerprint, true);
        let outcome = match self.request_recovery(RecoveryRequest::background(torrent)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(fingerprint = %fingerprint, error = %err, "background recovery failed");
                GateOutcome::Cancelled
            }
        };
        self.settle_attempt(&fingerprint, &outcome);
        self.set_recovering(&fingerprint, false);
        TickOutcome::Attempted {
            resolved: matches!(outcome, GateOutcome::Handled(HandledOutcome::Resolved { .. })),
        }
    }

    fn settle_attempt(&self, fingerprint: &Fingerprint, outcome: &GateOutcome) {
        let mut state = self.lock_state();
        if needs_retry(outcome) {
            let schedule = state.scheduler.schedule_retry(fingerprint, Instant::now());
            self.inner.metrics.inc_retry_scheduled();
            debug!(
                fingerprint = %fingerprint,
                attempt = schedule.attempt_count,
                outcome = outcome.label(),
                "recovery retry scheduled"
            );
        }
        state.scheduler.finish_attempt(fingerprint);
    }
}

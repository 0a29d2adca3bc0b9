//! Flow executor: probe, classify, repair and verify a single failing torrent.
//!
//! # Design
//! - Every engine call is raced against the owning session's cancellation token.
//! - Transport failures degrade to a blocked outcome derived from the error class and
//!   are logged; they never escape as errors.
//! - Probe answers are memoised in the probe cache; a probe that contradicts the
//!   envelope records a classification override.

use std::future::Future;

use salvor_torrent_core::{
    BlockReason, Capabilities, EngineOutcome, ErrorClass, ErrorEnvelope, Fingerprint, ProbeResult,
    ProbeStatus, TorrentSnapshot, VerifyOptions,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{Classification, ClassificationKind, classify};
use crate::engine::RecoveryEngine;
use crate::error::fingerprint_of;
use crate::gate::RecoveryAction;
use crate::outcome::{RecoveryOutcome, ResolvedLog};

/// Knobs for one flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOptions {
    /// Options forwarded to the engine's verify-or-resume call.
    pub verify: VerifyOptions,
    /// Ignore any cached probe.
    pub fresh_probe: bool,
    /// Whether a missing directory may be recreated.
    pub allow_directory_creation: bool,
}

impl FlowOptions {
    /// Options matching a user-facing recovery action.
    #[must_use]
    pub const fn for_action(action: RecoveryAction, allow_directory_creation: bool) -> Self {
        let (resume_after_verify, download_missing, fresh_probe) = match action {
            RecoveryAction::Resume | RecoveryAction::SetLocation => (true, false, false),
            RecoveryAction::DownloadMissing => (true, true, false),
            RecoveryAction::Recheck => (false, false, true),
        };
        Self {
            verify: VerifyOptions {
                resume_after_verify,
                download_missing,
            },
            fresh_probe,
            allow_directory_creation,
        }
    }
}

/// Result of a flow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowResult {
    /// The torrent recovered.
    Resolved {
        /// Why the recovery is considered complete.
        log: ResolvedLog,
    },
    /// The flow stopped on a block that may need the user.
    NeedsModal {
        /// Blocking outcome, always `Blocked`.
        blocking: RecoveryOutcome,
        /// Classification of the effective envelope.
        classification: Classification,
    },
    /// The owning session was cancelled mid-flow.
    Cancelled,
}

impl FlowResult {
    /// Label used for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::NeedsModal { .. } => "needs_modal",
            Self::Cancelled => "cancelled",
        }
    }

    fn blocked(reason: BlockReason, message: Option<String>, classification: Classification) -> Self {
        Self::NeedsModal {
            blocking: RecoveryOutcome::Blocked { reason, message },
            classification,
        }
    }
}

enum Step {
    Proceed,
    Stop(FlowResult),
}

/// Await `future` unless `cancel` fires first.
pub(crate) async fn cancellable<F>(cancel: Option<&CancellationToken>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match cancel {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => None,
            output = future => Some(output),
        },
        None => Some(future.await),
    }
}

impl RecoveryEngine {
    /// Run the recovery flow for a failing torrent.
    ///
    /// Returns `None` when the torrent carries no envelope, no identity, or a
    /// non-actionable class.
    pub async fn run_flow(
        &self,
        torrent: &TorrentSnapshot,
        options: FlowOptions,
        cancel: Option<&CancellationToken>,
    ) -> Option<FlowResult> {
        let envelope = torrent.error.as_ref()?;
        let fingerprint = match fingerprint_of(torrent) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                warn!(error = %err, name = ?torrent.name, "recovery flow skipped");
                return None;
            }
        };
        if !envelope.error_class.is_actionable() {
            self.clear_override(&fingerprint);
            return None;
        }

        let result = self
            .execute_flow(torrent, &fingerprint, envelope, options, cancel)
            .await;
        self.inner.metrics.inc_flow_run(result.label());
        debug!(
            fingerprint = %fingerprint,
            result = result.label(),
            "recovery flow finished"
        );
        Some(result)
    }

    async fn execute_flow(
        &self,
        torrent: &TorrentSnapshot,
        fingerprint: &Fingerprint,
        envelope: &ErrorEnvelope,
        options: FlowOptions,
        cancel: Option<&CancellationToken>,
    ) -> FlowResult {
        let client = &self.inner.client;
        let capabilities = client.capabilities();
        let path_hint = torrent.path_hint();

        let probe = match self
            .probe_for(torrent, fingerprint, options.fresh_probe, cancel)
            .await
        {
            Some(Ok(probe)) => probe,
            Some(Err(err)) => {
                warn!(fingerprint = %fingerprint, error = %err, "engine probe failed");
                return FlowResult::blocked(
                    BlockReason::from_error_class(envelope.error_class),
                    Some(err.to_string()),
                    classify(envelope, path_hint, &capabilities),
                );
            }
            None => return FlowResult::Cancelled,
        };

        let effective = ErrorEnvelope {
            error_class: self.reconcile_probe(fingerprint, envelope.error_class, &probe),
            ..envelope.clone()
        };
        let classification = classify(&effective, path_hint, &capabilities);
        let data_present = probe.status == ProbeStatus::Healthy;

        if classification.kind == ClassificationKind::DiskFull {
            let step = self
                .check_free_space(path_hint, &probe, &capabilities, classification, cancel)
                .await;
            if let Step::Stop(result) = step {
                return result;
            }
        }

        if !data_present {
            let step = match classification.kind {
                ClassificationKind::VolumeLoss => Step::Stop(FlowResult::blocked(
                    BlockReason::VolumeMissing,
                    None,
                    classification,
                )),
                ClassificationKind::PathLoss => {
                    self.restore_directory(
                        fingerprint,
                        path_hint,
                        options,
                        &capabilities,
                        classification,
                        cancel,
                    )
                    .await
                }
                _ => Step::Proceed,
            };
            if let Step::Stop(result) = step {
                return result;
            }
        }

        match cancellable(cancel, client.verify_or_resume(torrent, options.verify)).await {
            None => FlowResult::Cancelled,
            Some(Ok(EngineOutcome::Resumed { verified_complete })) => FlowResult::Resolved {
                log: if verified_complete {
                    ResolvedLog::AllVerifiedResuming
                } else {
                    ResolvedLog::DownloadResumed
                },
            },
            Some(Ok(EngineOutcome::Paused)) => FlowResult::Resolved {
                log: ResolvedLog::VerifyCompletedPaused,
            },
            Some(Ok(EngineOutcome::Blocked { reason, message })) => {
                FlowResult::blocked(reason, message, classification)
            }
            Some(Err(err)) => {
                warn!(
                    fingerprint = %fingerprint,
                    error = %err,
                    "engine verify failed; degrading to blocked"
                );
                FlowResult::blocked(
                    BlockReason::from_error_class(effective.error_class),
                    Some(err.to_string()),
                    classification,
                )
            }
        }
    }

    async fn probe_for(
        &self,
        torrent: &TorrentSnapshot,
        fingerprint: &Fingerprint,
        fresh: bool,
        cancel: Option<&CancellationToken>,
    ) -> Option<anyhow::Result<ProbeResult>> {
        if !fresh {
            let cached = self
                .lock_state()
                .probes
                .get_fresh(fingerprint, Instant::now());
            if let Some(probe) = cached {
                return Some(Ok(probe));
            }
        }
        let result = cancellable(cancel, self.inner.client.probe(torrent)).await?;
        if let Ok(probe) = result.as_ref() {
            self.lock_state()
                .probes
                .insert(fingerprint.clone(), probe.clone(), Instant::now());
        }
        Some(result)
    }

    fn reconcile_probe(
        &self,
        fingerprint: &Fingerprint,
        envelope_class: ErrorClass,
        probe: &ProbeResult,
    ) -> ErrorClass {
        let mut state = self.lock_state();
        match probe.status.implied_class() {
            Some(probed) if probed != envelope_class && envelope_class != ErrorClass::DiskFull => {
                if state.overrides.insert(fingerprint.clone(), probed) != Some(probed) {
                    debug!(
                        fingerprint = %fingerprint,
                        envelope = envelope_class.as_str(),
                        probed = probed.as_str(),
                        "probe overrides envelope classification"
                    );
                }
                probed
            }
            Some(_) => {
                state.overrides.remove(fingerprint);
                envelope_class
            }
            None if probe.status == ProbeStatus::Healthy => {
                state.overrides.remove(fingerprint);
                envelope_class
            }
            None => state
                .overrides
                .get(fingerprint)
                .copied()
                .unwrap_or(envelope_class),
        }
    }

    async fn check_free_space(
        &self,
        path_hint: Option<&str>,
        probe: &ProbeResult,
        capabilities: &Capabilities,
        classification: Classification,
        cancel: Option<&CancellationToken>,
    ) -> Step {
        let unsupported = Step::Stop(FlowResult::blocked(
            BlockReason::FreeSpaceCheckUnsupported,
            None,
            classification,
        ));
        if !capabilities.can_check_free_space {
            return unsupported;
        }
        let Some(path) = path_hint else {
            return unsupported;
        };
        match cancellable(cancel, self.inner.client.free_space(path)).await {
            None => Step::Stop(FlowResult::Cancelled),
            Some(Ok(available)) if available > probe.missing_bytes.unwrap_or(0) => Step::Proceed,
            Some(Ok(available)) => {
                debug!(path, available, needed = ?probe.missing_bytes, "destination still full");
                Step::Stop(FlowResult::blocked(
                    BlockReason::DiskFull,
                    None,
                    classification,
                ))
            }
            Some(Err(err)) => {
                warn!(path, error = %err, "free-space query failed");
                Step::Stop(FlowResult::blocked(
                    BlockReason::DiskFull,
                    Some(err.to_string()),
                    classification,
                ))
            }
        }
    }

    async fn restore_directory(
        &self,
        fingerprint: &Fingerprint,
        path_hint: Option<&str>,
        options: FlowOptions,
        capabilities: &Capabilities,
        classification: Classification,
        cancel: Option<&CancellationToken>,
    ) -> Step {
        let path = path_hint.filter(|_| {
            options.allow_directory_creation && capabilities.allows_local_directory_creation()
        });
        let Some(path) = path else {
            return Step::Stop(FlowResult::blocked(
                BlockReason::PathMissing,
                None,
                classification,
            ));
        };
        match cancellable(cancel, self.inner.client.create_directory(path)).await {
            None => Step::Stop(FlowResult::Cancelled),
            Some(Ok(())) => {
                info!(fingerprint = %fingerprint, path, "recreated missing download directory");
                self.lock_state().probes.invalidate(fingerprint);
                Step::Proceed
            }
            Some(Err(err)) => {
                warn!(fingerprint = %fingerprint, path, error = %err, "directory creation failed");
                Step::Stop(FlowResult::blocked(
                    BlockReason::DirectoryCreateFailed,
                    Some(err.to_string()),
                    classification,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::RecoveryEngineDeps;
    use salvor_config::RecoveryPolicyEffective;
    use salvor_events::EventBus;
    use salvor_telemetry::Metrics;
    use salvor_test_support::fixtures::{failing_torrent, fingerprint, healthy_torrent};
    use salvor_test_support::mocks::{ScriptedEngine, VerifyScript};

    fn engine_with(client: Arc<ScriptedEngine>) -> RecoveryEngine {
        RecoveryEngine::new(RecoveryEngineDeps {
            client,
            refresh: None,
            policy: RecoveryPolicyEffective::default(),
            events: EventBus::new(),
            metrics: Metrics::new().expect("metrics"),
        })
    }

    fn resume() -> FlowOptions {
        FlowOptions::for_action(RecoveryAction::Resume, true)
    }

    #[tokio::test]
    async fn healthy_or_non_actionable_torrents_have_no_flow() {
        let client = Arc::new(ScriptedEngine::local());
        let engine = engine_with(client.clone());
        assert!(engine.run_flow(&healthy_torrent(1), resume(), None).await.is_none());
        let tracker = failing_torrent(2, ErrorClass::TrackerError);
        assert!(engine.run_flow(&tracker, resume(), None).await.is_none());
        assert_eq!(client.total_verify_calls(), 0);
    }

    #[tokio::test]
    async fn missing_directory_is_recreated_before_resuming() {
        let client = Arc::new(ScriptedEngine::local());
        client.set_probe(&fingerprint(3), ProbeStatus::PathMissing);
        let engine = engine_with(client.clone());

        let result = engine
            .run_flow(&failing_torrent(3, ErrorClass::PathMissing), resume(), None)
            .await;
        assert_eq!(
            result,
            Some(FlowResult::Resolved {
                log: ResolvedLog::DownloadResumed
            })
        );
        assert_eq!(client.created_directories(), vec!["/data/downloads/3".to_string()]);
        assert!(engine.cached_probe(&fingerprint(3)).is_none());
    }

    #[tokio::test]
    async fn remote_engines_block_on_missing_paths() {
        let client = Arc::new(ScriptedEngine::new(Capabilities::remote()));
        client.set_probe(&fingerprint(4), ProbeStatus::PathMissing);
        let engine = engine_with(client.clone());

        let result = engine
            .run_flow(&failing_torrent(4, ErrorClass::PathMissing), resume(), None)
            .await;
        assert!(matches!(
            result,
            Some(FlowResult::NeedsModal {
                blocking: RecoveryOutcome::Blocked {
                    reason: BlockReason::PathMissing,
                    ..
                },
                ..
            })
        ));
        assert_eq!(client.total_verify_calls(), 0);
    }

    #[tokio::test]
    async fn disk_full_needs_free_space_support() {
        let client = Arc::new(ScriptedEngine::new(Capabilities::remote()));
        let engine = engine_with(client);
        let result = engine
            .run_flow(&failing_torrent(5, ErrorClass::DiskFull), resume(), None)
            .await;
        assert!(matches!(
            result,
            Some(FlowResult::NeedsModal {
                blocking: RecoveryOutcome::Blocked {
                    reason: BlockReason::FreeSpaceCheckUnsupported,
                    ..
                },
                ..
            })
        ));

        let local = Arc::new(ScriptedEngine::local());
        local.set_free_space(10 * 1024 * 1024);
        let engine = engine_with(local.clone());
        let result = engine
            .run_flow(&failing_torrent(6, ErrorClass::DiskFull), resume(), None)
            .await;
        assert_eq!(
            result,
            Some(FlowResult::Resolved {
                log: ResolvedLog::DownloadResumed
            })
        );
    }

    #[tokio::test]
    async fn probe_contradictions_are_recorded_and_cleared() {
        let client = Arc::new(ScriptedEngine::local());
        client.set_probe(&fingerprint(7), ProbeStatus::VolumeMissing);
        let engine = engine_with(client.clone());
        let torrent = failing_torrent(7, ErrorClass::DataMissing);

        let result = engine.run_flow(&torrent, resume(), None).await;
        assert!(matches!(
            result,
            Some(FlowResult::NeedsModal {
                blocking: RecoveryOutcome::Blocked {
                    reason: BlockReason::VolumeMissing,
                    ..
                },
                ..
            })
        ));
        assert_eq!(
            engine.classification_override(&fingerprint(7)),
            Some(ErrorClass::VolumeMissing)
        );

        client.set_probe(&fingerprint(7), ProbeStatus::Healthy);
        let fresh = FlowOptions::for_action(RecoveryAction::Recheck, true);
        let result = engine.run_flow(&torrent, fresh, None).await;
        assert_eq!(
            result,
            Some(FlowResult::Resolved {
                log: ResolvedLog::DownloadResumed
            })
        );
        assert_eq!(engine.classification_override(&fingerprint(7)), None);
        assert_eq!(client.probe_calls(&fingerprint(7)), 2);
    }

    #[tokio::test]
    async fn transport_errors_degrade_to_blocked() {
        let client = Arc::new(ScriptedEngine::local());
        client.push_verify(&fingerprint(8), VerifyScript::TransportError);
        let engine = engine_with(client);

        let result = engine
            .run_flow(&failing_torrent(8, ErrorClass::DataMissing), resume(), None)
            .await;
        let Some(FlowResult::NeedsModal {
            blocking: RecoveryOutcome::Blocked { reason, message },
            ..
        }) = result
        else {
            panic!("expected a blocked flow, got {result:?}");
        };
        assert_eq!(reason, BlockReason::DataMissing);
        assert!(message.is_some_and(|text| text.contains("connection reset")));
        assert_eq!(engine.metrics().flow_runs("needs_modal"), 1);
    }

    #[tokio::test]
    async fn verify_outcomes_map_to_resolution_logs() {
        let client = Arc::new(ScriptedEngine::local());
        client.push_verify(
            &fingerprint(9),
            VerifyScript::Outcome(EngineOutcome::Resumed {
                verified_complete: true,
            }),
        );
        client.push_verify(&fingerprint(9), VerifyScript::Outcome(EngineOutcome::Paused));
        let engine = engine_with(client.clone());
        let torrent = failing_torrent(9, ErrorClass::DataMissing);

        assert_eq!(
            engine.run_flow(&torrent, resume(), None).await,
            Some(FlowResult::Resolved {
                log: ResolvedLog::AllVerifiedResuming
            })
        );
        let recheck = FlowOptions::for_action(RecoveryAction::Recheck, true);
        assert_eq!(
            engine.run_flow(&torrent, recheck, None).await,
            Some(FlowResult::Resolved {
                log: ResolvedLog::VerifyCompletedPaused
            })
        );
        assert!(!client.verify_options()[1].resume_after_verify);
    }

    #[tokio::test]
    async fn cancelled_sessions_abort_the_flow() {
        let client = Arc::new(ScriptedEngine::local());
        let engine = engine_with(client.clone());
        let token = CancellationToken::new();
        token.cancel();

        let result = engine
            .run_flow(
                &failing_torrent(10, ErrorClass::DataMissing),
                resume(),
                Some(&token),
            )
            .await;
        assert_eq!(result, Some(FlowResult::Cancelled));
        assert_eq!(client.total_verify_calls(), 0);
    }
}

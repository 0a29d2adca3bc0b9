//! End-to-end recovery scenarios against the scripted engine.

use std::sync::Arc;
use std::time::Duration;

use salvor_config::RecoveryPolicyEffective;
use salvor_events::{Event, EventBus, FeedbackLevel};
use salvor_recovery::{
    GateOutcome, HandledOutcome, RecoveryAction, RecoveryEngine, RecoveryEngineDeps,
    RecoveryOutcome, RecoveryRequest, ResolvedLog, SessionResolution, SessionState,
};
use salvor_telemetry::Metrics;
use salvor_test_support::fixtures::{failing_torrent, failing_torrent_in, fingerprint};
use salvor_test_support::mocks::{ScriptedEngine, VerifyScript};
use salvor_torrent_core::{
    BlockReason, Capabilities, EngineOutcome, ErrorClass, ProbeStatus, RecoveryState,
    TorrentSnapshot,
};
use tokio::time::Instant;

fn engine_with(client: &Arc<ScriptedEngine>, policy: RecoveryPolicyEffective) -> RecoveryEngine {
    RecoveryEngine::new(RecoveryEngineDeps {
        client: client.clone(),
        refresh: None,
        policy,
        events: EventBus::new(),
        metrics: Metrics::new().expect("metrics"),
    })
}

fn engine(client: &Arc<ScriptedEngine>) -> RecoveryEngine {
    engine_with(client, RecoveryPolicyEffective::default())
}

fn blocked_verify(reason: BlockReason) -> VerifyScript {
    VerifyScript::Outcome(EngineOutcome::Blocked {
        reason,
        message: None,
    })
}

fn volume_lost(id: i64, state: RecoveryState) -> (Arc<ScriptedEngine>, TorrentSnapshot) {
    let client = Arc::new(ScriptedEngine::new(Capabilities::remote()));
    client.set_probe(&fingerprint(id), ProbeStatus::VolumeMissing);
    (
        client,
        failing_torrent_in(id, ErrorClass::VolumeMissing, state),
    )
}

fn feedback_keys(engine: &RecoveryEngine) -> Vec<(FeedbackLevel, String)> {
    let mut stream = engine.events().subscribe(Some(0));
    let mut keys = Vec::new();
    while let Some(envelope) = stream.try_next() {
        if let Event::Feedback { level, key, .. } = envelope.event {
            keys.push((level, key));
        }
    }
    keys
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_flow_run() {
    let client = Arc::new(ScriptedEngine::local());
    client.set_latency(Duration::from_millis(50));
    let engine = engine(&client);
    let torrent = failing_torrent(1, ErrorClass::DataMissing);

    let (first, second) = tokio::join!(
        engine.request_recovery(RecoveryRequest::user(torrent.clone(), RecoveryAction::Resume)),
        engine.request_recovery(RecoveryRequest::user(
            torrent.clone(),
            RecoveryAction::DownloadMissing
        )),
    );
    let resolved = GateOutcome::Handled(HandledOutcome::Resolved {
        log: ResolvedLog::DownloadResumed,
    });
    assert_eq!(first, Ok(resolved.clone()));
    assert_eq!(second, Ok(resolved));
    assert_eq!(client.verify_calls(&fingerprint(1)), 1);
    assert_eq!(client.probe_calls(&fingerprint(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn rechecks_always_run_their_own_flow() {
    let client = Arc::new(ScriptedEngine::local());
    client.set_latency(Duration::from_millis(50));
    let engine = engine(&client);
    let torrent = failing_torrent(2, ErrorClass::DataMissing);

    let (resume, recheck) = tokio::join!(
        engine.request_recovery(RecoveryRequest::user(torrent.clone(), RecoveryAction::Resume)),
        engine.request_recovery(RecoveryRequest::user(torrent.clone(), RecoveryAction::Recheck)),
    );
    assert!(resume.is_ok() && recheck.is_ok());
    assert_eq!(client.verify_calls(&fingerprint(2)), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_local_directory_is_recreated_and_resumed() {
    let client = Arc::new(ScriptedEngine::local());
    client.set_probe(&fingerprint(3), ProbeStatus::PathMissing);
    let engine = engine(&client);

    let outcome = engine
        .request_recovery(RecoveryRequest::user(
            failing_torrent(3, ErrorClass::PathMissing),
            RecoveryAction::Resume,
        ))
        .await;
    assert_eq!(
        outcome,
        Ok(GateOutcome::Handled(HandledOutcome::Resolved {
            log: ResolvedLog::DownloadResumed
        }))
    );
    assert_eq!(client.created_directories(), vec!["/data/downloads/3".to_string()]);
    assert!(engine.session_view().active.is_none());
    assert_eq!(
        feedback_keys(&engine),
        vec![(
            FeedbackLevel::Success,
            "recovery.resolved.download_resumed".to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn uncertain_volume_loss_waits_out_the_grace_and_stays_blocked() {
    let (client, torrent) = volume_lost(4, RecoveryState::Idle);
    let engine = engine(&client);
    let started = Instant::now();

    let outcome = engine
        .request_recovery(RecoveryRequest::user(torrent, RecoveryAction::Resume))
        .await;
    assert!(matches!(
        outcome,
        Ok(GateOutcome::Handled(HandledOutcome::Blocked {
            reason: BlockReason::VolumeMissing,
            ..
        }))
    ));
    assert!(started.elapsed() >= engine.policy().escalation_grace);
    assert!(engine.session_view().active.is_none());
    assert_eq!(
        feedback_keys(&engine),
        vec![(
            FeedbackLevel::Warning,
            "recovery.blocked.volume_missing".to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn conflicts_surface_a_decision_immediately() {
    let (client, torrent) = volume_lost(5, RecoveryState::Conflict);
    let engine = engine(&client);
    let mut sessions = engine.subscribe_session();
    let started = Instant::now();

    let pending = tokio::spawn({
        let engine = engine.clone();
        let torrent = torrent.clone();
        async move {
            engine
                .request_recovery(RecoveryRequest::user(torrent, RecoveryAction::Resume))
                .await
        }
    });

    let view = sessions
        .wait_for(|view| view.active.is_some())
        .await
        .expect("session published")
        .clone();
    assert!(started.elapsed() < engine.policy().escalation_grace);
    let active = view.active.expect("active session");
    assert_eq!(active.state, SessionState::NeedsDecision);
    assert_eq!(active.entry.fingerprint, fingerprint(5));
    assert!(active.entry.has_decision);
    assert!(matches!(
        active.entry.outcome,
        RecoveryOutcome::NeedsUserDecision {
            reason: BlockReason::VolumeMissing,
            ..
        }
    ));

    // A second click on the same torrent joins the open session.
    let joined = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .request_recovery(RecoveryRequest::user(torrent, RecoveryAction::Resume))
                .await
        }
    });
    tokio::task::yield_now().await;

    engine
        .finalize_recovery(SessionResolution::Dismissed)
        .expect("active session");
    let decision = Ok(GateOutcome::Handled(HandledOutcome::DecisionSurfaced {
        reason: BlockReason::VolumeMissing,
    }));
    assert_eq!(pending.await.expect("joined"), decision);
    assert_eq!(joined.await.expect("joined"), decision);
    assert_eq!(client.probe_calls(&fingerprint(5)), 1);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_failures_queue_behind_the_first_session() {
    let client = Arc::new(ScriptedEngine::local());
    for id in [6, 7] {
        client.always_verify(&fingerprint(id), blocked_verify(BlockReason::DataMissing));
    }
    let engine = engine(&client);

    let report = engine
        .background_tick(vec![
            failing_torrent(6, ErrorClass::DataMissing),
            failing_torrent(7, ErrorClass::DataMissing),
        ])
        .await;
    assert_eq!(report.attempted, 2);

    let view = engine.session_view();
    assert_eq!(view.active_fingerprint(), Some(&fingerprint(6)));
    assert_eq!(view.pending, vec![fingerprint(7)]);
    assert_eq!(engine.metrics().snapshot().queue_depth, 1);

    let report = engine
        .finalize_recovery(SessionResolution::Dismissed)
        .expect("active session");
    assert_eq!(report.promoted, Some(fingerprint(7)));
    let view = engine.session_view();
    assert_eq!(view.active_fingerprint(), Some(&fingerprint(7)));
    assert!(view.pending.is_empty());
    assert_eq!(engine.metrics().snapshot().consistency_violations_total, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_back_off_up_to_the_cap() {
    let (client, torrent) = volume_lost(8, RecoveryState::Idle);
    let policy = RecoveryPolicyEffective {
        backoff_base: Duration::from_secs(1),
        backoff_cap: Duration::from_secs(8),
        probe_ttl: Duration::from_millis(500),
        ..RecoveryPolicyEffective::default()
    };
    let engine = engine_with(&client, policy);

    let mut gaps = Vec::new();
    for _ in 0..5 {
        let report = engine.background_tick(vec![torrent.clone()]).await;
        assert_eq!(report.attempted, 1);
        let schedule = engine.retry_schedule(&fingerprint(8)).expect("scheduled");
        let gap = schedule.next_retry_at.expect("cooldown") - Instant::now();
        gaps.push(gap);
        tokio::time::advance(gap).await;
    }

    let schedule = engine.retry_schedule(&fingerprint(8)).expect("scheduled");
    assert_eq!(schedule.attempt_count, 5);
    assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(8)));
    assert_eq!(gaps.last(), Some(&Duration::from_secs(8)));

    client.set_probe(&fingerprint(8), ProbeStatus::Healthy);
    tokio::time::advance(Duration::from_secs(1)).await;
    let report = engine.background_tick(vec![torrent]).await;
    assert_eq!(report.resolved, 1);
    assert!(engine.retry_schedule(&fingerprint(8)).is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_sessions_stop_background_attempts() {
    let client = Arc::new(ScriptedEngine::local());
    client.always_verify(&fingerprint(9), blocked_verify(BlockReason::DataMissing));
    let engine = engine(&client);
    let torrent = failing_torrent(9, ErrorClass::DataMissing);

    engine.background_tick(vec![torrent.clone()]).await;
    assert_eq!(engine.session_view().active_fingerprint(), Some(&fingerprint(9)));
    assert_eq!(engine.cancel_active_session(), Ok(fingerprint(9)));
    let attempts = client.verify_calls(&fingerprint(9));

    for _ in 0..5 {
        tokio::time::advance(engine.policy().backoff_cap).await;
        let report = engine.background_tick(vec![torrent.clone()]).await;
        assert_eq!(report.skipped, 1);
    }
    assert_eq!(client.verify_calls(&fingerprint(9)), attempts);

    engine.mark_recovery_resumed(&fingerprint(9));
    let report = engine.background_tick(vec![torrent]).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(client.verify_calls(&fingerprint(9)), attempts + 1);
}

#[tokio::test(start_paused = true)]
async fn background_retries_resolve_the_active_session() {
    let client = Arc::new(ScriptedEngine::local());
    client.push_verify(&fingerprint(10), blocked_verify(BlockReason::DataMissing));
    let engine = engine(&client);
    let torrent = failing_torrent(10, ErrorClass::DataMissing);

    engine.background_tick(vec![torrent.clone()]).await;
    assert_eq!(
        engine.session_view().active_fingerprint(),
        Some(&fingerprint(10))
    );

    let cooling = engine.background_tick(vec![torrent.clone()]).await;
    assert_eq!(cooling.skipped, 1);

    tokio::time::advance(engine.policy().backoff_base).await;
    let report = engine.background_tick(vec![torrent]).await;
    assert_eq!(report.session_retries, 1);
    assert_eq!(report.resolved, 1);
    let view = engine.session_view();
    assert_eq!(
        view.active.map(|active| active.state),
        Some(SessionState::Resolved)
    );

    tokio::time::sleep(engine.policy().finalize_display + Duration::from_millis(10)).await;
    assert!(engine.session_view().active.is_none());
}

#[tokio::test(start_paused = true)]
async fn manual_retry_bypasses_the_cooldown() {
    let client = Arc::new(ScriptedEngine::local());
    client.push_verify(&fingerprint(11), blocked_verify(BlockReason::DataMissing));
    let engine = engine(&client);
    let torrent = failing_torrent(11, ErrorClass::DataMissing);
    engine.background_tick(vec![torrent]).await;

    let outcome = engine.retry_active_session().await;
    assert_eq!(
        outcome,
        Ok(GateOutcome::Handled(HandledOutcome::Resolved {
            log: ResolvedLog::DownloadResumed
        }))
    );
    assert!(engine.retry_schedule(&fingerprint(11)).is_none());
}

#[tokio::test(start_paused = true)]
async fn manual_retry_closes_sessions_that_recovered_elsewhere() {
    let client = Arc::new(ScriptedEngine::local());
    client.push_verify(&fingerprint(12), blocked_verify(BlockReason::DataMissing));
    let engine = engine(&client);
    let mut torrent = failing_torrent(12, ErrorClass::DataMissing);
    engine.background_tick(vec![torrent.clone()]).await;

    torrent.error = None;
    client.set_details(torrent);
    let outcome = engine.retry_active_session().await;
    assert!(matches!(
        outcome,
        Ok(GateOutcome::NotRequired { .. })
    ));
    assert!(engine.session_view().active.is_none());
    assert_eq!(client.verify_calls(&fingerprint(12)), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_retries_count_even_when_the_session_closes_mid_flight() {
    let client = Arc::new(ScriptedEngine::local());
    client.always_verify(&fingerprint(20), blocked_verify(BlockReason::DataMissing));
    let policy = RecoveryPolicyEffective {
        development_checks: true,
        ..RecoveryPolicyEffective::default()
    };
    let engine = engine_with(&client, policy);
    let torrent = failing_torrent(20, ErrorClass::DataMissing);

    engine.background_tick(vec![torrent.clone()]).await;
    assert_eq!(
        engine.session_view().active_fingerprint(),
        Some(&fingerprint(20))
    );
    let attempts = |engine: &RecoveryEngine| {
        engine
            .retry_schedule(&fingerprint(20))
            .map(|schedule| schedule.attempt_count)
    };
    assert_eq!(attempts(&engine), Some(1));

    tokio::time::advance(engine.policy().backoff_base).await;
    client.set_latency(Duration::from_millis(100));
    let tick = tokio::spawn({
        let engine = engine.clone();
        async move { engine.background_tick(vec![torrent]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .finalize_recovery(SessionResolution::Dismissed)
        .expect("active session");

    let report = tick.await.expect("tick joins");
    assert_eq!(report.session_retries, 1);
    assert_eq!(attempts(&engine), Some(2));
    assert_eq!(engine.metrics().snapshot().consistency_violations_total, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_session_aborts_an_in_flight_retry() {
    let client = Arc::new(ScriptedEngine::local());
    client.push_verify(&fingerprint(21), blocked_verify(BlockReason::DataMissing));
    let engine = engine(&client);
    let torrent = failing_torrent(21, ErrorClass::DataMissing);
    engine.background_tick(vec![torrent.clone()]).await;
    assert_eq!(
        engine.session_view().active_fingerprint(),
        Some(&fingerprint(21))
    );

    client.set_latency(Duration::from_millis(100));
    let retry = tokio::spawn({
        let engine = engine.clone();
        async move { engine.retry_active_session().await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.verify_calls(&fingerprint(21)), 2);
    assert_eq!(engine.cancel_active_session(), Ok(fingerprint(21)));

    assert_eq!(retry.await.expect("retry joins"), Ok(GateOutcome::Cancelled));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(
        feedback_keys(&engine)
            .iter()
            .all(|(level, _)| *level != FeedbackLevel::Success)
    );
    assert_eq!(engine.metrics().flow_runs("cancelled"), 1);
    assert!(engine.session_view().active.is_none());
    assert!(engine.is_recovery_cancelled(&torrent));
}

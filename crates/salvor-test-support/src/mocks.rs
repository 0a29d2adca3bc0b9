//! Scripted collaborators for the recovery engine.
//!
//! # Design
//! - Answers are scripted per fingerprint; unscripted calls fall back to a healthy engine.
//! - Every call is counted so tests can assert on flow invocations.
//! - Optional per-call latency uses `tokio::time::sleep`, which honours paused test clocks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use salvor_torrent_core::{
    Capabilities, EngineClient, EngineOutcome, Fingerprint, ProbeResult, ProbeStatus,
    RecoveryRefresh, TorrentInspector, TorrentSnapshot, VerifyOptions,
};

/// Scripted verify answer.
#[derive(Debug, Clone)]
pub enum VerifyScript {
    /// Return this outcome.
    Outcome(EngineOutcome),
    /// Fail the call with a transport error.
    TransportError,
}

#[derive(Default)]
struct EngineScript {
    probes: HashMap<Fingerprint, ProbeResult>,
    verifies: HashMap<Fingerprint, VecDeque<VerifyScript>>,
    sticky_verifies: HashMap<Fingerprint, VerifyScript>,
    details: HashMap<Fingerprint, TorrentSnapshot>,
    probe_calls: HashMap<Fingerprint, usize>,
    verify_calls: HashMap<Fingerprint, usize>,
    verify_options: Vec<VerifyOptions>,
    created_directories: Vec<String>,
    fail_directory_creation: bool,
    free_space: Option<u64>,
    latency: Option<Duration>,
}

/// Engine client whose answers are scripted by the test.
pub struct ScriptedEngine {
    capabilities: Capabilities,
    script: Mutex<EngineScript>,
}

impl ScriptedEngine {
    /// Engine with the given capabilities and no scripted answers.
    #[must_use]
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            script: Mutex::new(EngineScript::default()),
        }
    }

    /// Local engine with directory creation and free-space support.
    #[must_use]
    pub fn local() -> Self {
        Self::new(Capabilities::local())
    }

    /// Script the probe answer for a fingerprint.
    pub fn set_probe(&self, fingerprint: &Fingerprint, status: ProbeStatus) {
        self.lock()
            .probes
            .insert(fingerprint.clone(), ProbeResult::new(status));
    }

    /// Queue one verify answer for a fingerprint; queued answers are consumed in order.
    pub fn push_verify(&self, fingerprint: &Fingerprint, script: VerifyScript) {
        self.lock()
            .verifies
            .entry(fingerprint.clone())
            .or_default()
            .push_back(script);
    }

    /// Answer every verify for a fingerprint with `script` once the queue is empty.
    pub fn always_verify(&self, fingerprint: &Fingerprint, script: VerifyScript) {
        self.lock()
            .sticky_verifies
            .insert(fingerprint.clone(), script);
    }

    /// Script the snapshot returned by `get_details`.
    pub fn set_details(&self, torrent: TorrentSnapshot) {
        if let Ok(fingerprint) = torrent.fingerprint() {
            self.lock().details.insert(fingerprint, torrent);
        }
    }

    /// Make directory creation fail.
    pub fn fail_directory_creation(&self) {
        self.lock().fail_directory_creation = true;
    }

    /// Report `bytes` of free space.
    pub fn set_free_space(&self, bytes: u64) {
        self.lock().free_space = Some(bytes);
    }

    /// Delay every probe and verify call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Number of probe calls observed for a fingerprint.
    #[must_use]
    pub fn probe_calls(&self, fingerprint: &Fingerprint) -> usize {
        self.lock()
            .probe_calls
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }

    /// Number of verify calls observed for a fingerprint.
    #[must_use]
    pub fn verify_calls(&self, fingerprint: &Fingerprint) -> usize {
        self.lock()
            .verify_calls
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }

    /// Total verify calls across all fingerprints.
    #[must_use]
    pub fn total_verify_calls(&self) -> usize {
        self.lock().verify_calls.values().sum()
    }

    /// Options passed to each verify call, in call order.
    #[must_use]
    pub fn verify_options(&self) -> Vec<VerifyOptions> {
        self.lock().verify_options.clone()
    }

    /// Directories created through the client.
    #[must_use]
    pub fn created_directories(&self) -> Vec<String> {
        self.lock().created_directories.clone()
    }

    fn lock(&self) -> MutexGuard<'_, EngineScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl EngineClient for ScriptedEngine {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn probe(&self, torrent: &TorrentSnapshot) -> Result<ProbeResult> {
        let fingerprint = torrent.fingerprint()?;
        let result = {
            let mut script = self.lock();
            *script.probe_calls.entry(fingerprint.clone()).or_default() += 1;
            script
                .probes
                .get(&fingerprint)
                .cloned()
                .unwrap_or_else(|| ProbeResult::new(ProbeStatus::Healthy))
        };
        self.simulate_latency().await;
        Ok(result)
    }

    async fn verify_or_resume(
        &self,
        torrent: &TorrentSnapshot,
        options: VerifyOptions,
    ) -> Result<EngineOutcome> {
        let fingerprint = torrent.fingerprint()?;
        let script = {
            let mut script = self.lock();
            *script.verify_calls.entry(fingerprint.clone()).or_default() += 1;
            script.verify_options.push(options);
            let queued = script
                .verifies
                .get_mut(&fingerprint)
                .and_then(VecDeque::pop_front);
            queued.or_else(|| script.sticky_verifies.get(&fingerprint).cloned())
        };
        self.simulate_latency().await;
        match script {
            Some(VerifyScript::Outcome(outcome)) => Ok(outcome),
            Some(VerifyScript::TransportError) => Err(anyhow!("engine connection reset")),
            None => Ok(EngineOutcome::Resumed {
                verified_complete: false,
            }),
        }
    }

    async fn get_details(&self, torrent: &TorrentSnapshot) -> Result<Option<TorrentSnapshot>> {
        let fingerprint = torrent.fingerprint()?;
        Ok(self.lock().details.get(&fingerprint).cloned())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        if !self.capabilities.can_create_directories {
            bail!("directory creation not supported by this engine");
        }
        let mut script = self.lock();
        if script.fail_directory_creation {
            bail!("permission denied");
        }
        script.created_directories.push(path.to_string());
        Ok(())
    }

    async fn free_space(&self, _path: &str) -> Result<u64> {
        if !self.capabilities.can_check_free_space {
            bail!("free-space query not supported by this engine");
        }
        self.lock()
            .free_space
            .ok_or_else(|| anyhow!("free space not reported"))
    }
}

/// Inspector returning a mutable, test-controlled torrent list.
#[derive(Default)]
pub struct StaticInspector {
    torrents: Mutex<Vec<TorrentSnapshot>>,
    fail: Mutex<bool>,
}

impl StaticInspector {
    /// Inspector that lists `torrents`.
    #[must_use]
    pub fn new(torrents: Vec<TorrentSnapshot>) -> Self {
        Self {
            torrents: Mutex::new(torrents),
            fail: Mutex::new(false),
        }
    }

    /// Replace the listed torrents.
    pub fn set(&self, torrents: Vec<TorrentSnapshot>) {
        *self.torrents.lock().unwrap_or_else(PoisonError::into_inner) = torrents;
    }

    /// Make subsequent `list` calls fail.
    pub fn fail_listing(&self) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

#[async_trait]
impl TorrentInspector for StaticInspector {
    async fn list(&self) -> Result<Vec<TorrentSnapshot>> {
        if *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
            bail!("torrent listing unavailable");
        }
        Ok(self
            .torrents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Refresh hook that records each refreshed fingerprint.
#[derive(Default)]
pub struct RecordingRefresh {
    refreshed: Mutex<Vec<Fingerprint>>,
    fail: bool,
}

impl RecordingRefresh {
    /// Hook whose refreshes always fail after recording.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            refreshed: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Fingerprints refreshed so far, in call order.
    #[must_use]
    pub fn refreshed(&self) -> Vec<Fingerprint> {
        self.refreshed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RecoveryRefresh for RecordingRefresh {
    async fn refresh_after_recovery(&self, torrent: &TorrentSnapshot) -> Result<()> {
        let fingerprint = torrent.fingerprint()?;
        self.refreshed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fingerprint);
        if self.fail {
            bail!("refresh endpoint unavailable");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{failing_torrent, fingerprint};
    use salvor_torrent_core::{BlockReason, ErrorClass};

    #[tokio::test]
    async fn scripted_verifies_are_consumed_in_order() {
        let engine = ScriptedEngine::local();
        let torrent = failing_torrent(1, ErrorClass::DataMissing);
        let fp = fingerprint(1);
        engine.push_verify(
            &fp,
            VerifyScript::Outcome(EngineOutcome::Blocked {
                reason: BlockReason::DataMissing,
                message: None,
            }),
        );
        engine.push_verify(&fp, VerifyScript::TransportError);

        let options = VerifyOptions::default();
        assert!(matches!(
            engine.verify_or_resume(&torrent, options).await,
            Ok(EngineOutcome::Blocked { .. })
        ));
        assert!(engine.verify_or_resume(&torrent, options).await.is_err());
        assert!(matches!(
            engine.verify_or_resume(&torrent, options).await,
            Ok(EngineOutcome::Resumed { .. })
        ));
        assert_eq!(engine.verify_calls(&fp), 3);
    }

    #[tokio::test]
    async fn remote_engine_refuses_filesystem_helpers() {
        let engine = ScriptedEngine::new(Capabilities::remote());
        assert!(engine.create_directory("/data").await.is_err());
        assert!(engine.free_space("/data").await.is_err());
        assert!(engine.created_directories().is_empty());
    }

    #[tokio::test]
    async fn failing_refresh_still_records() {
        let refresh = RecordingRefresh::failing();
        let torrent = failing_torrent(2, ErrorClass::PathMissing);
        assert!(refresh.refresh_after_recovery(&torrent).await.is_err());
        assert_eq!(refresh.refreshed(), vec![fingerprint(2)]);
    }
}

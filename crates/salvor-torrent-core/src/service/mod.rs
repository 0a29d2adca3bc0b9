//! Boundary traits implemented by engine adapters and host applications.

use crate::model::{Capabilities, EngineOutcome, ProbeResult, TorrentSnapshot, VerifyOptions};
use anyhow::bail;
use async_trait::async_trait;

/// Client capability object used by the recovery core to talk to the torrent engine.
///
/// The transport behind it is opaque; every method may fail and callers must
/// treat failures as recoverable.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Describe what this client and its execution context can do.
    fn capabilities(&self) -> Capabilities;

    /// Ask the engine whether payload data for the torrent is present.
    async fn probe(&self, torrent: &TorrentSnapshot) -> anyhow::Result<ProbeResult>;

    /// Run the engine's verify-then-resume sequence for the torrent.
    async fn verify_or_resume(
        &self,
        torrent: &TorrentSnapshot,
        options: VerifyOptions,
    ) -> anyhow::Result<EngineOutcome>;

    /// Fetch a fresh snapshot for the torrent, if the engine still knows it.
    async fn get_details(
        &self,
        torrent: &TorrentSnapshot,
    ) -> anyhow::Result<Option<TorrentSnapshot>>;

    /// Create a directory on the engine host; default implementation reports lack of support.
    async fn create_directory(&self, path: &str) -> anyhow::Result<()> {
        let _ = path;
        bail!("directory creation not supported by this engine");
    }

    /// Report available bytes at the path; default implementation reports lack of support.
    async fn free_space(&self, path: &str) -> anyhow::Result<u64> {
        let _ = path;
        bail!("free-space query not supported by this engine");
    }
}

/// Inspector trait used by background loops to enumerate current torrents.
#[async_trait]
pub trait TorrentInspector: Send + Sync {
    /// Retrieve the current torrent snapshot list.
    ///
    /// The list must be complete: background passes forget recovery state for
    /// torrents absent from it. Snapshots carry the info hash whenever it is known.
    async fn list(&self) -> anyhow::Result<Vec<TorrentSnapshot>>;
}

/// Host hook invoked after a torrent was recovered so lists, details and stats can be refetched.
#[async_trait]
pub trait RecoveryRefresh: Send + Sync {
    /// Refresh host state after the torrent recovered.
    async fn refresh_after_recovery(&self, torrent: &TorrentSnapshot) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProbeStatus, TorrentState};

    struct StubClient;

    #[async_trait]
    impl EngineClient for StubClient {
        fn capabilities(&self) -> Capabilities {
            Capabilities::remote()
        }

        async fn probe(&self, _torrent: &TorrentSnapshot) -> anyhow::Result<ProbeResult> {
            Ok(ProbeResult::new(ProbeStatus::Healthy))
        }

        async fn verify_or_resume(
            &self,
            _torrent: &TorrentSnapshot,
            _options: VerifyOptions,
        ) -> anyhow::Result<EngineOutcome> {
            Ok(EngineOutcome::Paused)
        }

        async fn get_details(
            &self,
            torrent: &TorrentSnapshot,
        ) -> anyhow::Result<Option<TorrentSnapshot>> {
            Ok(Some(torrent.clone()))
        }
    }

    #[tokio::test]
    async fn optional_capabilities_default_to_errors() {
        let client = StubClient;
        let err = client
            .create_directory("/data/missing")
            .await
            .expect_err("directory creation should error");
        assert!(err.to_string().contains("not supported"));
        assert!(client.free_space("/data").await.is_err());

        let torrent = TorrentSnapshot {
            id: Some(1),
            hash: None,
            name: None,
            state: TorrentState::Paused,
            save_path: None,
            download_dir: None,
            error: None,
        };
        assert_eq!(
            client.probe(&torrent).await.expect("probe").status,
            ProbeStatus::Healthy
        );
    }
}

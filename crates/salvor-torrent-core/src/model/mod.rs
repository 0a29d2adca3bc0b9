//! Core torrent domain types and DTOs shared across the workspace.
//!
//! # Design
//! - Snapshots are owned by the engine; the recovery core only reads them.
//! - Error classes and block reasons parse leniently so unknown engine values
//!   degrade to `Unknown` instead of failing deserialisation.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TorrentError, TorrentResult};

/// Lifecycle state reported by the engine for a torrent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Waiting for a slot in the engine queue.
    Queued,
    /// Hash-checking on-disk data.
    Checking,
    /// Actively downloading.
    Downloading,
    /// Download finished, uploading to peers.
    Seeding,
    /// Stopped by the user or the system.
    Paused,
    /// Engine reported that payload files are missing.
    MissingFiles,
    /// Engine reported a generic error.
    Error,
}

impl TorrentState {
    /// Render the state as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Paused => "paused",
            Self::MissingFiles => "missing_files",
            Self::Error => "error",
        }
    }

    /// Whether background recovery should look at torrents in this state.
    #[must_use]
    pub const fn is_recovery_candidate(self) -> bool {
        matches!(self, Self::Paused | Self::MissingFiles | Self::Error)
    }
}

/// Failure category attached to an errored torrent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// The save directory no longer exists.
    PathMissing,
    /// The volume hosting the save directory is not mounted.
    VolumeMissing,
    /// The directory exists but payload data is absent or truncated.
    DataMissing,
    /// Writes failed because the destination is out of space.
    DiskFull,
    /// Tracker-side failure; nothing local to recover.
    TrackerError,
    /// Local engine failure not tied to storage.
    LocalError,
    /// Any value the engine reported that is not recognised.
    #[serde(other)]
    Unknown,
}

impl ErrorClass {
    /// Parse an engine-reported class, mapping unrecognised values to [`ErrorClass::Unknown`].
    #[must_use]
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "path-missing" => Self::PathMissing,
            "volume-missing" => Self::VolumeMissing,
            "data-missing" => Self::DataMissing,
            "disk-full" => Self::DiskFull,
            "tracker-error" => Self::TrackerError,
            "local-error" => Self::LocalError,
            _ => Self::Unknown,
        }
    }

    /// Render the class as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PathMissing => "path-missing",
            Self::VolumeMissing => "volume-missing",
            Self::DataMissing => "data-missing",
            Self::DiskFull => "disk-full",
            Self::TrackerError => "tracker-error",
            Self::LocalError => "local-error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the recovery flow knows how to act on this class.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(
            self,
            Self::PathMissing | Self::VolumeMissing | Self::DataMissing | Self::DiskFull
        )
    }
}

/// Engine-reported progress marker for an in-progress recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    /// No recovery has been attempted yet.
    #[default]
    Idle,
    /// The engine expects the condition to clear by itself.
    Transient,
    /// A verify pass is running.
    Verifying,
    /// The engine tried and needs the user to act.
    NeedsUserAction,
    /// Data at the save path disagrees with the torrent metadata.
    Conflict,
}

impl RecoveryState {
    /// Render the state as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Transient => "transient",
            Self::Verifying => "verifying",
            Self::NeedsUserAction => "needs_user_action",
            Self::Conflict => "conflict",
        }
    }
}

/// Error metadata attached to a failed torrent. Cleared by the engine on recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    /// Failure category.
    pub error_class: ErrorClass,
    /// Engine progress marker.
    #[serde(default)]
    pub recovery_state: RecoveryState,
    /// Optional engine diagnostic, never shown to users verbatim.
    #[serde(default)]
    pub message: Option<String>,
    /// Alternate locations where the engine found matching data.
    #[serde(default)]
    pub candidates: Vec<String>,
}

impl ErrorEnvelope {
    /// Construct an idle envelope for the given class.
    #[must_use]
    pub const fn new(error_class: ErrorClass) -> Self {
        Self {
            error_class,
            recovery_state: RecoveryState::Idle,
            message: None,
            candidates: Vec::new(),
        }
    }

    /// Replace the recovery state marker.
    #[must_use]
    pub fn with_recovery_state(mut self, recovery_state: RecoveryState) -> Self {
        self.recovery_state = recovery_state;
        self
    }

    /// Replace the candidate location list.
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }
}

/// Stable identity key used for all dedup, cooldown and queue indexing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive a fingerprint from the available identity fields.
    ///
    /// The info hash wins when present because engine ids may be reassigned
    /// across daemon restarts. Adapters must report the hash on every snapshot
    /// once it is known: an id-only snapshot keys under a different fingerprint.
    #[must_use]
    pub fn from_identity(hash: Option<&str>, id: Option<i64>) -> Option<Self> {
        if let Some(hash) = hash.map(str::trim).filter(|hash| !hash.is_empty()) {
            return Some(Self(format!("hash:{}", hash.to_ascii_lowercase())));
        }
        id.map(|id| Self(format!("id:{id}")))
    }

    /// Borrow the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Point-in-time view of a torrent as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentSnapshot {
    /// Engine-assigned numeric id.
    pub id: Option<i64>,
    /// Info hash. Always populated by adapters that know it.
    pub hash: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Lifecycle state.
    pub state: TorrentState,
    /// Save path requested when the torrent was added.
    #[serde(default)]
    pub save_path: Option<String>,
    /// Directory the engine is currently downloading into.
    #[serde(default)]
    pub download_dir: Option<String>,
    /// Error metadata while the torrent is failing.
    #[serde(default)]
    pub error: Option<ErrorEnvelope>,
}

impl TorrentSnapshot {
    /// Derive the fingerprint for this snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::MissingIdentity`] when neither id nor hash is present.
    pub fn fingerprint(&self) -> TorrentResult<Fingerprint> {
        Fingerprint::from_identity(self.hash.as_deref(), self.id).ok_or_else(|| {
            TorrentError::MissingIdentity {
                name: self.name.clone(),
            }
        })
    }

    /// Directory the recovery flow should inspect, preferring the live download dir.
    #[must_use]
    pub fn path_hint(&self) -> Option<&str> {
        self.download_dir
            .as_deref()
            .or(self.save_path.as_deref())
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }

    /// Error class when the torrent carries an envelope.
    #[must_use]
    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|envelope| envelope.error_class)
    }
}

/// Where the engine process runs relative to this process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Engine shares the local filesystem.
    #[default]
    Local,
    /// Engine runs on another host.
    Remote,
}

/// Capability flags describing what this execution context may do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Local or remote execution.
    pub execution_model: ExecutionModel,
    /// Whether the engine client implements directory creation.
    pub can_create_directories: bool,
    /// Whether the engine client implements free-space queries.
    pub can_check_free_space: bool,
}

impl Capabilities {
    /// Capabilities of an engine sharing the local filesystem with full support.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            execution_model: ExecutionModel::Local,
            can_create_directories: true,
            can_check_free_space: true,
        }
    }

    /// Capabilities of a remote daemon without filesystem helpers.
    #[must_use]
    pub const fn remote() -> Self {
        Self {
            execution_model: ExecutionModel::Remote,
            can_create_directories: false,
            can_check_free_space: false,
        }
    }

    /// Whether a missing directory may be created silently on the user's behalf.
    #[must_use]
    pub const fn allows_local_directory_creation(&self) -> bool {
        matches!(self.execution_model, ExecutionModel::Local) && self.can_create_directories
    }
}

/// Result status of an "is data missing" probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Path and data are present.
    Healthy,
    /// The save directory is gone.
    PathMissing,
    /// The hosting volume is gone.
    VolumeMissing,
    /// Directory present, data absent or partial.
    DataMissing,
    /// The engine could not tell.
    Unknown,
}

impl ProbeStatus {
    /// Error class implied by this probe, when it indicates a failure.
    #[must_use]
    pub const fn implied_class(self) -> Option<ErrorClass> {
        match self {
            Self::PathMissing => Some(ErrorClass::PathMissing),
            Self::VolumeMissing => Some(ErrorClass::VolumeMissing),
            Self::DataMissing => Some(ErrorClass::DataMissing),
            Self::Healthy | Self::Unknown => None,
        }
    }
}

/// Probe answer returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    /// Probe status.
    pub status: ProbeStatus,
    /// Bytes the engine expects but could not find.
    #[serde(default)]
    pub missing_bytes: Option<u64>,
}

impl ProbeResult {
    /// Build a probe result without byte accounting.
    #[must_use]
    pub const fn new(status: ProbeStatus) -> Self {
        Self {
            status,
            missing_bytes: None,
        }
    }
}

/// Options forwarded to [`crate::EngineClient::verify_or_resume`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VerifyOptions {
    /// Resume the torrent when verification succeeds.
    pub resume_after_verify: bool,
    /// Allow the engine to re-download data it cannot find.
    pub download_missing: bool,
}

/// Machine-readable reason a recovery is blocked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Save directory missing and could not be recreated.
    PathMissing,
    /// Hosting volume is not mounted.
    VolumeMissing,
    /// Data missing and the engine will not re-download silently.
    DataMissing,
    /// Destination is out of space.
    DiskFull,
    /// The engine cannot report free space.
    FreeSpaceCheckUnsupported,
    /// Creating the missing directory failed.
    DirectoryCreateFailed,
    /// The engine client call failed.
    EngineUnavailable,
    /// Anything else.
    Unknown,
}

impl BlockReason {
    /// Render the reason as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PathMissing => "path_missing",
            Self::VolumeMissing => "volume_missing",
            Self::DataMissing => "data_missing",
            Self::DiskFull => "disk_full",
            Self::FreeSpaceCheckUnsupported => "free_space_check_unsupported",
            Self::DirectoryCreateFailed => "directory_create_failed",
            Self::EngineUnavailable => "engine_unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// Reason implied by an error class when nothing more specific is known.
    #[must_use]
    pub const fn from_error_class(class: ErrorClass) -> Self {
        match class {
            ErrorClass::PathMissing => Self::PathMissing,
            ErrorClass::VolumeMissing => Self::VolumeMissing,
            ErrorClass::DataMissing => Self::DataMissing,
            ErrorClass::DiskFull => Self::DiskFull,
            ErrorClass::TrackerError | ErrorClass::LocalError | ErrorClass::Unknown => {
                Self::Unknown
            }
        }
    }
}

impl Display for BlockReason {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for BlockReason {
    type Err = TorrentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "path_missing" => Ok(Self::PathMissing),
            "volume_missing" => Ok(Self::VolumeMissing),
            "data_missing" => Ok(Self::DataMissing),
            "disk_full" => Ok(Self::DiskFull),
            "free_space_check_unsupported" => Ok(Self::FreeSpaceCheckUnsupported),
            "directory_create_failed" => Ok(Self::DirectoryCreateFailed),
            "engine_unavailable" => Ok(Self::EngineUnavailable),
            "unknown" => Ok(Self::Unknown),
            other => Err(TorrentError::UnknownBlockReason {
                value: other.to_string(),
            }),
        }
    }
}

/// Result of a verify/resume sequence on the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineOutcome {
    /// The torrent is running again.
    Resumed {
        /// Whether verification found every piece present.
        verified_complete: bool,
    },
    /// Verification completed and the torrent was left paused.
    Paused,
    /// The engine could not proceed.
    Blocked {
        /// Machine-readable reason.
        reason: BlockReason,
        /// Optional engine diagnostic.
        message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TorrentSnapshot {
        TorrentSnapshot {
            id: Some(7),
            hash: Some("ABCDEF".into()),
            name: Some("debian.iso".into()),
            state: TorrentState::MissingFiles,
            save_path: Some("/data/save".into()),
            download_dir: None,
            error: Some(ErrorEnvelope::new(ErrorClass::PathMissing)),
        }
    }

    #[test]
    fn fingerprint_prefers_hash_and_is_case_insensitive() {
        let mut torrent = snapshot();
        let first = torrent.fingerprint().expect("fingerprint");
        torrent.hash = Some("abcdef".into());
        torrent.id = Some(99);
        assert_eq!(torrent.fingerprint().expect("fingerprint"), first);
        assert_eq!(first.as_str(), "hash:abcdef");
    }

    #[test]
    fn fingerprint_falls_back_to_id_and_requires_identity() {
        let mut torrent = snapshot();
        torrent.hash = Some("   ".into());
        assert_eq!(torrent.fingerprint().expect("id").as_str(), "id:7");

        torrent.id = None;
        torrent.hash = None;
        assert!(matches!(
            torrent.fingerprint(),
            Err(TorrentError::MissingIdentity { .. })
        ));
    }

    #[test]
    fn id_only_snapshots_key_differently_from_hashed_ones() {
        let mut torrent = snapshot();
        torrent.hash = None;
        let id_only = torrent.fingerprint().expect("id");
        torrent.hash = Some("ABCDEF".into());
        let hashed = torrent.fingerprint().expect("hash");
        assert_ne!(id_only, hashed);
        torrent.id = None;
        assert_eq!(torrent.fingerprint().expect("hash only"), hashed);
    }

    #[test]
    fn error_class_parses_leniently() {
        assert_eq!(ErrorClass::parse_lossy("path_missing"), ErrorClass::PathMissing);
        assert_eq!(ErrorClass::parse_lossy(" Volume-Missing "), ErrorClass::VolumeMissing);
        assert_eq!(ErrorClass::parse_lossy("cosmic-rays"), ErrorClass::Unknown);

        let parsed: ErrorClass =
            serde_json::from_str("\"cosmic-rays\"").expect("unknown class deserializes");
        assert_eq!(parsed, ErrorClass::Unknown);
    }

    #[test]
    fn actionable_classes_cover_storage_failures_only() {
        assert!(ErrorClass::PathMissing.is_actionable());
        assert!(ErrorClass::DiskFull.is_actionable());
        assert!(!ErrorClass::TrackerError.is_actionable());
        assert!(!ErrorClass::Unknown.is_actionable());
    }

    #[test]
    fn path_hint_prefers_download_dir() {
        let mut torrent = snapshot();
        assert_eq!(torrent.path_hint(), Some("/data/save"));
        torrent.download_dir = Some("/data/incomplete".into());
        assert_eq!(torrent.path_hint(), Some("/data/incomplete"));
        torrent.download_dir = Some("  ".into());
        torrent.save_path = None;
        assert_eq!(torrent.path_hint(), None);
    }

    #[test]
    fn block_reason_round_trips_through_str() {
        for reason in [
            BlockReason::PathMissing,
            BlockReason::DiskFull,
            BlockReason::FreeSpaceCheckUnsupported,
            BlockReason::EngineUnavailable,
        ] {
            assert_eq!(reason.as_str().parse::<BlockReason>().ok(), Some(reason));
        }
        assert!("nope".parse::<BlockReason>().is_err());
    }

    #[test]
    fn capabilities_gate_directory_creation() {
        assert!(Capabilities::local().allows_local_directory_creation());
        assert!(!Capabilities::remote().allows_local_directory_creation());
        let local_without_helper = Capabilities {
            can_create_directories: false,
            ..Capabilities::local()
        };
        assert!(!local_without_helper.allows_local_directory_creation());
    }

    #[test]
    fn recovery_candidates_are_paused_or_failing() {
        assert!(TorrentState::Paused.is_recovery_candidate());
        assert!(TorrentState::MissingFiles.is_recovery_candidate());
        assert!(!TorrentState::Seeding.is_recovery_candidate());
    }
}

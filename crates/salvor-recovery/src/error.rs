//! Error types for recovery engine callers.

use salvor_torrent_core::{Fingerprint, TorrentError, TorrentSnapshot};
use thiserror::Error;

/// Caller-facing recovery errors. Engine transport failures never surface here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    /// The torrent carried neither an id nor a hash.
    #[error("torrent identity missing")]
    MissingIdentity {
        /// Display name of the offending torrent, if known.
        name: Option<String>,
    },
    /// The operation requires an active session.
    #[error("no active recovery session")]
    NoActiveSession {
        /// Operation identifier.
        operation: &'static str,
    },
    /// The operation targeted a fingerprint that is not the active session.
    #[error("fingerprint is not the active recovery session")]
    SessionMismatch {
        /// Fingerprint the caller targeted.
        fingerprint: Fingerprint,
        /// Operation identifier.
        operation: &'static str,
    },
    /// A torrent model value could not be interpreted.
    #[error("torrent model value invalid")]
    InvalidModel {
        /// Offending value.
        value: String,
    },
}

impl From<TorrentError> for RecoveryError {
    fn from(err: TorrentError) -> Self {
        match err {
            TorrentError::MissingIdentity { name } => Self::MissingIdentity { name },
            TorrentError::UnknownBlockReason { value } => Self::InvalidModel { value },
        }
    }
}

/// Convenience alias for recovery results.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Derive the fingerprint for a torrent or report the missing identity.
pub(crate) fn fingerprint_of(torrent: &TorrentSnapshot) -> RecoveryResult<Fingerprint> {
    Ok(torrent.fingerprint()?)
}

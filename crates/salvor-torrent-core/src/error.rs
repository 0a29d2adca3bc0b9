//! Error types for torrent core services.

use thiserror::Error;

/// Primary error type for torrent model operations.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// The snapshot carried neither an engine id nor an info hash.
    #[error("torrent identity missing")]
    MissingIdentity {
        /// Display name when the engine reported one.
        name: Option<String>,
    },
    /// A block reason string did not match any known reason.
    #[error("unknown block reason")]
    UnknownBlockReason {
        /// Offending value.
        value: String,
    },
}

/// Convenience alias for torrent model results.
pub type TorrentResult<T> = Result<T, TorrentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_constant() {
        let err = TorrentError::MissingIdentity {
            name: Some("ubuntu.iso".into()),
        };
        assert_eq!(err.to_string(), "torrent identity missing");

        let err = TorrentError::UnknownBlockReason {
            value: "gremlins".into(),
        };
        assert_eq!(err.to_string(), "unknown block reason");
    }
}

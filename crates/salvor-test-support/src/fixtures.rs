//! Torrent snapshot builders.

use salvor_torrent_core::{
    ErrorClass, ErrorEnvelope, Fingerprint, RecoveryState, TorrentSnapshot, TorrentState,
};

/// Failing torrent in the `missing_files` state carrying an idle envelope of `class`.
#[must_use]
pub fn failing_torrent(id: i64, class: ErrorClass) -> TorrentSnapshot {
    TorrentSnapshot {
        id: Some(id),
        hash: None,
        name: Some(format!("torrent-{id}")),
        state: TorrentState::MissingFiles,
        save_path: Some(format!("/data/downloads/{id}")),
        download_dir: None,
        error: Some(ErrorEnvelope::new(class)),
    }
}

/// Failing torrent whose envelope carries the given engine recovery state.
#[must_use]
pub fn failing_torrent_in(id: i64, class: ErrorClass, state: RecoveryState) -> TorrentSnapshot {
    let mut torrent = failing_torrent(id, class);
    torrent.error = Some(ErrorEnvelope::new(class).with_recovery_state(state));
    torrent
}

/// Torrent that is downloading normally.
#[must_use]
pub fn healthy_torrent(id: i64) -> TorrentSnapshot {
    TorrentSnapshot {
        id: Some(id),
        hash: None,
        name: Some(format!("torrent-{id}")),
        state: TorrentState::Downloading,
        save_path: Some(format!("/data/downloads/{id}")),
        download_dir: None,
        error: None,
    }
}

/// Fingerprint a fixture built with `id` resolves to.
///
/// # Panics
///
/// Never in practice: numeric ids always produce a fingerprint.
#[must_use]
pub fn fingerprint(id: i64) -> Fingerprint {
    Fingerprint::from_identity(None, Some(id)).unwrap_or_else(|| unreachable!("id present"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_share_fingerprints_with_snapshots() {
        let torrent = failing_torrent(7, ErrorClass::DataMissing);
        assert_eq!(torrent.fingerprint().expect("fingerprint"), fingerprint(7));
        assert!(torrent.state.is_recovery_candidate());
        assert!(healthy_torrent(7).error.is_none());
    }

    #[test]
    fn recovery_state_is_applied() {
        let torrent = failing_torrent_in(1, ErrorClass::VolumeMissing, RecoveryState::Conflict);
        assert_eq!(
            torrent.error.map(|envelope| envelope.recovery_state),
            Some(RecoveryState::Conflict)
        );
    }
}

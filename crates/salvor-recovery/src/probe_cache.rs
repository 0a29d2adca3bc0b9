//! Time-bounded memo of engine probes.

use std::collections::HashMap;
use std::time::Duration;

use salvor_torrent_core::{Fingerprint, ProbeResult};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedProbe {
    result: ProbeResult,
    observed_at: Instant,
}

/// Probe answers keyed by fingerprint, fresh for `ttl` after they were observed.
#[derive(Debug)]
pub struct ProbeCache {
    ttl: Duration,
    entries: HashMap<Fingerprint, CachedProbe>,
}

impl ProbeCache {
    /// Empty cache with the given freshness window.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Cached probe when it is still fresh at `now`.
    #[must_use]
    pub fn get_fresh(&self, fingerprint: &Fingerprint, now: Instant) -> Option<ProbeResult> {
        self.entries
            .get(fingerprint)
            .filter(|entry| now.saturating_duration_since(entry.observed_at) < self.ttl)
            .map(|entry| entry.result.clone())
    }

    /// Whether the fingerprint has no probe or only an expired one.
    #[must_use]
    pub fn is_stale(&self, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.get_fresh(fingerprint, now).is_none()
    }

    /// Record a probe observed at `now`.
    pub fn insert(&mut self, fingerprint: Fingerprint, result: ProbeResult, now: Instant) {
        self.entries.insert(
            fingerprint,
            CachedProbe {
                result,
                observed_at: now,
            },
        );
    }

    /// Forget the probe for the fingerprint.
    pub fn invalidate(&mut self, fingerprint: &Fingerprint) {
        self.entries.remove(fingerprint);
    }

    /// Keep only probes for which `keep` holds. Returns how many were dropped.
    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&Fingerprint) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|fingerprint, _| keep(fingerprint));
        before - self.entries.len()
    }

    /// Number of cached probes, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

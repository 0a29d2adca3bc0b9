//! Per-fingerprint in-flight guard and exponential backoff cooldowns.
//!
//! # Design
//! - Pure bookkeeping; callers pass `now` so the clock stays injectable.
//! - The only place retry delays are computed.
//! - `next_retry_at` never moves backwards between failures; only a clear resets it.

use std::collections::HashMap;
use std::time::Duration;

use salvor_torrent_core::Fingerprint;
use tokio::time::Instant;

/// Answer to a request to start a background attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptGate {
    /// The attempt may run; the fingerprint is now marked in flight.
    Started,
    /// A previous failure is still cooling down.
    Cooldown {
        /// Time left before the next attempt may start.
        remaining: Duration,
    },
    /// Another attempt is already running.
    InFlight,
}

impl AttemptGate {
    /// Render the gate answer as its canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Cooldown { .. } => "cooldown",
            Self::InFlight => "in_flight",
        }
    }
}

/// Bookkeeping for one fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrySchedule {
    /// Whether an attempt is running.
    pub in_flight: bool,
    /// Earliest time the next attempt may start.
    pub next_retry_at: Option<Instant>,
    /// Failed attempts since the last clear.
    pub attempt_count: u32,
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any delay.
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Delay to apply after the `attempt`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Retry bookkeeping for all fingerprints.
#[derive(Debug)]
pub struct RetryScheduler {
    backoff: BackoffPolicy,
    schedules: HashMap<Fingerprint, RetrySchedule>,
}

impl RetryScheduler {
    /// Scheduler applying `backoff` to failed attempts.
    #[must_use]
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            schedules: HashMap::new(),
        }
    }

    /// Mark the fingerprint in flight unless it is running or cooling down.
    pub fn try_begin_attempt(&mut self, fingerprint: &Fingerprint, now: Instant) -> AttemptGate {
        let schedule = self.schedules.entry(fingerprint.clone()).or_default();
        if schedule.in_flight {
            return AttemptGate::InFlight;
        }
        if let Some(next) = schedule.next_retry_at
            && now < next
        {
            return AttemptGate::Cooldown {
                remaining: next - now,
            };
        }
        schedule.in_flight = true;
        AttemptGate::Started
    }

    /// Mark the fingerprint in flight regardless of cooldown. Returns `false` when
    /// an attempt is already running.
    pub fn begin_immediate(&mut self, fingerprint: &Fingerprint) -> bool {
        let schedule = self.schedules.entry(fingerprint.clone()).or_default();
        if schedule.in_flight {
            return false;
        }
        schedule.in_flight = true;
        true
    }

    /// Record a failed attempt and push the cooldown out. Returns the updated schedule.
    pub fn schedule_retry(&mut self, fingerprint: &Fingerprint, now: Instant) -> RetrySchedule {
        let schedule = self.schedules.entry(fingerprint.clone()).or_default();
        schedule.attempt_count = schedule.attempt_count.saturating_add(1);
        let candidate = now + self.backoff.delay_for(schedule.attempt_count);
        schedule.next_retry_at = Some(
            schedule
                .next_retry_at
                .map_or(candidate, |previous| previous.max(candidate)),
        );
        *schedule
    }

    /// Drop all bookkeeping for the fingerprint.
    pub fn clear_schedule(&mut self, fingerprint: &Fingerprint) {
        self.schedules.remove(fingerprint);
    }

    /// Clear only the in-flight flag, keeping the cooldown.
    pub fn finish_attempt(&mut self, fingerprint: &Fingerprint) {
        if let Some(schedule) = self.schedules.get_mut(fingerprint) {
            schedule.in_flight = false;
        }
    }

    /// Keep only schedules for which `keep` holds or an attempt is running.
    /// Returns how many were dropped.
    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&Fingerprint) -> bool,
    {
        let before = self.schedules.len();
        self.schedules
            .retain(|fingerprint, schedule| schedule.in_flight || keep(fingerprint));
        before - self.schedules.len()
    }

    /// Current bookkeeping for the fingerprint.
    #[must_use]
    pub fn schedule(&self, fingerprint: &Fingerprint) -> Option<RetrySchedule> {
        self.schedules.get(fingerprint).copied()
    }
}

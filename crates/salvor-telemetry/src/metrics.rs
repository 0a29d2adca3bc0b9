//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes only the counters and gauges the recovery core updates.

use std::sync::Arc;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{TelemetryError, TelemetryResult};

/// Prometheus-backed metrics registry shared by the recovery runtime.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    flow_runs_total: IntCounterVec,
    gate_outcomes_total: IntCounterVec,
    retries_scheduled_total: IntCounter,
    sessions_active: IntGauge,
    queue_depth: IntGauge,
    consistency_violations_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Whether a recovery session is currently active (0 or 1).
    pub sessions_active: i64,
    /// Entries waiting behind the active session.
    pub queue_depth: i64,
    /// Total background retries scheduled.
    pub retries_scheduled_total: u64,
    /// Total development consistency violations observed.
    pub consistency_violations_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the recovery collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> TelemetryResult<Self> {
        let registry = Registry::new();

        let flow_runs_total = collector(
            "recovery_flow_runs_total",
            IntCounterVec::new(
                Opts::new(
                    "recovery_flow_runs_total",
                    "Recovery flow executions by result",
                ),
                &["result"],
            ),
        )?;
        let gate_outcomes_total = collector(
            "recovery_gate_outcomes_total",
            IntCounterVec::new(
                Opts::new(
                    "recovery_gate_outcomes_total",
                    "Recovery gate dispositions by outcome",
                ),
                &["outcome"],
            ),
        )?;
        let retries_scheduled_total = collector(
            "recovery_retries_scheduled_total",
            IntCounter::with_opts(Opts::new(
                "recovery_retries_scheduled_total",
                "Background recovery retries scheduled after a failed attempt",
            )),
        )?;
        let sessions_active = collector(
            "recovery_sessions_active",
            IntGauge::with_opts(Opts::new(
                "recovery_sessions_active",
                "Whether a recovery session is currently displayed",
            )),
        )?;
        let queue_depth = collector(
            "recovery_queue_depth",
            IntGauge::with_opts(Opts::new(
                "recovery_queue_depth",
                "Recovery sessions waiting behind the active one",
            )),
        )?;
        let consistency_violations_total = collector(
            "recovery_consistency_violations_total",
            IntCounter::with_opts(Opts::new(
                "recovery_consistency_violations_total",
                "Session outcomes that diverged from the upgrade rule",
            )),
        )?;

        register(&registry, "recovery_flow_runs_total", &flow_runs_total)?;
        register(&registry, "recovery_gate_outcomes_total", &gate_outcomes_total)?;
        register(
            &registry,
            "recovery_retries_scheduled_total",
            &retries_scheduled_total,
        )?;
        register(&registry, "recovery_sessions_active", &sessions_active)?;
        register(&registry, "recovery_queue_depth", &queue_depth)?;
        register(
            &registry,
            "recovery_consistency_violations_total",
            &consistency_violations_total,
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                flow_runs_total,
                gate_outcomes_total,
                retries_scheduled_total,
                sessions_active,
                queue_depth,
                consistency_violations_total,
            }),
        })
    }

    /// Increment the flow execution counter for the given result label.
    pub fn inc_flow_run(&self, result: &str) {
        self.inner
            .flow_runs_total
            .with_label_values(&[result])
            .inc();
    }

    /// Increment the gate outcome counter for the given disposition label.
    pub fn inc_gate_outcome(&self, outcome: &str) {
        self.inner
            .gate_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Increment the scheduled retry counter.
    pub fn inc_retry_scheduled(&self) {
        self.inner.retries_scheduled_total.inc();
    }

    /// Set the active session gauge.
    pub fn set_sessions_active(&self, active: bool) {
        self.inner.sessions_active.set(i64::from(active));
    }

    /// Set the pending queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner
            .queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Increment the development consistency violation counter.
    pub fn inc_consistency_violation(&self) {
        self.inner.consistency_violations_total.inc();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_active: self.inner.sessions_active.get(),
            queue_depth: self.inner.queue_depth.get(),
            retries_scheduled_total: self.inner.retries_scheduled_total.get(),
            consistency_violations_total: self.inner.consistency_violations_total.get(),
        }
    }

    /// Current count for a flow result label.
    #[must_use]
    pub fn flow_runs(&self, result: &str) -> u64 {
        self.inner
            .flow_runs_total
            .with_label_values(&[result])
            .get()
    }

    /// Current count for a gate outcome label.
    #[must_use]
    pub fn gate_outcomes(&self, outcome: &str) -> u64 {
        self.inner
            .gate_outcomes_total
            .with_label_values(&[outcome])
            .get()
    }
}

fn collector<C>(name: &'static str, built: prometheus::Result<C>) -> TelemetryResult<C> {
    built.map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> TelemetryResult<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_updates() -> TelemetryResult<()> {
        let metrics = Metrics::new()?;
        metrics.inc_flow_run("resolved");
        metrics.inc_flow_run("resolved");
        metrics.inc_gate_outcome("decision_surfaced");
        metrics.inc_retry_scheduled();
        metrics.set_sessions_active(true);
        metrics.set_queue_depth(3);
        metrics.inc_consistency_violation();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_active, 1);
        assert_eq!(snapshot.queue_depth, 3);
        assert_eq!(snapshot.retries_scheduled_total, 1);
        assert_eq!(snapshot.consistency_violations_total, 1);
        assert_eq!(metrics.flow_runs("resolved"), 2);
        assert_eq!(metrics.gate_outcomes("decision_surfaced"), 1);
        assert_eq!(metrics.gate_outcomes("continue"), 0);

        let rendered = metrics.render()?;
        assert!(rendered.contains("recovery_flow_runs_total"));
        assert!(rendered.contains("recovery_queue_depth 3"));
        Ok(())
    }

    #[test]
    fn clones_share_one_registry() -> TelemetryResult<()> {
        let metrics = Metrics::new()?;
        let clone = metrics.clone();
        clone.set_sessions_active(true);
        metrics.set_sessions_active(false);
        assert_eq!(clone.snapshot().sessions_active, 0);
        Ok(())
    }
}

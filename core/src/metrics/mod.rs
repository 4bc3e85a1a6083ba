mod metrics_handler;

pub use metrics_handler::MetricsHandler;

use crate::models::DestroyReason;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Counters and histograms for the broker daemon, registered against a
/// single `prometheus::Registry` and exposed through `MetricsHandler` at
/// `/metrics`.
pub struct BrokerMetrics {
    sessions_created: IntCounter,
    sessions_destroyed: IntCounterVec,
    verification_duration: Histogram,
    verification_timeouts: IntCounter,
    destroy_verification_failures: IntCounter,
    cost_records_emitted: IntCounter,
    benchmark_entries: IntCounterVec,
}

impl BrokerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let sessions_created = IntCounter::new(
            "broker_sessions_created_total",
            "number of sessions created by the provisioner",
        )?;
        registry.register(Box::new(sessions_created.clone()))?;

        let sessions_destroyed = IntCounterVec::new(
            Opts::new(
                "broker_sessions_destroyed_total",
                "number of sessions destroyed, by reason",
            ),
            &["reason"],
        )?;
        for reason in DestroyReason::ALL {
            sessions_destroyed.with_label_values(&[reason.as_ref()]).inc_by(0);
        }
        registry.register(Box::new(sessions_destroyed.clone()))?;

        let verification_duration = Histogram::with_opts(HistogramOpts::new(
            "broker_verification_duration_seconds",
            "time from provisioning start to a session becoming ready",
        ))?;
        registry.register(Box::new(verification_duration.clone()))?;

        let verification_timeouts = IntCounter::new(
            "broker_verification_timeouts_total",
            "number of sessions that hit the readiness deadline",
        )?;
        registry.register(Box::new(verification_timeouts.clone()))?;

        let destroy_verification_failures = IntCounter::new(
            "broker_destroy_verification_failures_total",
            "number of destroy attempts that exhausted their retries unconfirmed",
        )?;
        registry.register(Box::new(destroy_verification_failures.clone()))?;

        let cost_records_emitted = IntCounter::new(
            "broker_cost_records_emitted_total",
            "number of hourly cost records written by the cost tracker",
        )?;
        registry.register(Box::new(cost_records_emitted.clone()))?;

        let benchmark_entries = IntCounterVec::new(
            Opts::new(
                "broker_benchmark_entries_total",
                "number of benchmark manifest entries, by terminal status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(benchmark_entries.clone()))?;

        Ok(Self {
            sessions_created,
            sessions_destroyed,
            verification_duration,
            verification_timeouts,
            destroy_verification_failures,
            cost_records_emitted,
            benchmark_entries,
        })
    }

    pub fn session_created(&self) {
        self.sessions_created.inc();
    }

    pub fn session_destroyed(&self, reason: DestroyReason) {
        self.sessions_destroyed
            .with_label_values(&[reason.as_ref()])
            .inc();
    }

    pub fn verification_succeeded(&self, elapsed_secs: f64) {
        self.verification_duration.observe(elapsed_secs);
    }

    pub fn verification_timed_out(&self) {
        self.verification_timeouts.inc();
    }

    pub fn destroy_verification_failed(&self) {
        self.destroy_verification_failures.inc();
    }

    pub fn cost_record_emitted(&self) {
        self.cost_records_emitted.inc();
    }

    pub fn benchmark_entry_finished(&self, status: &str) {
        self.benchmark_entries.with_label_values(&[status]).inc();
    }
}

#[cfg(test)]
impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new(&Registry::new()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking() {
        let registry = Registry::new();
        let metrics = Arc::new(BrokerMetrics::new(&registry).unwrap());
        metrics.session_created();
        metrics.session_destroyed(DestroyReason::Idle);
        metrics.verification_timed_out();
        assert!(!registry.gather().is_empty());
    }
}

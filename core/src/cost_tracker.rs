//! The cost tracker: once per hour, lists `running` Sessions and inserts
//! one `CostRecord` per Session at the sampled `price_per_hour`. No
//! interpolation for partial hours — the contract is hour-ticks at the
//! sampled price, not a derived per-minute accrual.

use crate::metrics::BrokerMetrics;
use crate::models::{CostRecord, SessionStatus};
use crate::store::{CostStore, SessionFilter, SessionStore};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Truncates a timestamp down to the start of its hour.
pub fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

pub struct CostTracker {
    sessions: Arc<dyn SessionStore>,
    costs: Arc<dyn CostStore>,
    tick_interval: Duration,
    metrics: Option<Arc<BrokerMetrics>>,
}

impl CostTracker {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        costs: Arc<dyn CostStore>,
        tick_interval: Duration,
    ) -> Self {
        CostTracker {
            sessions,
            costs,
            tick_interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the hourly tick loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One hourly sample: a `CostRecord` per `running` Session at `at`,
    /// truncated to the hour.
    pub async fn tick(&self, at: DateTime<Utc>) {
        let hour = truncate_to_hour(at);
        let sessions = match self
            .sessions
            .list(&SessionFilter {
                statuses: Some(vec![SessionStatus::Running]),
                ..Default::default()
            })
            .await
        {
            Ok(sessions) => sessions,
            Err(err) => {
                log::warn!("cost tracker: failed to list running sessions: {:?}", err);
                return;
            }
        };

        for session in sessions {
            let record = CostRecord {
                id: Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                consumer_id: session.consumer_id.clone(),
                provider: session.provider.clone(),
                gpu_type: session.gpu_type.clone(),
                hour,
                amount: session.price_per_hour,
                currency: "USD".to_string(),
            };
            if let Err(err) = self.costs.insert(record).await {
                log::warn!(
                    "cost tracker: failed to record cost for session {}: {:?}",
                    session.id,
                    err
                );
                continue;
            }
            if let Some(metrics) = &self.metrics {
                metrics.cost_record_emitted();
            }
        }
    }
}

/// Sums `CostRecord.amount` within `[from, to)`, optionally filtered by
/// consumer, provider or gpu_type. Aggregation is a plain in-memory sum
/// over `CostStore::list_in_range` results — the contract names these as
/// "simple SQL-style sums", not a query-planner concern.
pub async fn rollup(
    costs: &dyn CostStore,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    consumer_id: Option<&str>,
    provider: Option<&str>,
    gpu_type: Option<&str>,
) -> Result<f64, crate::store::StoreError> {
    let records = costs.list_in_range(from, to).await?;
    Ok(records
        .iter()
        .filter(|record| consumer_id.map_or(true, |id| record.consumer_id == id))
        .filter(|record| provider.map_or(true, |name| record.provider == name))
        .filter(|record| gpu_type.map_or(true, |gt| record.gpu_type == gt))
        .map(|record| record.amount)
        .sum())
}

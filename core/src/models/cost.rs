use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One hourly tick of accrued cost for a running Session. Created by the
/// Cost Tracker's hourly scan; never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub session_id: String,
    pub consumer_id: String,
    pub provider: String,
    pub gpu_type: String,
    /// Truncated to the hour.
    pub hour: DateTime<Utc>,
    pub amount: f64,
    pub currency: String,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ManifestEntryStatus {
        Pending,
        Running,
        Success,
        Failed,
        Timeout,
        Skipped,
    }
}

impl ManifestEntryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ManifestEntryStatus::Pending | ManifestEntryStatus::Running
        )
    }
}

/// One unit of benchmark work: a `(model, gpu_type, provider)` triple bound
/// to a run. Mutated by at most one worker at a time; terminal states are
/// not retried automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub run_id: String,
    pub gpu_type: String,
    pub provider: String,
    pub model: String,
    /// Lower values dispatch first.
    pub priority: i32,
    pub status: ManifestEntryStatus,
    pub worker_id: Option<String>,
    pub session_id: Option<String>,
    pub throughput: Option<f64>,
    pub cost: Option<f64>,
    /// Which stage failed or timed out, e.g. `"find_offer"`, `"provision"`,
    /// `"deploy"`, `"result"`.
    pub failure_stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum BenchmarkRunStatus {
        Running,
        Completed,
        Failed,
        Cancelled,
    }
}

/// A benchmark campaign: the Cartesian product of `models × gpu_types ×
/// providers`, realized as a manifest of entries and a shared budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub id: String,
    pub models: Vec<String>,
    pub gpu_types: Vec<String>,
    pub providers: Vec<String>,
    pub max_budget: f64,
    pub priority: i32,
    pub status: BenchmarkRunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

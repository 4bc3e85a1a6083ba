use super::StoreError;
use crate::models::BenchmarkRun;
use async_trait::async_trait;

/// Durable storage for `BenchmarkRun` rows. One row per campaign; mutated
/// only to record the terminal status once dispatch finishes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, run: BenchmarkRun) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<BenchmarkRun>, StoreError>;
    async fn update(&self, run: BenchmarkRun) -> Result<(), StoreError>;
}

pub struct SledRunStore {
    runs: sled::Tree,
}

impl SledRunStore {
    pub fn new(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            runs: db.open_tree("benchmarks")?,
        })
    }
}

#[async_trait]
impl RunStore for SledRunStore {
    async fn insert(&self, run: BenchmarkRun) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&run).map_err(StoreError::backend)?;
        self.runs.insert(run.id.as_bytes(), bytes).map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BenchmarkRun>, StoreError> {
        match self.runs.get(id).map_err(StoreError::backend)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(StoreError::backend)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, run: BenchmarkRun) -> Result<(), StoreError> {
        self.insert(run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BenchmarkRunStatus;
    use chrono::Utc;

    fn test_store() -> SledRunStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledRunStore::new(&db).unwrap()
    }

    fn run() -> BenchmarkRun {
        BenchmarkRun {
            id: "run1".to_string(),
            models: vec!["m1".to_string()],
            gpu_types: vec!["a100".to_string()],
            providers: vec!["fake".to_string()],
            max_budget: 0.0,
            priority: 0,
            status: BenchmarkRunStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn round_trips_a_run() {
        let store = test_store();
        store.insert(run()).await.unwrap();
        let fetched = store.get("run1").await.unwrap().unwrap();
        assert_eq!(fetched.status, BenchmarkRunStatus::Running);
    }
}

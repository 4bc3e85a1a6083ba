use super::StoreError;
use crate::models::CostRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable storage for hourly cost ticks. Records are never mutated once
/// written; aggregation is done over `list` results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CostStore: Send + Sync {
    async fn insert(&self, record: CostRecord) -> Result<(), StoreError>;
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<CostRecord>, StoreError>;
    async fn list_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CostRecord>, StoreError>;
}

pub struct SledCostStore {
    records: sled::Tree,
}

impl SledCostStore {
    pub fn new(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            records: db.open_tree("cost_records")?,
        })
    }
}

#[async_trait]
impl CostStore for SledCostStore {
    async fn insert(&self, record: CostRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&record).map_err(StoreError::backend)?;
        self.records
            .insert(record.id.as_bytes(), bytes)
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<CostRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let (_, bytes) = entry.map_err(StoreError::backend)?;
            let record: CostRecord = serde_json::from_slice(&bytes).map_err(StoreError::backend)?;
            if record.session_id == session_id {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn list_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CostRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let (_, bytes) = entry.map_err(StoreError::backend)?;
            let record: CostRecord = serde_json::from_slice(&bytes).map_err(StoreError::backend)?;
            if record.hour >= from && record.hour < to {
                out.push(record);
            }
        }
        Ok(out)
    }
}

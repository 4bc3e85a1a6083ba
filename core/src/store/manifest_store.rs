use super::StoreError;
use crate::models::{ManifestEntry, ManifestEntryStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable storage for benchmark manifest entries. `mark_running`
/// implements the single-dispatch guarantee: the `pending -> running`
/// transition is a single compare-and-swap, so only a writer that observed
/// `pending` can win.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn insert(&self, entry: ManifestEntry) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<ManifestEntry>, StoreError>;
    /// Up to `limit` pending entries for `run_id`, ordered by `(priority
    /// asc, created_at asc)`.
    async fn list_pending(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<ManifestEntry>, StoreError>;
    async fn list_by_run(&self, run_id: &str) -> Result<Vec<ManifestEntry>, StoreError>;
    /// Atomically transitions `pending -> running`. Returns `false` if
    /// another writer already dispatched this entry.
    async fn mark_running(
        &self,
        id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Full-record replace, used to record terminal status and results.
    async fn update(&self, entry: ManifestEntry) -> Result<(), StoreError>;
}

pub struct SledManifestStore {
    entries: sled::Tree,
}

impl SledManifestStore {
    pub fn new(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            entries: db.open_tree("benchmark_manifest")?,
        })
    }
}

#[async_trait]
impl ManifestStore for SledManifestStore {
    async fn insert(&self, entry: ManifestEntry) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&entry).map_err(StoreError::backend)?;
        self.entries
            .insert(entry.id.as_bytes(), bytes)
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ManifestEntry>, StoreError> {
        match self.entries.get(id).map_err(StoreError::backend)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(StoreError::backend)?)),
            None => Ok(None),
        }
    }

    async fn list_pending(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut pending = self.list_by_run(run_id).await?;
        pending.retain(|entry| entry.status == ManifestEntryStatus::Pending);
        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_by_run(&self, run_id: &str) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut out = Vec::new();
        for item in self.entries.iter() {
            let (_, bytes) = item.map_err(StoreError::backend)?;
            let entry: ManifestEntry = serde_json::from_slice(&bytes).map_err(StoreError::backend)?;
            if entry.run_id == run_id {
                out.push(entry);
            }
        }
        Ok(out)
    }

    async fn mark_running(
        &self,
        id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let current = self
            .entries
            .get(id)
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut entry: ManifestEntry =
            serde_json::from_slice(&current).map_err(StoreError::backend)?;
        if entry.status != ManifestEntryStatus::Pending {
            return Ok(false);
        }
        entry.status = ManifestEntryStatus::Running;
        entry.worker_id = Some(worker_id.to_string());
        entry.started_at = Some(at);
        let new_bytes = serde_json::to_vec(&entry).map_err(StoreError::backend)?;

        let won = self
            .entries
            .compare_and_swap(id.as_bytes(), Some(current.as_ref()), Some(new_bytes))
            .map_err(StoreError::backend)?
            .is_ok();
        Ok(won)
    }

    async fn update(&self, entry: ManifestEntry) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&entry).map_err(StoreError::backend)?;
        self.entries
            .insert(entry.id.as_bytes(), bytes)
            .map_err(StoreError::backend)?;
        Ok(())
    }
}

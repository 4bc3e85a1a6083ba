use super::StoreError;
use crate::models::{Session, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Query shape for `SessionStore::list`. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub statuses: Option<Vec<SessionStatus>>,
    pub provider: Option<String>,
    pub expires_before: Option<DateTime<Utc>>,
}

impl SessionFilter {
    fn matches(&self, session: &Session) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&session.status) {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &session.provider != provider {
                return false;
            }
        }
        if let Some(before) = self.expires_before {
            if session.expires_at >= before {
                return false;
            }
        }
        true
    }
}

/// Durable storage for Sessions. The duplicate-active invariant is
/// enforced by a partial uniqueness constraint on `(consumer_id,
/// offer_id)` restricted to non-terminal statuses: writers that race must
/// observe at most one winner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;
    /// Full-record replace under id.
    async fn update(&self, session: Session) -> Result<(), StoreError>;
    async fn update_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        idle_seconds: u64,
    ) -> Result<(), StoreError>;
    async fn get_active_by_consumer_and_offer(
        &self,
        consumer_id: &str,
        offer_id: &str,
    ) -> Result<Option<Session>, StoreError>;
    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError>;
}

fn offer_key(consumer_id: &str, offer_id: &str) -> String {
    format!("{}\0{}", consumer_id, offer_id)
}

/// A `sled`-backed `SessionStore`. Writes to a given session id are
/// serialised through a per-id mutex map (readers remain concurrent); the
/// `active_index` tree backstops the partial uniqueness constraint.
pub struct SledSessionStore {
    sessions: sled::Tree,
    active_index: sled::Tree,
    id_locks: DashMap<String, Arc<Mutex<()>>>,
    offer_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SledSessionStore {
    pub fn new(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            sessions: db.open_tree("sessions")?,
            active_index: db.open_tree("sessions_active_index")?,
            id_locks: DashMap::new(),
            offer_locks: DashMap::new(),
        })
    }

    fn lock_for(map: &DashMap<String, Arc<Mutex<()>>>, key: &str) -> Arc<Mutex<()>> {
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        match self.sessions.get(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_session(&self, session: &Session) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(session)?;
        self.sessions.insert(session.id.as_bytes(), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SledSessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        let key = offer_key(&session.consumer_id, &session.offer_id);
        let lock = Self::lock_for(&self.offer_locks, &key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.active_index.get(key.as_bytes()).map_err(StoreError::backend)? {
            let existing_id = String::from_utf8_lossy(&existing).to_string();
            return Err(StoreError::DuplicateActive { existing_id });
        }

        self.write_session(&session).map_err(StoreError::backend)?;
        self.active_index
            .insert(key.as_bytes(), session.id.as_bytes())
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.read_session(id).map_err(StoreError::backend)
    }

    async fn update(&self, session: Session) -> Result<(), StoreError> {
        let id_lock = Self::lock_for(&self.id_locks, &session.id);
        let _guard = id_lock.lock().await;

        if session.status.is_terminal() {
            let key = offer_key(&session.consumer_id, &session.offer_id);
            let offer_lock = Self::lock_for(&self.offer_locks, &key);
            let _offer_guard = offer_lock.lock().await;
            // Only clear the index if it still points at this session id;
            // a newer non-terminal session may already have taken the slot.
            if let Some(current) = self.active_index.get(key.as_bytes()).map_err(StoreError::backend)? {
                if current.as_ref() == session.id.as_bytes() {
                    self.active_index.remove(key.as_bytes()).map_err(StoreError::backend)?;
                }
            }
        }

        self.write_session(&session).map_err(StoreError::backend)
    }

    async fn update_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        idle_seconds: u64,
    ) -> Result<(), StoreError> {
        let id_lock = Self::lock_for(&self.id_locks, id);
        let _guard = id_lock.lock().await;

        let mut session = self
            .read_session(id)
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.last_heartbeat = Some(at);
        session.last_idle_seconds = idle_seconds;
        self.write_session(&session).map_err(StoreError::backend)
    }

    async fn get_active_by_consumer_and_offer(
        &self,
        consumer_id: &str,
        offer_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let key = offer_key(consumer_id, offer_id);
        match self.active_index.get(key.as_bytes()).map_err(StoreError::backend)? {
            Some(id_bytes) => {
                let id = String::from_utf8_lossy(&id_bytes).to_string();
                self.get(&id).await
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            let (_, bytes) = entry.map_err(StoreError::backend)?;
            let session: Session = serde_json::from_slice(&bytes).map_err(StoreError::backend)?;
            if filter.matches(&session) {
                out.push(session);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_util::new_session;

    fn test_store() -> SledSessionStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledSessionStore::new(&db).unwrap()
    }

    #[tokio::test]
    async fn rejects_duplicate_active_session() {
        let store = test_store();
        let s1 = new_session("c1", "o1");
        store.create(s1.clone()).await.unwrap();

        let s2 = new_session("c1", "o1");
        let err = store.create(s2).await.unwrap_err();
        match err {
            StoreError::DuplicateActive { existing_id } => assert_eq!(existing_id, s1.id),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn allows_new_session_after_prior_terminates() {
        let store = test_store();
        let mut s1 = new_session("c1", "o1");
        store.create(s1.clone()).await.unwrap();

        s1.status = SessionStatus::Failed;
        s1.stopped_at = Some(Utc::now());
        store.update(s1).await.unwrap();

        let s2 = new_session("c1", "o1");
        store.create(s2).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_status_and_expiry() {
        let store = test_store();
        let mut running = new_session("c1", "o1");
        running.status = SessionStatus::Running;
        store.create(running.clone()).await.unwrap();

        let mut pending = new_session("c2", "o2");
        pending.status = SessionStatus::Pending;
        store.create(pending).await.unwrap();

        let filter = SessionFilter {
            statuses: Some(vec![SessionStatus::Running]),
            ..Default::default()
        };
        let found = store.list(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, running.id);
    }
}

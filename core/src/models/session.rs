use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

arg_enum! {
    /// Workload a Session was requested for; governs idle-eligibility and
    /// benchmark dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum WorkloadType {
        Generic,
        LlmInference,
        Training,
        Benchmark,
    }
}

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum SessionStatus {
        Pending,
        Provisioning,
        Running,
        Stopping,
        Stopped,
        Failed,
    }
}

impl SessionStatus {
    /// `pending`, `provisioning` and `running` are the statuses counted by
    /// the at-most-one-active invariant on `(consumer_id, offer_id)`.
    pub fn is_non_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Pending | SessionStatus::Provisioning | SessionStatus::Running
        )
    }

    /// `stopped` and `failed` are sinks: once reached a Session never
    /// transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum StoragePolicy {
        Destroy,
        Preserve,
    }
}

impl Default for StoragePolicy {
    fn default() -> Self {
        StoragePolicy::Destroy
    }
}

/// Why the lifecycle manager or an explicit API call tore a Session down;
/// recorded for operator audit and as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyReason {
    /// `DELETE /sessions/{id}` or `POST /sessions/{id}/done`.
    ConsumerRequested,
    /// `now >= expires_at`.
    Expired,
    /// `now >= created_at + hard_max_override`.
    HardMaxExceeded,
    /// idle-eligible workload past `idle_threshold_minutes`.
    Idle,
    /// readiness deadline elapsed before a probe succeeded.
    VerificationTimeout,
    /// upstream instance for this session no longer exists.
    Orphan,
    /// destroyed during the startup reconciliation sweep.
    StartupSweep,
}

impl AsRef<str> for DestroyReason {
    fn as_ref(&self) -> &'static str {
        match self {
            DestroyReason::ConsumerRequested => "consumer_requested",
            DestroyReason::Expired => "expired",
            DestroyReason::HardMaxExceeded => "hard_max_exceeded",
            DestroyReason::Idle => "idle",
            DestroyReason::VerificationTimeout => "verification_timeout",
            DestroyReason::Orphan => "orphan",
            DestroyReason::StartupSweep => "startup_sweep",
        }
    }
}

impl DestroyReason {
    pub const ALL: &'static [DestroyReason] = &[
        DestroyReason::ConsumerRequested,
        DestroyReason::Expired,
        DestroyReason::HardMaxExceeded,
        DestroyReason::Idle,
        DestroyReason::VerificationTimeout,
        DestroyReason::Orphan,
        DestroyReason::StartupSweep,
    ];
}

/// The broker's durable record of a consumer's lease on an instance created
/// from an offer. See module docs for the invariants this type must
/// uphold; they are enforced by the store and the components that mutate
/// it, not by this type itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub consumer_id: String,
    pub provider: String,
    pub offer_id: String,
    pub provider_instance_id: Option<String>,

    pub gpu_type: String,
    pub gpu_count: u32,
    pub workload_type: WorkloadType,

    pub status: SessionStatus,

    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_user: Option<String>,
    pub ssh_public_key: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_port: Option<u16>,

    pub reservation_hours: f64,
    pub hard_max_override_hours: Option<f64>,
    pub idle_threshold_minutes: Option<u64>,
    pub storage_policy: StoragePolicy,

    pub price_per_hour: f64,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_idle_seconds: u64,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Session {
    /// The effective terminal deadline per invariant 3-4: the tighter of
    /// the consumer's reservation and any operator-imposed hard max.
    pub fn effective_deadline(&self) -> DateTime<Utc> {
        match self.hard_max_override_hours {
            Some(hours) if hours > 0.0 => {
                let hard_max_at = self.created_at + chrono::Duration::seconds((hours * 3600.0) as i64);
                self.expires_at.min(hard_max_at)
            }
            _ => self.expires_at,
        }
    }

    /// Whether this workload kind is eligible for idle-based teardown.
    /// Resolves the spec's open question: only `generic` and `benchmark`
    /// workloads are idle-eligible, since LLM inference and training
    /// sessions legitimately sit "idle" between requests/epochs.
    pub fn idle_eligible(&self) -> bool {
        matches!(self.workload_type, WorkloadType::Generic | WorkloadType::Benchmark)
    }
}

#[cfg(test)]
pub mod test_util {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    pub fn new_session(consumer_id: &str, offer_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4().to_string(),
            consumer_id: consumer_id.to_string(),
            provider: "fake".to_string(),
            offer_id: offer_id.to_string(),
            provider_instance_id: None,
            gpu_type: "a100".to_string(),
            gpu_count: 1,
            workload_type: WorkloadType::Generic,
            status: SessionStatus::Pending,
            ssh_host: None,
            ssh_port: None,
            ssh_user: None,
            ssh_public_key: None,
            api_endpoint: None,
            api_port: None,
            reservation_hours: 1.0,
            hard_max_override_hours: None,
            idle_threshold_minutes: None,
            storage_policy: StoragePolicy::Destroy,
            price_per_hour: 1.5,
            created_at: now,
            expires_at: now + Duration::hours(1),
            last_heartbeat: None,
            last_idle_seconds: 0,
            stopped_at: None,
            failure_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn effective_deadline_uses_tighter_of_expiry_and_hard_max() {
        let mut session = test_util::new_session("c1", "o1");
        session.expires_at = session.created_at + Duration::hours(10);
        session.hard_max_override_hours = Some(4.0);
        let deadline = session.effective_deadline();
        assert_eq!(deadline, session.created_at + Duration::hours(4));
    }

    #[test]
    fn effective_deadline_falls_back_to_expiry_when_no_hard_max() {
        let session = test_util::new_session("c1", "o1");
        assert_eq!(session.effective_deadline(), session.expires_at);
    }

    #[test]
    fn only_generic_and_benchmark_workloads_are_idle_eligible() {
        let mut session = test_util::new_session("c1", "o1");
        session.workload_type = WorkloadType::Training;
        assert!(!session.idle_eligible());
        session.workload_type = WorkloadType::Benchmark;
        assert!(session.idle_eligible());
    }
}

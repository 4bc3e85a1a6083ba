//! A deterministic, in-memory `Provider` double plus a controllable clock,
//! shared by this crate's own tests and (via the `test-util` feature) by
//! `providers` and `e2e` so scenario tests don't reimplement the fake.

use crate::models::{Offer, OfferFilter};
use crate::provider::{
    CreateInstanceRequest, Feature, InstanceInfo, InstanceStatus, Provider, ProviderError,
    TaggedInstance,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Scripted behaviour for one instance: a queue of `GetInstanceStatus`
/// responses consumed in order, the last one repeating once exhausted.
#[derive(Debug, Clone)]
pub struct InstanceScript {
    pub statuses: Vec<Result<InstanceStatus, FakeProviderError>>,
}

#[derive(Debug, Clone)]
pub enum FakeProviderError {
    NotFound,
    StaleInventory { offer_id: String },
    Other(String),
}

struct FakeState {
    offers: Vec<Offer>,
    next_instance_id: u64,
    create_result: Option<Result<InstanceInfo, FakeProviderError>>,
    status_scripts: HashMap<String, (Vec<Result<InstanceStatus, FakeProviderError>>, usize)>,
    destroy_calls: Vec<String>,
    create_calls: Vec<CreateInstanceRequest>,
    tagged_instances: Vec<TaggedInstance>,
}

/// A fully deterministic `Provider` for unit and scenario tests. Behaviour
/// is configured up front via the `with_*` builders; call counts are
/// inspectable afterwards via `destroy_calls()`/`create_calls()`.
pub struct FakeProvider {
    name: String,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new(name: impl Into<String>) -> Self {
        FakeProvider {
            name: name.into(),
            state: Mutex::new(FakeState {
                offers: Vec::new(),
                next_instance_id: 1,
                create_result: None,
                status_scripts: HashMap::new(),
                destroy_calls: Vec::new(),
                create_calls: Vec::new(),
                tagged_instances: Vec::new(),
            }),
        }
    }

    pub fn with_offers(self, offers: Vec<Offer>) -> Self {
        self.state.lock().unwrap().offers = offers;
        self
    }

    /// Scripts the set of upstream instances returned by
    /// `list_tagged_instances`, e.g. to inject an orphan for
    /// reconciliation tests.
    pub fn with_tagged_instances(self, instances: Vec<TaggedInstance>) -> Self {
        self.state.lock().unwrap().tagged_instances = instances;
        self
    }

    /// Scripts the single `create_instance` response this fake will return.
    pub fn with_create_result(self, result: Result<InstanceInfo, FakeProviderError>) -> Self {
        self.state.lock().unwrap().create_result = Some(result);
        self
    }

    /// Scripts the sequence of `get_instance_status` responses for a given
    /// `provider_instance_id`; the last entry repeats once exhausted.
    pub fn with_status_script(
        self,
        provider_instance_id: impl Into<String>,
        statuses: Vec<Result<InstanceStatus, FakeProviderError>>,
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .status_scripts
            .insert(provider_instance_id.into(), (statuses, 0));
        self
    }

    pub fn destroy_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().destroy_calls.clone()
    }

    pub fn create_calls(&self) -> Vec<CreateInstanceRequest> {
        self.state.lock().unwrap().create_calls.clone()
    }
}

impl From<FakeProviderError> for ProviderError {
    fn from(err: FakeProviderError) -> Self {
        match err {
            FakeProviderError::NotFound => ProviderError::NotFound("fake-instance".to_string()),
            FakeProviderError::StaleInventory { offer_id } => ProviderError::StaleInventory { offer_id },
            FakeProviderError::Other(msg) => ProviderError::Other(anyhow::anyhow!(msg)),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<Offer>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .offers
            .iter()
            .filter(|offer| filter.matches(offer))
            .cloned()
            .collect())
    }

    async fn create_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<InstanceInfo, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls.push(req);
        let next_id = state.next_instance_id;
        state.next_instance_id += 1;

        match state.create_result.clone() {
            Some(Ok(mut info)) => {
                if info.provider_instance_id.is_empty() {
                    info.provider_instance_id = format!("fake-instance-{}", next_id);
                }
                Ok(info)
            }
            Some(Err(err)) => Err(err.into()),
            None => Ok(InstanceInfo {
                provider_instance_id: format!("fake-instance-{}", next_id),
                host: None,
                port: None,
                user: None,
                api_endpoint: None,
                api_port: None,
                price_per_hour: None,
            }),
        }
    }

    async fn get_instance_status(
        &self,
        provider_instance_id: &str,
    ) -> Result<InstanceStatus, ProviderError> {
        let mut state = self.state.lock().unwrap();
        match state.status_scripts.get_mut(provider_instance_id) {
            Some((statuses, cursor)) => {
                let index = (*cursor).min(statuses.len() - 1);
                let result = statuses[index].clone();
                if *cursor < statuses.len() - 1 {
                    *cursor += 1;
                }
                result.map_err(ProviderError::from)
            }
            None => Err(ProviderError::NotFound(provider_instance_id.to_string())),
        }
    }

    async fn destroy_instance(&self, provider_instance_id: &str) -> Result<(), ProviderError> {
        self.state
            .lock()
            .unwrap()
            .destroy_calls
            .push(provider_instance_id.to_string());
        Ok(())
    }

    async fn list_tagged_instances(
        &self,
        _deployment_id: &str,
    ) -> Result<Vec<TaggedInstance>, ProviderError> {
        Ok(self.state.lock().unwrap().tagged_instances.clone())
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(feature, Feature::Ssh | Feature::HttpHealth)
    }
}

/// A controllable implementation of `AsyncSleeping` that resolves sleeps
/// immediately while still recording the requested durations, so backoff
/// sequence assertions (invariant 8) don't have to wait out real time.
pub struct InstantSleep {
    pub recorded: Mutex<Vec<std::time::Duration>>,
}

impl Default for InstantSleep {
    fn default() -> Self {
        InstantSleep {
            recorded: Mutex::new(Vec::new()),
        }
    }
}

impl crate::util::AsyncSleeping for InstantSleep {
    fn sleep(&self, duration: std::time::Duration) -> futures::future::BoxFuture<'static, ()> {
        self.recorded.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_provider_replays_status_script() {
        let provider = FakeProvider::new("fake").with_status_script(
            "inst-1",
            vec![
                Ok(InstanceStatus {
                    running: true,
                    host: None,
                    port: None,
                    user: None,
                    api_endpoint: None,
                    api_port: None,
                }),
                Err(FakeProviderError::NotFound),
            ],
        );

        let first = provider.get_instance_status("inst-1").await.unwrap();
        assert!(first.running);
        let second = provider.get_instance_status("inst-1").await;
        assert!(matches!(second, Err(ProviderError::NotFound(_))));
        // Repeats the last entry once exhausted.
        let third = provider.get_instance_status("inst-1").await;
        assert!(matches!(third, Err(ProviderError::NotFound(_))));
    }
}

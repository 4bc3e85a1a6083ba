//! A `Provider` speaking a generic JSON/REST marketplace protocol: list
//! offers, create/inspect/destroy instances, list deployment-tagged
//! instances. Modeled on the shape TensorDock- and vast.ai-class
//! marketplaces actually expose, built on `broker_core::http`'s client
//! wrapper the same way the core's readiness verifier uses it for HTTP
//! probing.

use async_trait::async_trait;
use broker_core::http::{HttpClient, HttpFactory};
use broker_core::models::{Offer, OfferFilter};
use broker_core::provider::{
    CreateInstanceRequest, Feature, InstanceInfo, InstanceStatus, Provider, ProviderError,
    TaggedInstance,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Deserialize)]
struct OfferWire {
    id: String,
    gpu_type: String,
    gpu_count: u32,
    price_per_hour: f64,
    region: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateInstanceWire<'a> {
    offer_id: &'a str,
    ssh_public_key: &'a str,
    tags: TagsWire<'a>,
}

#[derive(Debug, Serialize)]
struct TagsWire<'a> {
    session_id: &'a str,
    deployment_id: &'a str,
    expires_at: DateTime<Utc>,
    consumer_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct InstanceWire {
    instance_id: String,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    #[serde(default)]
    api_endpoint: Option<String>,
    #[serde(default)]
    api_port: Option<u16>,
    price_per_hour: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct InstanceStatusWire {
    running: bool,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    #[serde(default)]
    api_endpoint: Option<String>,
    #[serde(default)]
    api_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct TaggedInstanceWire {
    instance_id: String,
    created_at: DateTime<Utc>,
}

/// Generic REST marketplace client. `base_url` and `api_key` come from the
/// provider's `credentials` config map (`config.providers.<name>`).
pub struct RestProvider {
    name: String,
    base_url: Url,
    api_key: String,
    client: HttpClient,
}

impl RestProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: Url,
        api_key: impl Into<String>,
        http: &HttpFactory,
    ) -> anyhow::Result<Self> {
        Ok(RestProvider {
            name: name.into(),
            base_url,
            api_key: api_key.into(),
            client: http.create()?,
        })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Url {
        let mut url = self.base_url.join(path).expect("static path joins base_url");
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api_key", &self.api_key);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

#[async_trait]
impl Provider for RestProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<Offer>, ProviderError> {
        let mut query = Vec::new();
        if let Some(gpu_type) = &filter.gpu_type {
            query.push(("gpu_type", gpu_type.clone()));
        }
        if let Some(min_gpu_count) = filter.min_gpu_count {
            query.push(("min_gpu_count", min_gpu_count.to_string()));
        }
        if let Some(max_price) = filter.max_price_per_hour {
            query.push(("max_price_per_hour", max_price.to_string()));
        }
        if let Some(region) = &filter.region {
            query.push(("region", region.clone()));
        }

        let url = self.url("v1/offers", &query);
        let wire: Vec<OfferWire> = self
            .client
            .get_json_async(url.as_str())
            .await
            .map_err(ProviderError::Other)?;

        Ok(wire
            .into_iter()
            .map(|o| Offer {
                id: o.id,
                provider: self.name.clone(),
                gpu_type: o.gpu_type,
                gpu_count: o.gpu_count,
                price_per_hour: o.price_per_hour,
                region: o.region,
            })
            .collect())
    }

    async fn create_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<InstanceInfo, ProviderError> {
        let body = CreateInstanceWire {
            offer_id: &req.offer_id,
            ssh_public_key: &req.ssh_public_key,
            tags: TagsWire {
                session_id: &req.tags.session_id,
                deployment_id: &req.tags.deployment_id,
                expires_at: req.tags.expires_at,
                consumer_id: &req.tags.consumer_id,
            },
        };
        let json = serde_json::to_string(&body).map_err(|err| ProviderError::Other(err.into()))?;
        let url = self.url("v1/instances", &[]);
        let response = self
            .client
            .post_raw_json_async(url.as_str(), json)
            .await
            .map_err(|err| classify(&req.offer_id, err))?;
        let wire: InstanceWire =
            serde_json::from_str(&response).map_err(|err| ProviderError::Other(err.into()))?;

        Ok(InstanceInfo {
            provider_instance_id: wire.instance_id,
            host: wire.host,
            port: wire.port,
            user: wire.user,
            api_endpoint: wire.api_endpoint,
            api_port: wire.api_port,
            price_per_hour: wire.price_per_hour,
        })
    }

    async fn get_instance_status(
        &self,
        provider_instance_id: &str,
    ) -> Result<InstanceStatus, ProviderError> {
        let url = self.url(&format!("v1/instances/{}", provider_instance_id), &[]);
        let wire: Option<InstanceStatusWire> = self
            .client
            .get_json_or_not_found_async(url.as_str())
            .await
            .map_err(ProviderError::Other)?;

        match wire {
            Some(wire) => Ok(InstanceStatus {
                running: wire.running,
                host: wire.host,
                port: wire.port,
                user: wire.user,
                api_endpoint: wire.api_endpoint,
                api_port: wire.api_port,
            }),
            None => Err(ProviderError::NotFound(provider_instance_id.to_string())),
        }
    }

    async fn destroy_instance(&self, provider_instance_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("v1/instances/{}", provider_instance_id), &[]);
        self.client
            .delete_async(url.as_str())
            .await
            .map_err(ProviderError::Other)
    }

    async fn list_tagged_instances(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<TaggedInstance>, ProviderError> {
        let url = self.url("v1/instances", &[("deployment_id", deployment_id.to_string())]);
        let wire: Vec<TaggedInstanceWire> = self
            .client
            .get_json_async(url.as_str())
            .await
            .map_err(ProviderError::Other)?;

        Ok(wire
            .into_iter()
            .map(|i| TaggedInstance {
                provider_instance_id: i.instance_id,
                created_at: i.created_at,
            })
            .collect())
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(feature, Feature::Ssh | Feature::HttpHealth)
    }
}

/// `post_raw_json_async` only surfaces a formatted `anyhow::Error` on
/// non-2xx status, not a status code, so a 404 or 409 response to
/// `CreateInstance` (the offer evaporated between `ListOffers` and here)
/// is recognized by matching the status text baked into that message.
fn classify(offer_id: &str, err: anyhow::Error) -> ProviderError {
    let message = err.to_string();
    if message.contains("404") || message.contains("409") {
        ProviderError::StaleInventory {
            offer_id: offer_id.to_string(),
        }
    } else {
        ProviderError::Other(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_api_key_and_query() {
        let provider = RestProvider::new(
            "fake",
            Url::parse("https://example.test/").unwrap(),
            "secret",
            &HttpFactory::default(),
        )
        .unwrap();
        let url = provider.url("v1/offers", &[("gpu_type", "a100".to_string())]);
        assert_eq!(url.host_str(), Some("example.test"));
        assert!(url.query().unwrap().contains("api_key=secret"));
        assert!(url.query().unwrap().contains("gpu_type=a100"));
    }
}

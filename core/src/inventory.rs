//! Offer inventory caching: wraps a `Provider::list_offers` call with a
//! short-lived cache so that repeated `ListOffers` calls from the
//! benchmark orchestrator's dispatch loop and the session API's
//! offer-browsing endpoint don't hammer the upstream marketplace, and
//! tracks recent listing failures so an operator can see which providers
//! are currently unreliable.

use crate::models::{Offer, OfferFilter};
use crate::provider::{Provider, ProviderError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One recorded `ListOffers` failure, kept for operator diagnostics
/// (`offer_failures` in the durable store schema).
#[derive(Debug, Clone)]
pub struct OfferFailure {
    pub provider: String,
    pub at: Instant,
    pub message: String,
}

/// A provider temporarily suppressed from the cache's refresh path after
/// repeated failures (`offer_suppressions` in the durable store schema).
/// Suppression only affects how eagerly the cache retries upstream; it
/// never blocks a caller from going straight to `Provider::list_offers`.
#[derive(Debug, Clone)]
struct Suppression {
    until: Instant,
}

struct CacheEntry {
    offers: Vec<Offer>,
    cached_at: Instant,
}

/// Caches `list_offers` results per provider for `default_cache_ttl`; a
/// provider whose listing just failed is retried only after
/// `backoff_cache_ttl` rather than on the next caller's request.
pub struct OfferCache {
    default_ttl: Duration,
    backoff_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    suppressions: Mutex<HashMap<String, Suppression>>,
    failures: Mutex<Vec<OfferFailure>>,
}

impl OfferCache {
    pub fn new(default_ttl: Duration, backoff_ttl: Duration) -> Self {
        OfferCache {
            default_ttl,
            backoff_ttl,
            entries: Mutex::new(HashMap::new()),
            suppressions: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Returns cached offers matching `filter` if the cache entry for
    /// `provider.name()` is fresh and not suppressed; otherwise calls
    /// through to `provider.list_offers`, refreshing the cache on success
    /// and recording a failure (plus a backoff suppression) otherwise.
    pub async fn list_offers(
        &self,
        provider: &dyn Provider,
        filter: &OfferFilter,
    ) -> Result<Vec<Offer>, ProviderError> {
        let name = provider.name().to_string();
        let now = Instant::now();

        if let Some(entry) = self.entries.lock().unwrap().get(&name) {
            if now.duration_since(entry.cached_at) < self.default_ttl {
                return Ok(entry.offers.iter().filter(|o| filter.matches(o)).cloned().collect());
            }
        }

        if let Some(suppression) = self.suppressions.lock().unwrap().get(&name) {
            if now < suppression.until {
                // Still backing off; serve stale data rather than retry.
                if let Some(entry) = self.entries.lock().unwrap().get(&name) {
                    return Ok(entry.offers.iter().filter(|o| filter.matches(o)).cloned().collect());
                }
            }
        }

        match provider.list_offers(&OfferFilter::default()).await {
            Ok(offers) => {
                self.entries.lock().unwrap().insert(
                    name.clone(),
                    CacheEntry {
                        offers: offers.clone(),
                        cached_at: now,
                    },
                );
                self.suppressions.lock().unwrap().remove(&name);
                Ok(offers.into_iter().filter(|o| filter.matches(o)).collect())
            }
            Err(err) => {
                self.failures.lock().unwrap().push(OfferFailure {
                    provider: name.clone(),
                    at: now,
                    message: err.to_string(),
                });
                self.suppressions.lock().unwrap().insert(
                    name,
                    Suppression {
                        until: now + self.backoff_ttl,
                    },
                );
                Err(err)
            }
        }
    }

    pub fn recent_failures(&self) -> Vec<OfferFailure> {
        self.failures.lock().unwrap().clone()
    }
}

/// First-fit offer selection on a caller-supplied filter: the first offer
/// in provider-returned order that satisfies `filter`. The core does not
/// shop across marketplaces to minimize price.
pub fn first_fit<'a>(offers: &'a [Offer], filter: &OfferFilter) -> Option<&'a Offer> {
    offers.iter().find(|offer| filter.matches(offer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeProvider;

    #[tokio::test]
    async fn caches_offers_within_ttl() {
        let provider = FakeProvider::new("fake").with_offers(vec![Offer {
            id: "o1".to_string(),
            provider: "fake".to_string(),
            gpu_type: "a100".to_string(),
            gpu_count: 1,
            price_per_hour: 1.0,
            region: None,
        }]);
        let cache = OfferCache::new(Duration::from_secs(30), Duration::from_secs(60));

        let first = cache.list_offers(&provider, &OfferFilter::default()).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = cache.list_offers(&provider, &OfferFilter::default()).await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn first_fit_returns_first_match_in_order() {
        let offers = vec![
            Offer {
                id: "o1".to_string(),
                provider: "fake".to_string(),
                gpu_type: "a100".to_string(),
                gpu_count: 1,
                price_per_hour: 2.0,
                region: None,
            },
            Offer {
                id: "o2".to_string(),
                provider: "fake".to_string(),
                gpu_type: "a100".to_string(),
                gpu_count: 1,
                price_per_hour: 1.0,
                region: None,
            },
        ];
        let filter = OfferFilter {
            gpu_type: Some("a100".to_string()),
            ..Default::default()
        };
        let found = first_fit(&offers, &filter).unwrap();
        assert_eq!(found.id, "o1");
    }
}

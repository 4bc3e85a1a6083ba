use serde::{Deserialize, Serialize};

/// An upstream marketplace listing of an available GPU at a quoted price,
/// as returned by `Provider::list_offers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub provider: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    pub region: Option<String>,
}

/// Caller-supplied filter for `ListOffers`. Offer selection is first-fit on
/// this filter; the core does not shop across marketplaces for price.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferFilter {
    pub gpu_type: Option<String>,
    pub min_gpu_count: Option<u32>,
    pub max_price_per_hour: Option<f64>,
    pub region: Option<String>,
}

impl OfferFilter {
    pub fn matches(&self, offer: &Offer) -> bool {
        if let Some(gpu_type) = &self.gpu_type {
            if &offer.gpu_type != gpu_type {
                return false;
            }
        }
        if let Some(min_gpu_count) = self.min_gpu_count {
            if offer.gpu_count < min_gpu_count {
                return false;
            }
        }
        if let Some(max_price) = self.max_price_per_hour {
            if offer.price_per_hour > max_price {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if offer.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> Offer {
        Offer {
            id: "o1".to_string(),
            provider: "fake".to_string(),
            gpu_type: "a100".to_string(),
            gpu_count: 2,
            price_per_hour: 1.2,
            region: Some("us-east".to_string()),
        }
    }

    #[test]
    fn matches_on_all_constraints() {
        let filter = OfferFilter {
            gpu_type: Some("a100".to_string()),
            min_gpu_count: Some(1),
            max_price_per_hour: Some(2.0),
            region: Some("us-east".to_string()),
        };
        assert!(filter.matches(&offer()));
    }

    #[test]
    fn rejects_on_price_ceiling() {
        let filter = OfferFilter {
            max_price_per_hour: Some(1.0),
            ..Default::default()
        };
        assert!(!filter.matches(&offer()));
    }
}

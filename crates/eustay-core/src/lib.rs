//! Core domain model for the EU budget stay scanner.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "eustay-core";

/// A scannable (country, city) pair, created once from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub country_code: String,
    pub country_name: String,
    pub city_name: String,
    /// Vendor id -> vendor-specific location id. Empty when a vendor has no
    /// mapping for this city.
    #[serde(default)]
    pub vendor_ref: std::collections::BTreeMap<String, String>,
}

/// A single price listing returned by one vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub vendor: String,
    pub country_code: String,
    pub country_name: String,
    pub city_name: String,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub hotel_name: String,
    pub total_price: f64,
    /// Vendor currency for both `total_price` and `price_per_night`.
    pub currency: String,
    pub price_per_night: f64,
    pub rating: Option<f64>,
    pub stars: Option<u8>,
    pub deeplink: Option<String>,
}

/// An offer enriched by the metrics stage: price normalized into the base
/// currency plus the cost-adjusted effective score. Produced exactly once
/// per offer; `Offer` itself stays immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredOffer {
    pub offer: Offer,
    /// Price-per-night converted into the scan's base currency.
    pub price_base: f64,
    /// `price_base * cost_index^alpha`.
    pub effective_score: f64,
}

/// Per-country summary statistics for one scan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryMetrics {
    pub country_code: String,
    pub country_name: String,
    /// Deduped, filtered offers sorted ascending by `price_base`.
    pub offers: Vec<ScoredOffer>,
    pub min_price_per_night: f64,
    pub median_price_per_night: f64,
    pub p90_price_per_night: f64,
    pub cost_index: f64,
    pub effective_min_price: f64,
    pub effective_median_price: f64,
    pub currency: String,
    pub offer_count: usize,
    /// Offers with rating >= 8.0.
    pub offer_count_quality_filtered: usize,
    pub median_price_high_rating: Option<f64>,
    pub median_price_3plus_stars: Option<f64>,
}

/// One row of the historical summary the run store reduces past runs into.
/// Absence of a country means "never scanned".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryHistoryRow {
    pub country_code: String,
    pub country_name: String,
    pub cost_index: f64,
    pub avg_median_price: f64,
    pub avg_effective_median: f64,
    /// `avg_median_price / cost_index`; equals `avg_median_price` when the
    /// stored cost index was not positive.
    pub normalized_median: f64,
}

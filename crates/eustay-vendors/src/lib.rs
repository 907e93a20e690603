//! Vendor capability contract + mock and live client implementations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use eustay_core::{Destination, Offer};
use eustay_storage::{FetchError, FileResponseCache, HttpClientConfig, HttpFetcher};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "eustay-vendors";

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The single capability the scan engine requires from a vendor.
///
/// `limit` is an upper bound, not an exact count; returning fewer or zero
/// offers is valid. A vendor with no mapping for a destination returns an
/// empty list rather than failing.
#[async_trait]
pub trait HotelVendor: Send + Sync {
    fn name(&self) -> &str;

    async fn search_offers(
        &self,
        destination: &Destination,
        checkin: NaiveDate,
        checkout: NaiveDate,
        min_price: Option<f64>,
        max_price: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Offer>, VendorError>;
}

/// Synthetic vendor used for development and tests.
///
/// Prices are drawn uniformly from 20..200 EUR per night. With a seed set,
/// output is a pure function of (seed, city, checkin), so repeated scans
/// over identical inputs reproduce identical offers.
#[derive(Debug, Clone)]
pub struct MockVendor {
    name: String,
    currency: String,
    seed: Option<u64>,
}

impl MockVendor {
    pub fn new() -> Self {
        Self {
            name: "mock_vendor".to_string(),
            currency: "EUR".to_string(),
            seed: None,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::new()
        }
    }

    fn rng_for(&self, destination: &Destination, checkin: NaiveDate) -> StdRng {
        match self.seed {
            Some(seed) => {
                let mut hasher = DefaultHasher::new();
                destination.city_name.hash(&mut hasher);
                checkin.hash(&mut hasher);
                StdRng::seed_from_u64(seed ^ hasher.finish())
            }
            None => StdRng::from_entropy(),
        }
    }
}

impl Default for MockVendor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HotelVendor for MockVendor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search_offers(
        &self,
        destination: &Destination,
        checkin: NaiveDate,
        checkout: NaiveDate,
        min_price: Option<f64>,
        max_price: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Offer>, VendorError> {
        let nights = (checkout - checkin).num_days();
        if nights <= 0 {
            return Ok(Vec::new());
        }

        let mut rng = self.rng_for(destination, checkin);
        let mut offers = Vec::new();
        for _ in 0..limit {
            let base: f64 = rng.gen_range(20.0..200.0);
            let hotel_no: u32 = rng.gen_range(1..=999);

            if min_price.is_some_and(|min| base < min) {
                continue;
            }
            if max_price.is_some_and(|max| base > max) {
                continue;
            }

            offers.push(Offer {
                vendor: self.name.clone(),
                country_code: destination.country_code.clone(),
                country_name: destination.country_name.clone(),
                city_name: destination.city_name.clone(),
                checkin,
                checkout,
                hotel_name: format!("{} Hotel {}", destination.city_name, hotel_no),
                total_price: base * nights as f64,
                currency: self.currency.clone(),
                price_per_night: base,
                rating: Some((rng.gen_range(6.5_f64..9.5) * 10.0).round() / 10.0),
                stars: Some(rng.gen_range(1..=5)),
                deeplink: None,
            });
        }

        Ok(offers)
    }
}

/// HTTP client for a Booking.com-style search API with response caching.
///
/// Any transport or payload problem degrades to an empty offer list; a
/// failing vendor must never abort the scan of other destinations.
pub struct BookingApiClient {
    name: String,
    api_key: String,
    base_url: String,
    fetcher: HttpFetcher,
    cache: Option<FileResponseCache>,
}

impl BookingApiClient {
    pub fn new(
        api_key: String,
        base_url: String,
        timeout: Duration,
        cache: Option<FileResponseCache>,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(format!("eustay/{}", env!("CARGO_PKG_VERSION"))),
        })?;
        Ok(Self {
            name: "booking_api".to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            fetcher,
            cache,
        })
    }

    fn cache_key(
        &self,
        dest_id: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
        min_price: Option<f64>,
        max_price: Option<f64>,
    ) -> String {
        format!(
            "{}|dest={}|in={}|out={}|min={}|max={}",
            self.name,
            dest_id,
            checkin,
            checkout,
            min_price.map(|v| v.to_string()).unwrap_or_default(),
            max_price.map(|v| v.to_string()).unwrap_or_default(),
        )
    }
}

#[async_trait]
impl HotelVendor for BookingApiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search_offers(
        &self,
        destination: &Destination,
        checkin: NaiveDate,
        checkout: NaiveDate,
        min_price: Option<f64>,
        max_price: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Offer>, VendorError> {
        let Some(dest_id) = destination.vendor_ref.get("booking") else {
            // No mapping for this vendor/destination yet.
            return Ok(Vec::new());
        };

        let key = self.cache_key(dest_id, checkin, checkout, min_price, max_price);
        let mut data = match &self.cache {
            Some(cache) => cache.get(&key).await,
            None => None,
        };

        if data.is_none() {
            let mut params = vec![
                ("destination_id", dest_id.clone()),
                ("checkin", checkin.to_string()),
                ("checkout", checkout.to_string()),
                ("currency", "EUR".to_string()),
                ("page_size", limit.to_string()),
            ];
            if let Some(min) = min_price {
                params.push(("min_price", min.to_string()));
            }
            if let Some(max) = max_price {
                params.push(("max_price", max.to_string()));
            }

            let url = format!("{}/v1/hotels/search", self.base_url);
            let fetched = self
                .fetcher
                .get_json(&url, &params, Some(&self.api_key))
                .await;
            match fetched {
                Ok(value) => {
                    if let Some(cache) = &self.cache {
                        if let Err(err) = cache.set(&key, &value).await {
                            warn!(vendor = self.name, %err, "failed to write response cache");
                        }
                    }
                    data = Some(value);
                }
                Err(err) => {
                    warn!(
                        vendor = self.name,
                        city = destination.city_name,
                        %err,
                        "vendor request failed, treating as zero offers"
                    );
                    return Ok(Vec::new());
                }
            }
        }

        let data = data.unwrap_or(JsonValue::Null);
        Ok(parse_booking_results(
            &data,
            &self.name,
            destination,
            checkin,
            checkout,
        ))
    }
}

fn item_f64(item: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| item.get(*k).and_then(JsonValue::as_f64))
}

fn item_str<'a>(item: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| item.get(*k).and_then(JsonValue::as_str))
}

/// Map a search response into offers. The field names are deliberately
/// lenient; malformed entries are skipped, never fatal.
pub fn parse_booking_results(
    data: &JsonValue,
    vendor: &str,
    destination: &Destination,
    checkin: NaiveDate,
    checkout: NaiveDate,
) -> Vec<Offer> {
    let nights = (checkout - checkin).num_days();
    if nights <= 0 {
        return Vec::new();
    }

    let results = data
        .get("results")
        .or_else(|| data.get("hotels"))
        .and_then(JsonValue::as_array);
    let Some(results) = results else {
        return Vec::new();
    };

    let mut offers = Vec::new();
    for item in results {
        let hotel_name = item_str(item, &["hotel_name", "name"])
            .unwrap_or("Unknown hotel")
            .to_string();
        let Some(total_price) = item_f64(item, &["total_price", "price_total", "price"]) else {
            warn!(vendor, hotel_name, "skipping result without a price");
            continue;
        };
        let currency = item_str(item, &["currency", "currency_code"])
            .unwrap_or("EUR")
            .to_string();

        offers.push(Offer {
            vendor: vendor.to_string(),
            country_code: destination.country_code.clone(),
            country_name: destination.country_name.clone(),
            city_name: destination.city_name.clone(),
            checkin,
            checkout,
            hotel_name,
            total_price,
            currency,
            price_per_night: total_price / nights as f64,
            rating: item_f64(item, &["review_score", "rating"]),
            stars: item_f64(item, &["stars", "star_rating"]).map(|v| v as u8),
            deeplink: item_str(item, &["url", "deeplink"]).map(ToString::to_string),
        });
    }
    offers
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorsConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub mock: MockVendorConfig,
    #[serde(default)]
    pub booking: BookingVendorConfig,
}

fn default_mode() -> String {
    "mock".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockVendorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for MockVendorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BookingVendorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cache: VendorCacheConfig,
}

fn default_true() -> bool {
    true
}

fn default_api_key_env() -> String {
    "BOOKING_API_KEY".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

impl Default for VendorCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    43_200
}

fn default_cache_dir() -> String {
    "cache/booking".to_string()
}

pub fn load_vendors_config(path: impl AsRef<Path>) -> Result<VendorsConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Build the configured vendor set. Always yields at least one vendor so
/// the rest of the pipeline stays runnable.
pub fn build_vendors(
    config: &VendorsConfig,
    workspace_root: impl AsRef<Path>,
) -> Result<Vec<Box<dyn HotelVendor>>> {
    let mut vendors: Vec<Box<dyn HotelVendor>> = Vec::new();

    if matches!(config.mode.as_str(), "mock" | "mixed") && config.mock.enabled {
        vendors.push(Box::new(match config.mock.seed {
            Some(seed) => MockVendor::with_seed(seed),
            None => MockVendor::new(),
        }));
    }

    if matches!(config.mode.as_str(), "live" | "mixed") && config.booking.enabled {
        let api_key = std::env::var(&config.booking.api_key_env).ok();
        match (api_key, &config.booking.base_url) {
            (Some(api_key), Some(base_url)) => {
                let cache = if config.booking.cache.enabled {
                    Some(FileResponseCache::new(
                        workspace_root.as_ref().join(&config.booking.cache.dir),
                        Duration::from_secs(config.booking.cache.ttl_seconds),
                    ))
                } else {
                    None
                };
                vendors.push(Box::new(BookingApiClient::new(
                    api_key,
                    base_url.clone(),
                    Duration::from_secs(config.booking.timeout_seconds),
                    cache,
                )?));
            }
            (None, _) => {
                warn!(
                    env = config.booking.api_key_env,
                    "api key env var not set, booking vendor skipped"
                );
            }
            (_, None) => {
                warn!("booking.base_url not configured, booking vendor skipped");
            }
        }
    }

    if vendors.is_empty() {
        warn!("no vendors configured or enabled, falling back to the mock vendor");
        vendors.push(Box::new(MockVendor::new()));
    }

    Ok(vendors)
}

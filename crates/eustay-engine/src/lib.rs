//! Cost-guided scan engine: budget allocation, vendor fan-out, dedup,
//! currency normalization, per-country metrics and the historical scan
//! weight builder.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use eustay_core::{CountryHistoryRow, CountryMetrics, Destination, Offer, ScoredOffer};
use eustay_storage::RunStore;
use eustay_vendors::{build_vendors, load_vendors_config, HotelVendor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "eustay-engine";

const EPS: f64 = 1e-6;
/// Rating threshold for the "high rating" quality segment.
const HIGH_RATING_THRESHOLD: f64 = 8.0;
const QUALITY_STARS_THRESHOLD: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    CheapOnly,
    All,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::CheapOnly => "cheap_only",
            ScanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DelayRange {
    #[serde(default = "default_delay_min")]
    pub min: f64,
    #[serde(default = "default_delay_max")]
    pub max: f64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min: default_delay_min(),
            max: default_delay_max(),
        }
    }
}

fn default_delay_min() -> f64 {
    5.0
}

fn default_delay_max() -> f64 {
    20.0
}

/// Immutable per-run scan configuration. Loaded from `scanner.yaml`;
/// individual fields may be overridden before the run starts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,
    #[serde(default = "default_max_cost_index")]
    pub max_cost_index_for_scan: f64,
    #[serde(default = "default_base_cities")]
    pub base_cities_per_country: u32,
    #[serde(default = "default_base_offers")]
    pub base_offers_per_destination: u32,
    /// Randomized inter-request delay, a rate-limiting courtesy only.
    #[serde(default)]
    pub delay_seconds: DelayRange,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub min_stars: Option<u8>,
}

fn default_scan_mode() -> ScanMode {
    ScanMode::CheapOnly
}

fn default_max_cost_index() -> f64 {
    1.8
}

fn default_base_cities() -> u32 {
    3
}

fn default_base_offers() -> u32 {
    50
}

fn default_alpha() -> f64 {
    1.0
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_mode: default_scan_mode(),
            max_cost_index_for_scan: default_max_cost_index(),
            base_cities_per_country: default_base_cities(),
            base_offers_per_destination: default_base_offers(),
            delay_seconds: DelayRange::default(),
            alpha: default_alpha(),
            min_rating: None,
            min_stars: None,
        }
    }
}

/// Convert an amount between currencies through the reference currency.
///
/// `fx_rates` maps a currency code to units of the reference currency per 1
/// unit of that currency (the reference itself carries rate 1.0). Missing
/// rates fail soft: the amount is returned unconverted, treated as already
/// being in the target currency.
pub fn convert_amount(
    amount: f64,
    from_currency: &str,
    to_currency: &str,
    fx_rates: &BTreeMap<String, f64>,
) -> f64 {
    let from = from_currency.to_uppercase();
    let to = to_currency.to_uppercase();
    if from == to {
        return amount;
    }

    let (Some(from_rate), Some(to_rate)) = (fx_rates.get(&from), fx_rates.get(&to)) else {
        return amount;
    };

    amount * from_rate / to_rate
}

/// Soft dedupe across vendors by case-folded (city, hotel_name), keeping
/// the cheapest vendor-currency price-per-night. Ties keep the offer seen
/// first. Different hotels can share a name; that false-merge risk is an
/// accepted approximation for country-level stats.
pub fn dedupe_offers(offers: Vec<Offer>) -> Vec<Offer> {
    let mut best_by_key: HashMap<(String, String), Offer> = HashMap::new();
    for offer in offers {
        let key = (
            offer.city_name.trim().to_lowercase(),
            offer.hotel_name.trim().to_lowercase(),
        );
        match best_by_key.get(&key) {
            Some(existing) if offer.price_per_night >= existing.price_per_night => {}
            _ => {
                best_by_key.insert(key, offer);
            }
        }
    }
    best_by_key.into_values().collect()
}

/// Per-offer quality gate. A missing rating or star count fails a
/// configured threshold.
pub fn passes_quality_filters(offer: &Offer, config: &ScanConfig) -> bool {
    if let Some(min_rating) = config.min_rating {
        if !offer.rating.is_some_and(|r| r >= min_rating) {
            return false;
        }
    }
    if let Some(min_stars) = config.min_stars {
        if !offer.stars.is_some_and(|s| s >= min_stars) {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountryBudget {
    pub target_cities: usize,
    pub max_offers_per_destination: usize,
}

/// Decide how deep to sample a country, or `None` to skip it entirely.
///
/// Cheaper countries (small cost index) get proportionally more cities and
/// more offers per city; the scan weight amplifies or dampens this on top.
/// The floors of 1 city and 10 offers keep every eligible country sampled.
pub fn country_budget(
    config: &ScanConfig,
    cost_index: f64,
    weight: f64,
    available_cities: usize,
) -> Option<CountryBudget> {
    // Weight 0 means the optimizer marked this country "do not scan".
    if weight <= 0.0 {
        return None;
    }
    if config.scan_mode == ScanMode::CheapOnly && cost_index > config.max_cost_index_for_scan {
        return None;
    }

    let cities = (f64::from(config.base_cities_per_country) * weight / cost_index).round();
    let target_cities = (cities as usize).min(available_cities).max(1);

    let offers = (f64::from(config.base_offers_per_destination) * weight / cost_index).round();
    let max_offers_per_destination = (offers as usize).max(10);

    Some(CountryBudget {
        target_cities,
        max_offers_per_destination,
    })
}

fn statistical_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Reduce one country's deduped, filtered offers into summary statistics.
/// Returns `None` for an empty offer list; such countries are omitted from
/// the result map rather than reported as errors.
pub fn compute_country_metrics(
    country_code: &str,
    country_name: &str,
    offers: Vec<Offer>,
    cost_index: f64,
    alpha: f64,
    fx_rates: &BTreeMap<String, f64>,
    base_currency: &str,
) -> Option<CountryMetrics> {
    if offers.is_empty() {
        return None;
    }

    let cost_factor = cost_index.powf(alpha);

    let mut scored: Vec<ScoredOffer> = offers
        .into_iter()
        .map(|offer| {
            let price_base =
                convert_amount(offer.price_per_night, &offer.currency, base_currency, fx_rates);
            ScoredOffer {
                offer,
                price_base,
                effective_score: price_base * cost_factor,
            }
        })
        .collect();
    scored.sort_by(|a, b| a.price_base.partial_cmp(&b.price_base).unwrap_or(Ordering::Equal));

    let prices: Vec<f64> = scored.iter().map(|s| s.price_base).collect();
    let n = prices.len();
    // Truncating p90 index, deterministic at small n; not an interpolated
    // percentile, preserved for compatibility with logged history.
    let p90_idx = ((n as f64 * 0.9) as usize).saturating_sub(1);

    let min_price_per_night = prices[0];
    let median_price_per_night = statistical_median(&prices)?;
    let p90_price_per_night = prices[p90_idx];

    let high_rating_prices: Vec<f64> = scored
        .iter()
        .filter(|s| s.offer.rating.is_some_and(|r| r >= HIGH_RATING_THRESHOLD))
        .map(|s| s.price_base)
        .collect();
    let stars3_prices: Vec<f64> = scored
        .iter()
        .filter(|s| s.offer.stars.is_some_and(|st| st >= QUALITY_STARS_THRESHOLD))
        .map(|s| s.price_base)
        .collect();

    Some(CountryMetrics {
        country_code: country_code.to_string(),
        country_name: country_name.to_string(),
        min_price_per_night,
        median_price_per_night,
        p90_price_per_night,
        cost_index,
        effective_min_price: min_price_per_night * cost_factor,
        effective_median_price: median_price_per_night * cost_factor,
        currency: base_currency.to_string(),
        offer_count: scored.len(),
        offer_count_quality_filtered: high_rating_prices.len(),
        median_price_high_rating: statistical_median(&high_rating_prices),
        median_price_3plus_stars: statistical_median(&stars3_prices),
        offers: scored,
    })
}

/// Inputs for one scan run; everything is read-only for the run's lifetime.
pub struct ScanJob<'a> {
    pub destinations: &'a [Destination],
    pub vendors: &'a [Box<dyn HotelVendor>],
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub cost_index_by_country: &'a BTreeMap<String, f64>,
    pub config: &'a ScanConfig,
    pub fx_rates: &'a BTreeMap<String, f64>,
    pub base_currency: &'a str,
    pub country_scan_weights: Option<&'a BTreeMap<String, f64>>,
}

fn cost_index_for(cost_index_by_country: &BTreeMap<String, f64>, country_code: &str) -> f64 {
    match cost_index_by_country.get(country_code) {
        Some(ci) if *ci > 0.0 => *ci,
        _ => 1.0,
    }
}

async fn courtesy_delay(delay: &DelayRange) {
    let secs = {
        let mut rng = rand::thread_rng();
        if delay.max > delay.min {
            rng.gen_range(delay.min..delay.max)
        } else {
            delay.min
        }
    };
    if secs > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

/// Drive the country -> destination -> vendor loop and aggregate results.
///
/// Offers for a single destination are filtered and deduped across vendors
/// before joining the country total, so identical hotel names in different
/// cities of the same country are never merged. A failing vendor is
/// indistinguishable from one with no matches.
pub async fn scan_destinations(job: ScanJob<'_>) -> BTreeMap<String, CountryMetrics> {
    let mut by_country: BTreeMap<String, Vec<&Destination>> = BTreeMap::new();
    let mut country_names: BTreeMap<String, String> = BTreeMap::new();
    for dest in job.destinations {
        by_country.entry(dest.country_code.clone()).or_default().push(dest);
        country_names.insert(dest.country_code.clone(), dest.country_name.clone());
    }

    let mut offers_by_country: BTreeMap<String, Vec<Offer>> = BTreeMap::new();

    for (country_code, dests) in &by_country {
        let cost_index = cost_index_for(job.cost_index_by_country, country_code);
        let weight = job
            .country_scan_weights
            .map(|w| w.get(country_code).copied().unwrap_or(1.0))
            .unwrap_or(1.0);

        let Some(budget) = country_budget(job.config, cost_index, weight, dests.len()) else {
            continue;
        };

        let mut dests_to_scan: Vec<&Destination> = dests.clone();
        dests_to_scan.sort_by(|a, b| a.city_name.cmp(&b.city_name));
        dests_to_scan.truncate(budget.target_cities);

        for dest in dests_to_scan {
            let mut dest_offers: Vec<Offer> = Vec::new();
            for vendor in job.vendors {
                courtesy_delay(&job.config.delay_seconds).await;

                let vendor_offers = match vendor
                    .search_offers(
                        dest,
                        job.checkin,
                        job.checkout,
                        job.min_price,
                        job.max_price,
                        budget.max_offers_per_destination,
                    )
                    .await
                {
                    Ok(offers) => offers,
                    Err(err) => {
                        warn!(
                            vendor = vendor.name(),
                            city = dest.city_name,
                            %err,
                            "vendor search failed, continuing with zero offers"
                        );
                        Vec::new()
                    }
                };

                dest_offers.extend(
                    vendor_offers
                        .into_iter()
                        .filter(|o| passes_quality_filters(o, job.config)),
                );
            }

            let deduped = dedupe_offers(dest_offers);
            offers_by_country
                .entry(country_code.clone())
                .or_default()
                .extend(deduped);
        }
    }

    let mut metrics_by_country = BTreeMap::new();
    for (country_code, offers) in offers_by_country {
        let cost_index = cost_index_for(job.cost_index_by_country, &country_code);
        let country_name = country_names
            .get(&country_code)
            .cloned()
            .unwrap_or_else(|| country_code.clone());
        if let Some(metrics) = compute_country_metrics(
            &country_code,
            &country_name,
            offers,
            cost_index,
            job.config.alpha,
            job.fx_rates,
            job.base_currency,
        ) {
            metrics_by_country.insert(country_code, metrics);
        }
    }

    metrics_by_country
}

#[derive(Debug, Clone)]
struct CountryScanWeight {
    country_code: String,
    raw_weight: f64,
    scaled_weight: f64,
}

/// Build per-country scan weights from the static cost index and historical
/// mispricing.
///
/// Prior cheapness is `1 / cost_index`; a positive historical normalized
/// median (`avg_median_price / cost_index`) adjusts it by a further
/// `1 / normalized_median`, so countries that have undercut their structural
/// prior score higher. With `top_k` set, countries beyond rank k get weight
/// 0 and are excluded from scaling. Remaining weights are scaled around the
/// median raw weight and clamped into `[min_weight, max_weight]`.
pub fn build_country_scan_weights(
    cost_index_by_country: &BTreeMap<String, f64>,
    historical_summary: &[CountryHistoryRow],
    top_k: Option<usize>,
    min_weight: f64,
    max_weight: f64,
) -> BTreeMap<String, f64> {
    if cost_index_by_country.is_empty() {
        return BTreeMap::new();
    }

    let history_by_code: HashMap<&str, &CountryHistoryRow> = historical_summary
        .iter()
        .map(|row| (row.country_code.as_str(), row))
        .collect();

    let mut entries: Vec<CountryScanWeight> = cost_index_by_country
        .iter()
        .map(|(code, ci)| {
            let base = 1.0 / ci.max(EPS);
            let normalized_median = history_by_code
                .get(code.as_str())
                .map(|row| row.normalized_median)
                .filter(|nm| *nm > 0.0);
            let raw_weight = match normalized_median {
                Some(nm) => base * (1.0 / nm.max(EPS)),
                None => base,
            };
            CountryScanWeight {
                country_code: code.clone(),
                raw_weight,
                scaled_weight: 1.0,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.raw_weight
            .partial_cmp(&a.raw_weight)
            .unwrap_or(Ordering::Equal)
    });

    let cutoff = match top_k {
        Some(k) if k > 0 => k.min(entries.len()),
        _ => entries.len(),
    };
    let (kept, zeroed) = entries.split_at_mut(cutoff);

    let mut raw_positive: Vec<f64> = kept
        .iter()
        .map(|e| e.raw_weight)
        .filter(|w| *w > 0.0)
        .collect();

    if raw_positive.is_empty() {
        // Designed fallback for the no-usable-signal state: every surviving
        // country scans at the neutral weight.
        for e in kept.iter_mut() {
            e.scaled_weight = 1.0;
        }
    } else {
        raw_positive.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let mut median_val = raw_positive[raw_positive.len() / 2];
        if median_val <= 0.0 {
            median_val = raw_positive[raw_positive.len() - 1];
        }
        for e in kept.iter_mut() {
            e.scaled_weight = (e.raw_weight / median_val).clamp(min_weight, max_weight);
        }
    }

    for e in zeroed.iter_mut() {
        e.scaled_weight = 0.0;
    }

    entries
        .iter()
        .map(|e| (e.country_code.clone(), e.scaled_weight))
        .collect()
}

/// One row of the scan plan table shown by the CLI and API.
#[derive(Debug, Clone, Serialize)]
pub struct ScanPlanRow {
    pub country_code: String,
    pub country_name: String,
    pub cost_index: f64,
    pub avg_median_price: Option<f64>,
    pub normalized_median: Option<f64>,
    pub scan_weight: f64,
}

pub fn summarize_country_weights(
    cost_index_by_country: &BTreeMap<String, f64>,
    historical_summary: &[CountryHistoryRow],
    weights: &BTreeMap<String, f64>,
) -> Vec<ScanPlanRow> {
    let history_by_code: HashMap<&str, &CountryHistoryRow> = historical_summary
        .iter()
        .map(|row| (row.country_code.as_str(), row))
        .collect();

    let mut rows: Vec<ScanPlanRow> = cost_index_by_country
        .iter()
        .map(|(code, ci)| {
            let hist = history_by_code.get(code.as_str());
            ScanPlanRow {
                country_code: code.clone(),
                country_name: hist
                    .map(|h| h.country_name.clone())
                    .unwrap_or_else(|| code.clone()),
                cost_index: *ci,
                avg_median_price: hist.map(|h| h.avg_median_price),
                normalized_median: hist.map(|h| h.normalized_median),
                scan_weight: (weights.get(code).copied().unwrap_or(1.0) * 100.0).round() / 100.0,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.scan_weight
            .partial_cmp(&a.scan_weight)
            .unwrap_or(Ordering::Equal)
    });
    rows
}

#[derive(Debug, Clone, Deserialize)]
struct DestinationsEntry {
    country_code: String,
    country_name: String,
    #[serde(default)]
    cities: Vec<CityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CityEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        vendor_ref: BTreeMap<String, String>,
    },
}

pub fn load_destinations(path: impl AsRef<Path>) -> Result<Vec<Destination>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let entries: Vec<DestinationsEntry> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut destinations = Vec::new();
    for entry in entries {
        for city in entry.cities {
            let (city_name, vendor_ref) = match city {
                CityEntry::Name(name) => (name, BTreeMap::new()),
                CityEntry::Full { name, vendor_ref } => (name, vendor_ref),
            };
            destinations.push(Destination {
                country_code: entry.country_code.clone(),
                country_name: entry.country_name.clone(),
                city_name,
                vendor_ref,
            });
        }
    }
    Ok(destinations)
}

#[derive(Debug, Clone, Deserialize)]
struct CostIndexEntry {
    country_code: String,
    cost_index: f64,
}

pub fn load_country_cost_index(path: impl AsRef<Path>) -> Result<BTreeMap<String, f64>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let entries: Vec<CostIndexEntry> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(entries
        .into_iter()
        .map(|e| (e.country_code, e.cost_index))
        .collect())
}

pub fn load_scan_config(path: impl AsRef<Path>) -> Result<ScanConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load the FX table mapping currency -> reference units per 1 unit of that
/// currency. Currency codes are upper-cased on load.
pub fn load_fx_rates(path: impl AsRef<Path>) -> Result<BTreeMap<String, f64>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let raw: BTreeMap<String, f64> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(raw.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect())
}

/// Scan parameters shared by the CLI and the web API.
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub alpha_override: Option<f64>,
    pub min_rating_override: Option<f64>,
    pub min_stars_override: Option<u8>,
    pub base_currency: String,
    /// When false the run id is withheld from the outcome. The run is still
    /// written to the run store, so the historical summary keeps learning
    /// from it.
    pub log_results: bool,
    pub use_optimizer: bool,
    pub optimizer_top_k: Option<usize>,
    pub optimizer_min_weight: f64,
    pub optimizer_max_weight: f64,
}

/// Configuration file locations for one process.
#[derive(Debug, Clone)]
pub struct ScanPaths {
    pub workspace_root: PathBuf,
    pub destinations_file: PathBuf,
    pub cost_index_file: PathBuf,
    pub scanner_config_file: PathBuf,
    pub fx_rates_file: PathBuf,
    pub vendors_file: PathBuf,
    pub db_path: PathBuf,
}

impl ScanPaths {
    pub fn from_workspace_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            destinations_file: root.join("config/destinations.yaml"),
            cost_index_file: root.join("config/country_cost_index.yaml"),
            scanner_config_file: root.join("config/scanner.yaml"),
            fx_rates_file: root.join("config/fx_rates.yaml"),
            vendors_file: root.join("config/vendors.yaml"),
            db_path: root.join("data/eustay.db"),
            workspace_root: root,
        }
    }
}

/// Everything a presentation layer needs from one scan run.
#[derive(Debug)]
pub struct ScanOutcome {
    /// `None` when the scan produced no metrics, or when the caller asked
    /// for the run id to be withheld.
    pub run_id: Option<i64>,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub vendor_names: Vec<String>,
    pub metrics_by_country: BTreeMap<String, CountryMetrics>,
    pub historical_summary: Vec<CountryHistoryRow>,
    pub country_scan_weights: Option<BTreeMap<String, f64>>,
    pub cost_index_by_country: BTreeMap<String, f64>,
    pub config: ScanConfig,
    pub base_currency: String,
}

/// Core scan runner used by both the CLI and the web service: load config,
/// build the scan plan, run the scan, log results.
pub async fn run_scan(params: &ScanParams, paths: &ScanPaths) -> Result<ScanOutcome> {
    let destinations = load_destinations(&paths.destinations_file)?;
    let cost_index_by_country = load_country_cost_index(&paths.cost_index_file)?;
    let mut config = load_scan_config(&paths.scanner_config_file)?;
    let fx_rates = load_fx_rates(&paths.fx_rates_file)?;

    if let Some(alpha) = params.alpha_override {
        config.alpha = alpha;
    }
    if let Some(min_rating) = params.min_rating_override {
        config.min_rating = Some(min_rating);
    }
    if let Some(min_stars) = params.min_stars_override {
        config.min_stars = Some(min_stars);
    }

    let vendors_config = load_vendors_config(&paths.vendors_file)?;
    let vendors = build_vendors(&vendors_config, &paths.workspace_root)?;
    let vendor_names: Vec<String> = vendors.iter().map(|v| v.name().to_string()).collect();

    let store = RunStore::open(&paths.db_path).await?;
    let historical_summary = store.historical_country_summary().await?;

    let country_scan_weights = params.use_optimizer.then(|| {
        build_country_scan_weights(
            &cost_index_by_country,
            &historical_summary,
            params.optimizer_top_k,
            params.optimizer_min_weight,
            params.optimizer_max_weight,
        )
    });

    let metrics_by_country = scan_destinations(ScanJob {
        destinations: &destinations,
        vendors: &vendors,
        checkin: params.checkin,
        checkout: params.checkout,
        min_price: params.min_price,
        max_price: params.max_price,
        cost_index_by_country: &cost_index_by_country,
        config: &config,
        fx_rates: &fx_rates,
        base_currency: &params.base_currency,
        country_scan_weights: country_scan_weights.as_ref(),
    })
    .await;

    let run_id = if metrics_by_country.is_empty() {
        None
    } else {
        let run_id = store
            .log_run(
                params.checkin,
                params.checkout,
                config.scan_mode.as_str(),
                config.alpha,
                params.min_price,
                params.max_price,
            )
            .await?;
        store.log_country_metrics(run_id, &metrics_by_country).await?;
        info!(run_id, countries = metrics_by_country.len(), "scan logged");
        // Every run feeds the optimizer's history; log_results only controls
        // whether the id is reported back.
        params.log_results.then_some(run_id)
    };

    Ok(ScanOutcome {
        run_id,
        checkin: params.checkin,
        checkout: params.checkout,
        vendor_names,
        metrics_by_country,
        historical_summary,
        country_scan_weights,
        cost_index_by_country,
        config,
        base_currency: params.base_currency.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eustay_vendors::{MockVendor, VendorError};

    fn dates() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2026, 7, 10).unwrap(),
            NaiveDate::from_ymd_opt(2026, 7, 12).unwrap(),
        )
    }

    fn offer(city: &str, hotel: &str, price: f64) -> Offer {
        let (checkin, checkout) = dates();
        Offer {
            vendor: "mock_vendor".to_string(),
            country_code: "BG".to_string(),
            country_name: "Bulgaria".to_string(),
            city_name: city.to_string(),
            checkin,
            checkout,
            hotel_name: hotel.to_string(),
            total_price: price * 2.0,
            currency: "EUR".to_string(),
            price_per_night: price,
            rating: None,
            stars: None,
            deeplink: None,
        }
    }

    fn zero_delay_config() -> ScanConfig {
        ScanConfig {
            delay_seconds: DelayRange { min: 0.0, max: 0.0 },
            ..ScanConfig::default()
        }
    }

    fn eur_usd_rates() -> BTreeMap<String, f64> {
        BTreeMap::from([("EUR".to_string(), 1.0), ("USD".to_string(), 0.5)])
    }

    #[test]
    fn cheaper_countries_get_larger_budgets() {
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        let cheap = country_budget(&config, 0.8, 1.0, 10).unwrap();
        let pricey = country_budget(&config, 1.6, 1.0, 10).unwrap();
        assert!(cheap.target_cities >= pricey.target_cities);
        assert!(cheap.max_offers_per_destination >= pricey.max_offers_per_destination);
    }

    #[test]
    fn budget_floors_apply() {
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            base_cities_per_country: 1,
            base_offers_per_destination: 10,
            ..zero_delay_config()
        };
        // Very expensive country still gets 1 city and 10 offers.
        let budget = country_budget(&config, 5.0, 1.0, 4).unwrap();
        assert_eq!(budget.target_cities, 1);
        assert_eq!(budget.max_offers_per_destination, 10);
    }

    #[test]
    fn budget_is_capped_by_available_cities() {
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            base_cities_per_country: 10,
            ..zero_delay_config()
        };
        let budget = country_budget(&config, 0.5, 2.0, 3).unwrap();
        assert_eq!(budget.target_cities, 3);
    }

    #[test]
    fn cheap_only_mode_skips_expensive_countries() {
        let config = zero_delay_config();
        assert!(country_budget(&config, 2.0, 1.0, 5).is_none());
        assert!(country_budget(&config, 1.7, 1.0, 5).is_some());
        // The ceiling itself is still eligible.
        assert!(country_budget(&config, 1.8, 1.0, 5).is_some());
    }

    #[test]
    fn non_positive_weight_skips_regardless_of_mode() {
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        assert!(country_budget(&config, 0.5, 0.0, 5).is_none());
        assert!(country_budget(&config, 0.5, -1.0, 5).is_none());
    }

    #[test]
    fn convert_amount_symmetry() {
        let rates = eur_usd_rates();
        let eur = convert_amount(10.0, "USD", "EUR", &rates);
        assert!((eur - 5.0).abs() < 1e-9);
        let usd = convert_amount(5.0, "EUR", "USD", &rates);
        assert!((usd - 10.0).abs() < 1e-9);
    }

    #[test]
    fn convert_amount_identity_without_rate_lookup() {
        let rates = BTreeMap::new();
        assert_eq!(convert_amount(42.0, "GBP", "gbp", &rates), 42.0);
    }

    #[test]
    fn convert_amount_falls_back_on_missing_rate() {
        let rates = eur_usd_rates();
        assert_eq!(convert_amount(42.0, "GBP", "EUR", &rates), 42.0);
        assert_eq!(convert_amount(42.0, "EUR", "GBP", &rates), 42.0);
    }

    #[test]
    fn dedupe_keeps_cheapest_per_city_and_hotel() {
        let offers = vec![
            offer("Sofia", "Grand Hotel", 80.0),
            offer("Sofia", "  grand hotel ", 65.0),
            offer("Sofia", "Other Hotel", 90.0),
        ];
        let deduped = dedupe_offers(offers);
        assert_eq!(deduped.len(), 2);
        let grand = deduped
            .iter()
            .find(|o| o.hotel_name.trim().eq_ignore_ascii_case("grand hotel"))
            .unwrap();
        assert_eq!(grand.price_per_night, 65.0);
    }

    #[test]
    fn dedupe_does_not_merge_across_cities() {
        let offers = vec![
            offer("Sofia", "Grand Hotel", 80.0),
            offer("Plovdiv", "Grand Hotel", 65.0),
        ];
        assert_eq!(dedupe_offers(offers).len(), 2);
    }

    #[test]
    fn quality_filters_drop_missing_and_low_values() {
        let config = ScanConfig {
            min_rating: Some(8.0),
            min_stars: Some(3),
            ..zero_delay_config()
        };
        let mut good = offer("Sofia", "A", 50.0);
        good.rating = Some(8.5);
        good.stars = Some(4);
        assert!(passes_quality_filters(&good, &config));

        let mut low_rating = good.clone();
        low_rating.rating = Some(7.9);
        assert!(!passes_quality_filters(&low_rating, &config));

        let mut missing_stars = good.clone();
        missing_stars.stars = None;
        assert!(!passes_quality_filters(&missing_stars, &config));

        // No thresholds configured means no filtering on either axis.
        let unfiltered = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        assert!(passes_quality_filters(&offer("Sofia", "B", 10.0), &unfiltered));
    }

    #[test]
    fn metrics_match_truncating_p90_formula() {
        let offers: Vec<Offer> = [20.0, 30.0, 40.0, 50.0, 60.0]
            .iter()
            .enumerate()
            .map(|(i, p)| offer("Sofia", &format!("Hotel {i}"), *p))
            .collect();
        let rates = eur_usd_rates();

        let metrics =
            compute_country_metrics("BG", "Bulgaria", offers, 1.0, 1.0, &rates, "EUR").unwrap();
        assert_eq!(metrics.min_price_per_night, 20.0);
        assert_eq!(metrics.median_price_per_night, 40.0);
        // n = 5: trunc(4.5) - 1 = 3 -> 50.0
        assert_eq!(metrics.p90_price_per_night, 50.0);
        assert_eq!(metrics.offer_count, 5);
    }

    #[test]
    fn metrics_even_count_uses_statistical_median() {
        let offers: Vec<Offer> = [20.0, 30.0, 50.0, 60.0]
            .iter()
            .enumerate()
            .map(|(i, p)| offer("Sofia", &format!("Hotel {i}"), *p))
            .collect();
        let metrics =
            compute_country_metrics("BG", "Bulgaria", offers, 1.0, 1.0, &eur_usd_rates(), "EUR")
                .unwrap();
        assert_eq!(metrics.median_price_per_night, 40.0);
    }

    #[test]
    fn metrics_apply_cost_factor_and_alpha() {
        let offers = vec![offer("Sofia", "A", 50.0)];
        let metrics =
            compute_country_metrics("DK", "Denmark", offers.clone(), 2.0, 1.0, &eur_usd_rates(), "EUR")
                .unwrap();
        assert!((metrics.effective_min_price - 100.0).abs() < 1e-9);
        assert!((metrics.offers[0].effective_score - 100.0).abs() < 1e-9);

        // Alpha 0 makes effective and raw values identical.
        let neutral =
            compute_country_metrics("DK", "Denmark", offers, 2.0, 0.0, &eur_usd_rates(), "EUR")
                .unwrap();
        assert_eq!(neutral.effective_min_price, neutral.min_price_per_night);
    }

    #[test]
    fn metrics_normalize_into_base_currency_and_sort() {
        let mut usd = offer("Sofia", "Dollar Hotel", 10.0);
        usd.currency = "USD".to_string();
        let offers = vec![offer("Sofia", "Euro Hotel", 9.0), usd];

        let metrics =
            compute_country_metrics("BG", "Bulgaria", offers, 1.0, 1.0, &eur_usd_rates(), "EUR")
                .unwrap();
        // 10 USD -> 5 EUR sorts before 9 EUR.
        assert_eq!(metrics.offers[0].offer.hotel_name, "Dollar Hotel");
        assert_eq!(metrics.offers[0].price_base, 5.0);
        assert_eq!(metrics.min_price_per_night, 5.0);
    }

    #[test]
    fn metrics_segment_medians_by_quality() {
        let mut cheap = offer("Sofia", "Cheap", 30.0);
        cheap.rating = Some(7.0);
        cheap.stars = Some(2);
        let mut rated = offer("Sofia", "Rated", 70.0);
        rated.rating = Some(8.6);
        rated.stars = Some(4);

        let metrics = compute_country_metrics(
            "BG",
            "Bulgaria",
            vec![cheap, rated],
            1.0,
            1.0,
            &eur_usd_rates(),
            "EUR",
        )
        .unwrap();
        assert_eq!(metrics.offer_count_quality_filtered, 1);
        assert_eq!(metrics.median_price_high_rating, Some(70.0));
        assert_eq!(metrics.median_price_3plus_stars, Some(70.0));
    }

    #[test]
    fn metrics_empty_input_yields_none() {
        assert!(compute_country_metrics(
            "BG",
            "Bulgaria",
            Vec::new(),
            1.0,
            1.0,
            &eur_usd_rates(),
            "EUR"
        )
        .is_none());
    }

    fn history_row(code: &str, name: &str, ci: f64, avg_median: f64) -> CountryHistoryRow {
        CountryHistoryRow {
            country_code: code.to_string(),
            country_name: name.to_string(),
            cost_index: ci,
            avg_median_price: avg_median,
            avg_effective_median: avg_median * ci,
            normalized_median: avg_median / ci,
        }
    }

    #[test]
    fn historically_cheap_country_outranks_expensive_one() {
        let cost_index =
            BTreeMap::from([("BG".to_string(), 1.0), ("DK".to_string(), 2.0)]);
        let history = vec![
            history_row("BG", "Bulgaria", 1.0, 50.0),
            history_row("DK", "Denmark", 2.0, 200.0),
        ];

        let weights = build_country_scan_weights(&cost_index, &history, None, 0.5, 2.0);
        assert!(weights["BG"] > weights["DK"]);
    }

    #[test]
    fn top_k_zeroes_all_but_k_countries() {
        let cost_index = BTreeMap::from([
            ("BG".to_string(), 1.0),
            ("RO".to_string(), 1.1),
            ("PT".to_string(), 1.3),
            ("DK".to_string(), 2.2),
        ]);

        let weights = build_country_scan_weights(&cost_index, &[], Some(2), 0.5, 2.0);
        let non_zero: Vec<_> = weights.iter().filter(|(_, w)| **w > 0.0).collect();
        assert_eq!(non_zero.len(), 2);
        assert_eq!(weights["DK"], 0.0);
        assert_eq!(weights["PT"], 0.0);
    }

    #[test]
    fn weights_are_clamped_into_configured_range() {
        let cost_index = BTreeMap::from([
            ("BG".to_string(), 0.5),
            ("RO".to_string(), 1.0),
            ("DK".to_string(), 8.0),
        ]);
        let weights = build_country_scan_weights(&cost_index, &[], None, 0.5, 2.0);
        for w in weights.values() {
            assert!((0.5..=2.0).contains(w));
        }
    }

    #[test]
    fn scan_plan_rows_sort_by_weight() {
        let cost_index =
            BTreeMap::from([("BG".to_string(), 1.0), ("DK".to_string(), 2.0)]);
        let history = vec![history_row("BG", "Bulgaria", 1.0, 50.0)];
        let weights = build_country_scan_weights(&cost_index, &history, None, 0.5, 2.0);
        let rows = summarize_country_weights(&cost_index, &history, &weights);

        // DK has no history, so its raw weight is the bare cost-index prior,
        // which here beats BG's history-dampened score.
        assert_eq!(rows[0].country_code, "DK");
        assert_eq!(rows[0].country_name, "DK");
        assert_eq!(rows[0].normalized_median, None);
        assert_eq!(rows[1].country_code, "BG");
        assert_eq!(rows[1].country_name, "Bulgaria");
        assert_eq!(rows[1].normalized_median, Some(50.0));
        assert!(rows[0].scan_weight >= rows[1].scan_weight);
    }

    struct FixedVendor {
        name: String,
        offers: Vec<Offer>,
    }

    #[async_trait]
    impl HotelVendor for FixedVendor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search_offers(
            &self,
            destination: &Destination,
            _checkin: NaiveDate,
            _checkout: NaiveDate,
            _min_price: Option<f64>,
            _max_price: Option<f64>,
            _limit: usize,
        ) -> Result<Vec<Offer>, VendorError> {
            Ok(self
                .offers
                .iter()
                .filter(|o| o.city_name == destination.city_name)
                .cloned()
                .collect())
        }
    }

    struct FailingVendor;

    #[async_trait]
    impl HotelVendor for FailingVendor {
        fn name(&self) -> &str {
            "failing_vendor"
        }

        async fn search_offers(
            &self,
            _destination: &Destination,
            _checkin: NaiveDate,
            _checkout: NaiveDate,
            _min_price: Option<f64>,
            _max_price: Option<f64>,
            _limit: usize,
        ) -> Result<Vec<Offer>, VendorError> {
            Err(VendorError::Message("connection reset".to_string()))
        }
    }

    fn bulgaria_destinations() -> Vec<Destination> {
        ["Plovdiv", "Sofia"]
            .iter()
            .map(|city| Destination {
                country_code: "BG".to_string(),
                country_name: "Bulgaria".to_string(),
                city_name: city.to_string(),
                vendor_ref: BTreeMap::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn scan_is_deterministic_with_seeded_vendor() {
        let destinations = bulgaria_destinations();
        let vendors: Vec<Box<dyn HotelVendor>> = vec![Box::new(MockVendor::with_seed(42))];
        let cost_index = BTreeMap::from([("BG".to_string(), 1.0)]);
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        let rates = eur_usd_rates();
        let (checkin, checkout) = dates();

        let job = || ScanJob {
            destinations: &destinations,
            vendors: &vendors,
            checkin,
            checkout,
            min_price: None,
            max_price: None,
            cost_index_by_country: &cost_index,
            config: &config,
            fx_rates: &rates,
            base_currency: "EUR",
            country_scan_weights: None,
        };

        let first = scan_destinations(job()).await;
        let second = scan_destinations(job()).await;
        assert_eq!(first, second);
        assert!(first.contains_key("BG"));
        assert!(first["BG"].offer_count > 0);
    }

    #[tokio::test]
    async fn dedup_scope_is_per_destination_not_per_country() {
        let destinations = bulgaria_destinations();
        let vendors: Vec<Box<dyn HotelVendor>> = vec![Box::new(FixedVendor {
            name: "fixed".to_string(),
            offers: vec![
                offer("Sofia", "Grand Hotel", 80.0),
                offer("Plovdiv", "Grand Hotel", 60.0),
            ],
        })];
        let cost_index = BTreeMap::from([("BG".to_string(), 1.0)]);
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        let rates = eur_usd_rates();
        let (checkin, checkout) = dates();

        let metrics = scan_destinations(ScanJob {
            destinations: &destinations,
            vendors: &vendors,
            checkin,
            checkout,
            min_price: None,
            max_price: None,
            cost_index_by_country: &cost_index,
            config: &config,
            fx_rates: &rates,
            base_currency: "EUR",
            country_scan_weights: None,
        })
        .await;

        // Same hotel name in two cities survives as two offers.
        assert_eq!(metrics["BG"].offer_count, 2);
    }

    #[tokio::test]
    async fn failing_vendor_does_not_abort_the_scan() {
        let destinations = bulgaria_destinations();
        let vendors: Vec<Box<dyn HotelVendor>> = vec![
            Box::new(FailingVendor),
            Box::new(FixedVendor {
                name: "fixed".to_string(),
                offers: vec![offer("Sofia", "Grand Hotel", 80.0)],
            }),
        ];
        let cost_index = BTreeMap::from([("BG".to_string(), 1.0)]);
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        let rates = eur_usd_rates();
        let (checkin, checkout) = dates();

        let metrics = scan_destinations(ScanJob {
            destinations: &destinations,
            vendors: &vendors,
            checkin,
            checkout,
            min_price: None,
            max_price: None,
            cost_index_by_country: &cost_index,
            config: &config,
            fx_rates: &rates,
            base_currency: "EUR",
            country_scan_weights: None,
        })
        .await;

        assert_eq!(metrics["BG"].offer_count, 1);
    }

    #[tokio::test]
    async fn zero_weight_excludes_a_country_from_the_scan() {
        let destinations = bulgaria_destinations();
        let vendors: Vec<Box<dyn HotelVendor>> = vec![Box::new(MockVendor::with_seed(1))];
        let cost_index = BTreeMap::from([("BG".to_string(), 1.0)]);
        let config = ScanConfig {
            scan_mode: ScanMode::All,
            ..zero_delay_config()
        };
        let rates = eur_usd_rates();
        let weights = BTreeMap::from([("BG".to_string(), 0.0)]);
        let (checkin, checkout) = dates();

        let metrics = scan_destinations(ScanJob {
            destinations: &destinations,
            vendors: &vendors,
            checkin,
            checkout,
            min_price: None,
            max_price: None,
            cost_index_by_country: &cost_index,
            config: &config,
            fx_rates: &rates,
            base_currency: "EUR",
            country_scan_weights: Some(&weights),
        })
        .await;

        assert!(metrics.is_empty());
    }

    fn seeded_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).expect("config dir");

        std::fs::write(
            config_dir.join("destinations.yaml"),
            "- country_code: BG\n  country_name: Bulgaria\n  cities:\n    - Sofia\n    - name: Plovdiv\n      vendor_ref:\n        booking: \"1234\"\n",
        )
        .expect("destinations");
        std::fs::write(
            config_dir.join("country_cost_index.yaml"),
            "- country_code: BG\n  cost_index: 0.9\n",
        )
        .expect("cost index");
        std::fs::write(
            config_dir.join("scanner.yaml"),
            "scan_mode: cheap_only\ndelay_seconds:\n  min: 0.0\n  max: 0.0\n",
        )
        .expect("scanner");
        std::fs::write(config_dir.join("fx_rates.yaml"), "EUR: 1.0\nUSD: 0.92\n")
            .expect("fx rates");
        std::fs::write(
            config_dir.join("vendors.yaml"),
            "mode: mock\nmock:\n  enabled: true\n  seed: 7\n",
        )
        .expect("vendors");
        dir
    }

    #[tokio::test]
    async fn run_scan_smoke_logs_a_run() {
        let dir = seeded_workspace();
        let paths = ScanPaths::from_workspace_root(dir.path());
        let (checkin, checkout) = dates();
        let params = ScanParams {
            checkin,
            checkout,
            min_price: None,
            max_price: None,
            alpha_override: None,
            min_rating_override: None,
            min_stars_override: None,
            base_currency: "EUR".to_string(),
            log_results: true,
            use_optimizer: false,
            optimizer_top_k: None,
            optimizer_min_weight: 0.5,
            optimizer_max_weight: 2.0,
        };

        let outcome = run_scan(&params, &paths).await.expect("scan");
        assert!(outcome.run_id.is_some());
        assert!(outcome.metrics_by_country.contains_key("BG"));
        assert_eq!(outcome.vendor_names, vec!["mock_vendor".to_string()]);

        // A second run sees the first run's history.
        let outcome2 = run_scan(&params, &paths).await.expect("second scan");
        assert!(outcome2.run_id > outcome.run_id);
        assert_eq!(outcome2.historical_summary.len(), 1);
        assert_eq!(outcome2.historical_summary[0].country_code, "BG");
    }

    #[tokio::test]
    async fn withheld_run_id_still_records_history() {
        let dir = seeded_workspace();
        let paths = ScanPaths::from_workspace_root(dir.path());
        let (checkin, checkout) = dates();
        let params = ScanParams {
            checkin,
            checkout,
            min_price: None,
            max_price: None,
            alpha_override: None,
            min_rating_override: None,
            min_stars_override: None,
            base_currency: "EUR".to_string(),
            log_results: false,
            use_optimizer: false,
            optimizer_top_k: None,
            optimizer_min_weight: 0.5,
            optimizer_max_weight: 2.0,
        };

        let outcome = run_scan(&params, &paths).await.expect("scan");
        assert!(outcome.run_id.is_none());
        assert!(!outcome.metrics_by_country.is_empty());

        // The run was recorded anyway, so the next scan's optimizer input
        // includes it.
        let outcome2 = run_scan(&params, &paths).await.expect("second scan");
        assert_eq!(outcome2.historical_summary.len(), 1);
        assert_eq!(outcome2.historical_summary[0].country_code, "BG");
    }
}

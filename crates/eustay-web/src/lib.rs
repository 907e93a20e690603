//! JSON API over the scan engine and run store.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use eustay_core::CountryMetrics;
use eustay_engine::{run_scan, ScanOutcome, ScanParams, ScanPaths};
use eustay_storage::RunStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "eustay-web";

/// Offers per country returned in a scan response.
const TOP_OFFERS_PER_COUNTRY: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub paths: ScanPaths,
}

impl AppState {
    pub fn new(paths: ScanPaths) -> Self {
        Self { paths }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/historical-summary", get(historical_summary_handler))
        .route("/scan", post(scan_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("EUSTAY_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(ScanPaths::from_workspace_root("."));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub min_stars: Option<u8>,
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    /// With `false` the response carries `run_id: -1`. The run is still
    /// recorded so the optimizer's history stays complete.
    #[serde(default = "default_true")]
    pub log_results: bool,
    #[serde(default)]
    pub use_optimizer: bool,
    #[serde(default)]
    pub optimizer_top_k: Option<usize>,
    #[serde(default = "default_min_weight")]
    pub optimizer_min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub optimizer_max_weight: f64,
}

fn default_base_currency() -> String {
    "EUR".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_weight() -> f64 {
    0.5
}

fn default_max_weight() -> f64 {
    2.0
}

#[derive(Debug, Serialize)]
pub struct OfferReport {
    pub vendor: String,
    pub city_name: String,
    pub hotel_name: String,
    pub price_per_night: f64,
    pub effective_score: f64,
    pub rating: Option<f64>,
    pub stars: Option<u8>,
    pub deeplink: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountryReport {
    pub country_code: String,
    pub country_name: String,
    pub cost_index: f64,
    pub min_price_per_night: f64,
    pub median_price_per_night: f64,
    pub p90_price_per_night: f64,
    pub effective_min_price: f64,
    pub effective_median_price: f64,
    pub offer_count: usize,
    pub median_price_high_rating: Option<f64>,
    pub median_price_3plus_stars: Option<f64>,
    pub top_offers: Vec<OfferReport>,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    /// -1 when the run id was withheld or no metrics were produced.
    pub run_id: i64,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub base_currency: String,
    pub vendors: Vec<String>,
    /// Sorted ascending by effective minimum price, best value first.
    pub countries: Vec<CountryReport>,
}

fn country_report(metrics: &CountryMetrics) -> CountryReport {
    let mut scored: Vec<_> = metrics.offers.iter().collect();
    scored.sort_by(|a, b| {
        a.effective_score
            .partial_cmp(&b.effective_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let top_offers = scored
        .into_iter()
        .take(TOP_OFFERS_PER_COUNTRY)
        .map(|s| OfferReport {
            vendor: s.offer.vendor.clone(),
            city_name: s.offer.city_name.clone(),
            hotel_name: s.offer.hotel_name.clone(),
            price_per_night: s.price_base,
            effective_score: s.effective_score,
            rating: s.offer.rating,
            stars: s.offer.stars,
            deeplink: s.offer.deeplink.clone(),
        })
        .collect();

    CountryReport {
        country_code: metrics.country_code.clone(),
        country_name: metrics.country_name.clone(),
        cost_index: metrics.cost_index,
        min_price_per_night: metrics.min_price_per_night,
        median_price_per_night: metrics.median_price_per_night,
        p90_price_per_night: metrics.p90_price_per_night,
        effective_min_price: metrics.effective_min_price,
        effective_median_price: metrics.effective_median_price,
        offer_count: metrics.offer_count,
        median_price_high_rating: metrics.median_price_high_rating,
        median_price_3plus_stars: metrics.median_price_3plus_stars,
        top_offers,
    }
}

pub fn scan_response(outcome: &ScanOutcome) -> ScanResponse {
    let mut countries: Vec<CountryReport> =
        outcome.metrics_by_country.values().map(country_report).collect();
    countries.sort_by(|a, b| {
        a.effective_min_price
            .partial_cmp(&b.effective_min_price)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    ScanResponse {
        run_id: outcome.run_id.unwrap_or(-1),
        checkin: outcome.checkin,
        checkout: outcome.checkout,
        base_currency: outcome.base_currency.clone(),
        vendors: outcome.vendor_names.clone(),
        countries,
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn historical_summary_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = async {
        let store = RunStore::open(&state.paths.db_path).await?;
        store.historical_country_summary().await
    }
    .await;

    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScanRequest>,
) -> Response {
    if request.checkout <= request.checkin {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "checkout must be after checkin" })),
        )
            .into_response();
    }

    let params = ScanParams {
        checkin: request.checkin,
        checkout: request.checkout,
        min_price: request.min_price,
        max_price: request.max_price,
        alpha_override: request.alpha,
        min_rating_override: request.min_rating,
        min_stars_override: request.min_stars,
        base_currency: request.base_currency,
        log_results: request.log_results,
        use_optimizer: request.use_optimizer,
        optimizer_top_k: request.optimizer_top_k,
        optimizer_min_weight: request.optimizer_min_weight,
        optimizer_max_weight: request.optimizer_max_weight,
    };

    match run_scan(&params, &state.paths).await {
        Ok(outcome) => Json(scan_response(&outcome)).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

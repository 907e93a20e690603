//! Response cache, persistent run store and HTTP fetch helper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use eustay_core::{CountryHistoryRow, CountryMetrics};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "eustay-storage";

/// File-based response cache for vendor payloads.
///
/// Stores JSON payloads under a sha256-addressed filename; expiry is based
/// on file modification time. Used only to reduce vendor calls, so every
/// failure path degrades to a cache miss.
#[derive(Debug, Clone)]
pub struct FileResponseCache {
    root: PathBuf,
    ttl: Duration,
}

impl FileResponseCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn sha256_hex(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::sha256_hex(key)))
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        let path = self.path_for_key(key);
        let meta = fs::metadata(&path).await.ok()?;

        if !self.ttl.is_zero() {
            let modified = meta.modified().ok()?;
            let age = SystemTime::now().duration_since(modified).ok()?;
            if age > self.ttl {
                return None;
            }
        }

        let text = fs::read_to_string(&path).await.ok()?;
        let body: JsonValue = serde_json::from_str(&text).ok()?;
        body.get("payload").cloned()
    }

    /// Atomic write via temp file + rename so a concurrent reader never sees
    /// a half-written payload.
    pub async fn set(&self, key: &str, payload: &JsonValue) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache directory {}", self.root.display()))?;

        let path = self.path_for_key(key);
        let body = serde_json::json!({
            "created_utc": Utc::now().to_rfc3339(),
            "payload": payload,
        });
        let bytes = serde_json::to_vec(&body).context("serializing cache entry")?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("renaming cache file into {}", path.display()))?;
        Ok(())
    }
}

/// Durable storage of past scan runs, backed by SQLite.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("opening run store {}", db_path.display()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private per-process database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory run store")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_utc TEXT NOT NULL,
                checkin TEXT NOT NULL,
                checkout TEXT NOT NULL,
                scan_mode TEXT NOT NULL,
                alpha REAL NOT NULL,
                min_price REAL,
                max_price REAL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating runs table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS country_metrics (
                run_id INTEGER NOT NULL,
                country_code TEXT NOT NULL,
                country_name TEXT NOT NULL,
                cost_index REAL NOT NULL,
                min_price REAL NOT NULL,
                median_price REAL NOT NULL,
                p90_price REAL NOT NULL,
                effective_min REAL NOT NULL,
                effective_median REAL NOT NULL,
                PRIMARY KEY (run_id, country_code),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating country_metrics table")?;

        Ok(())
    }

    pub async fn log_run(
        &self,
        checkin: chrono::NaiveDate,
        checkout: chrono::NaiveDate,
        scan_mode: &str,
        alpha: f64,
        min_price: Option<f64>,
        max_price: Option<f64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO runs (created_utc, checkin, checkout, scan_mode, alpha, min_price, max_price)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .bind(checkin.to_string())
        .bind(checkout.to_string())
        .bind(scan_mode)
        .bind(alpha)
        .bind(min_price)
        .bind(max_price)
        .execute(&self.pool)
        .await
        .context("inserting run row")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn log_country_metrics(
        &self,
        run_id: i64,
        metrics_by_country: &BTreeMap<String, CountryMetrics>,
    ) -> Result<()> {
        for m in metrics_by_country.values() {
            sqlx::query(
                "INSERT OR REPLACE INTO country_metrics
                 (run_id, country_code, country_name, cost_index,
                  min_price, median_price, p90_price, effective_min, effective_median)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(&m.country_code)
            .bind(&m.country_name)
            .bind(m.cost_index)
            .bind(m.min_price_per_night)
            .bind(m.median_price_per_night)
            .bind(m.p90_price_per_night)
            .bind(m.effective_min_price)
            .bind(m.effective_median_price)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting metrics for {}", m.country_code))?;
        }
        Ok(())
    }

    pub async fn latest_run_id(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM runs ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("querying latest run id")?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    /// Reduce all logged runs to one row per country, comparing average
    /// observed medians against the static cost index.
    pub async fn historical_country_summary(&self) -> Result<Vec<CountryHistoryRow>> {
        let rows = sqlx::query(
            "SELECT
                country_code,
                country_name,
                cost_index,
                AVG(median_price) AS avg_median_price,
                AVG(effective_median) AS avg_effective_median
             FROM country_metrics
             GROUP BY country_code, country_name, cost_index",
        )
        .fetch_all(&self.pool)
        .await
        .context("querying historical country summary")?;

        let mut summary = Vec::with_capacity(rows.len());
        for row in rows {
            let cost_index: f64 = row.get("cost_index");
            let avg_median_price: f64 = row.get("avg_median_price");
            let normalized_median = if cost_index > 0.0 {
                avg_median_price / cost_index
            } else {
                avg_median_price
            };
            summary.push(CountryHistoryRow {
                country_code: row.get("country_code"),
                country_name: row.get("country_name"),
                cost_index,
                avg_median_price,
                avg_effective_median: row.get("avg_effective_median"),
                normalized_median,
            });
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin JSON-over-HTTP fetcher shared by live vendor clients.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        bearer_token: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        debug!(url, params = params.len(), "vendor fetch");
        let mut request = self.client.get(url).query(params);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

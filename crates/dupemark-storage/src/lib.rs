//! Listing repository contract + HTTP fetch and image cache utilities.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dupemark_core::{DuplicatePairRecord, Listing, MatchReason, PairKey};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dupemark-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

/// Score update for one canonical pair. `images_highest_sim` stays `None`
/// until an image scorer has run for the pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairUpsert {
    pub pair: PairKey,
    pub reason: MatchReason,
    pub details_highest_sim: f64,
    pub images_highest_sim: Option<f64>,
}

/// Narrow read/write contract between the detection core and the store.
///
/// `read_all_listings` must return a consistent snapshot; `upsert_pair` is a
/// max-merge keyed by the canonical pair, so persisted scores never move
/// downward and repeated runs are idempotent.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    async fn insert_listing(&self, listing: &Listing) -> Result<(), StorageError>;
    async fn read_all_listings(&self) -> Result<Vec<Listing>, StorageError>;
    async fn mark_images_downloaded(&self, item_id: &str) -> Result<(), StorageError>;
    async fn upsert_pair(&self, upsert: &PairUpsert) -> Result<(), StorageError>;
    async fn read_all_pairs(&self) -> Result<Vec<DuplicatePairRecord>, StorageError>;
}

fn merge_image_score(existing: Option<f64>, incoming: Option<f64>) -> Option<f64> {
    match (existing, incoming) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (Some(old), None) => Some(old),
        (None, new) => new,
    }
}

/// In-memory repository used by tests and database-less fixture runs.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: BTreeMap<String, Listing>,
    downloaded: BTreeSet<String>,
    pairs: BTreeMap<PairKey, DuplicatePairRecord>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn images_downloaded(&self, item_id: &str) -> bool {
        self.state.lock().await.downloaded.contains(item_id)
    }
}

#[async_trait]
impl ListingRepository for MemoryRepository {
    async fn insert_listing(&self, listing: &Listing) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .listings
            .insert(listing.item_id.clone(), listing.clone());
        Ok(())
    }

    async fn read_all_listings(&self) -> Result<Vec<Listing>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.listings.values().cloned().collect())
    }

    async fn mark_images_downloaded(&self, item_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.downloaded.insert(item_id.to_string());
        Ok(())
    }

    async fn upsert_pair(&self, upsert: &PairUpsert) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        match state.pairs.entry(upsert.pair.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.details_highest_sim =
                    record.details_highest_sim.max(upsert.details_highest_sim);
                record.images_highest_sim =
                    merge_image_score(record.images_highest_sim, upsert.images_highest_sim);
            }
            Entry::Vacant(entry) => {
                entry.insert(DuplicatePairRecord {
                    pair: upsert.pair.clone(),
                    reason: upsert.reason,
                    details_highest_sim: upsert.details_highest_sim,
                    images_highest_sim: upsert.images_highest_sim,
                    is_verified: false,
                    created_at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    async fn read_all_pairs(&self) -> Result<Vec<DuplicatePairRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.pairs.values().cloned().collect())
    }
}

/// Postgres repository over the `crawled_items` / `similar_items` tables.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawled_items (
                id BIGSERIAL PRIMARY KEY,
                item_number TEXT NOT NULL UNIQUE,
                seller_name TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                price TEXT NOT NULL,
                images JSONB NOT NULL DEFAULT '[]'::jsonb,
                downloaded BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS similar_items (
                id BIGSERIAL PRIMARY KEY,
                item_number1 TEXT NOT NULL,
                item_number2 TEXT NOT NULL,
                reason TEXT NOT NULL,
                details_highest_sim DOUBLE PRECISION,
                images_highest_sim DOUBLE PRECISION,
                is_verified BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (item_number1, item_number2)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ListingRepository for PgRepository {
    async fn insert_listing(&self, listing: &Listing) -> Result<(), StorageError> {
        let images = serde_json::to_value(&listing.image_urls)
            .map_err(|err| StorageError::Corrupt(format!("encoding image urls: {err}")))?;
        sqlx::query(
            r#"
            INSERT INTO crawled_items
                (item_number, seller_name, seller_id, title, description, category, price, images, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (item_number) DO UPDATE
               SET seller_name = EXCLUDED.seller_name,
                   seller_id = EXCLUDED.seller_id,
                   title = EXCLUDED.title,
                   description = EXCLUDED.description,
                   category = EXCLUDED.category,
                   price = EXCLUDED.price,
                   images = EXCLUDED.images
            "#,
        )
        .bind(&listing.item_id)
        .bind(&listing.seller_name)
        .bind(&listing.seller_id)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(&listing.category)
        .bind(&listing.price)
        .bind(&images)
        .bind(listing.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_all_listings(&self) -> Result<Vec<Listing>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT item_number, seller_name, seller_id, title, description,
                   category, price, images, created_at
              FROM crawled_items
             ORDER BY item_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let images: serde_json::Value = row.try_get("images")?;
            let image_urls = images
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(ToString::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            out.push(Listing {
                item_id: row.try_get("item_number")?,
                seller_name: row.try_get("seller_name")?,
                seller_id: row.try_get("seller_id")?,
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                category: row.try_get("category")?,
                price: row.try_get("price")?,
                image_urls,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn mark_images_downloaded(&self, item_id: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE crawled_items SET downloaded = TRUE WHERE item_number = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_pair(&self, upsert: &PairUpsert) -> Result<(), StorageError> {
        // GREATEST skips NULL operands in Postgres, which is exactly the
        // never-downgrade merge the pair invariant needs.
        sqlx::query(
            r#"
            INSERT INTO similar_items
                (item_number1, item_number2, reason, details_highest_sim, images_highest_sim)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (item_number1, item_number2) DO UPDATE
               SET details_highest_sim =
                       GREATEST(similar_items.details_highest_sim, EXCLUDED.details_highest_sim),
                   images_highest_sim =
                       GREATEST(similar_items.images_highest_sim, EXCLUDED.images_highest_sim)
            "#,
        )
        .bind(upsert.pair.first())
        .bind(upsert.pair.second())
        .bind(upsert.reason.to_string())
        .bind(upsert.details_highest_sim)
        .bind(upsert.images_highest_sim)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_all_pairs(&self) -> Result<Vec<DuplicatePairRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT item_number1, item_number2, reason, details_highest_sim,
                   images_highest_sim, is_verified, created_at
              FROM similar_items
             ORDER BY item_number1, item_number2
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let first: String = row.try_get("item_number1")?;
            let second: String = row.try_get("item_number2")?;
            let pair = PairKey::new(&first, &second).ok_or_else(|| {
                StorageError::Corrupt(format!("self-pair row for item {first}"))
            })?;
            let reason: String = row.try_get("reason")?;
            let reason = reason
                .parse::<MatchReason>()
                .map_err(StorageError::Corrupt)?;
            out.push(DuplicatePairRecord {
                pair,
                reason,
                details_highest_sim: row
                    .try_get::<Option<f64>, _>("details_highest_sim")?
                    .unwrap_or(0.0),
                images_highest_sim: row.try_get("images_highest_sim")?,
                is_verified: row.try_get("is_verified")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Per-request timeout; one unreachable asset must not stall a batch.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-timeout HTTP fetcher for listing pages and photo assets, with
/// retry classification, exponential backoff, and global plus per-host
/// concurrency limits.
#[derive(Debug)]
pub struct AssetFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| "unknown-host".to_string())
}

impl AssetFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedAsset, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let host = host_of(url);
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.expect("semaphore not closed");

        let span = info_span!("asset_fetch", %run_id, host, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedAsset {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Image cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CachedImage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable hash-addressed store for downloaded photo bytes.
///
/// Writes go through a temp file and an atomic rename, so concurrent stores
/// of the same content converge on one file.
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn image_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        item_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(item_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        item_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<CachedImage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.image_relative_path(fetched_at, item_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking cache path {}", absolute_path.display()))?
        {
            return Ok(CachedImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("cache path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(CachedImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(CachedImage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp cache file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mk_listing(item_id: &str, title: &str) -> Listing {
        Listing {
            item_id: item_id.to_string(),
            seller_id: "s-1".to_string(),
            seller_name: "Seller One".to_string(),
            title: title.to_string(),
            description: "desc".to_string(),
            category: "Mobile Phones".to_string(),
            price: "RM 100".to_string(),
            image_urls: vec![],
            created_at: Utc::now(),
        }
    }

    fn mk_upsert(a: &str, b: &str, details: f64, images: Option<f64>) -> PairUpsert {
        PairUpsert {
            pair: PairKey::new(a, b).expect("distinct ids"),
            reason: MatchReason::TitleDescSim,
            details_highest_sim: details,
            images_highest_sim: images,
        }
    }

    #[tokio::test]
    async fn memory_repo_returns_listing_snapshot() {
        let repo = MemoryRepository::new();
        repo.insert_listing(&mk_listing("b", "second")).await.expect("insert");
        repo.insert_listing(&mk_listing("a", "first")).await.expect("insert");

        let listings = repo.read_all_listings().await.expect("read");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].item_id, "a");

        repo.mark_images_downloaded("a").await.expect("mark");
        assert!(repo.images_downloaded("a").await);
        assert!(!repo.images_downloaded("b").await);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_never_downgrades() {
        let repo = MemoryRepository::new();
        repo.upsert_pair(&mk_upsert("a", "b", 72.5, None)).await.expect("upsert");
        repo.upsert_pair(&mk_upsert("a", "b", 72.5, None)).await.expect("upsert");

        let pairs = repo.read_all_pairs().await.expect("read");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].details_highest_sim, 72.5);

        // A worse later run must not erase the earlier evidence.
        repo.upsert_pair(&mk_upsert("a", "b", 55.0, None)).await.expect("upsert");
        let pairs = repo.read_all_pairs().await.expect("read");
        assert_eq!(pairs[0].details_highest_sim, 72.5);

        repo.upsert_pair(&mk_upsert("a", "b", 91.0, None)).await.expect("upsert");
        let pairs = repo.read_all_pairs().await.expect("read");
        assert_eq!(pairs[0].details_highest_sim, 91.0);
        assert!(!pairs[0].is_verified);
    }

    #[tokio::test]
    async fn image_score_fills_in_and_merges_upward() {
        let repo = MemoryRepository::new();
        repo.upsert_pair(&mk_upsert("a", "b", 60.0, None)).await.expect("upsert");
        let pairs = repo.read_all_pairs().await.expect("read");
        assert_eq!(pairs[0].images_highest_sim, None);

        repo.upsert_pair(&mk_upsert("a", "b", 60.0, Some(88.0))).await.expect("upsert");
        repo.upsert_pair(&mk_upsert("a", "b", 60.0, Some(70.0))).await.expect("upsert");
        repo.upsert_pair(&mk_upsert("a", "b", 60.0, None)).await.expect("upsert");
        let pairs = repo.read_all_pairs().await.expect("read");
        assert_eq!(pairs[0].images_highest_sim, Some(88.0));
    }

    #[test]
    fn cache_hashing_is_stable() {
        let hash = ImageCache::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn cache_deduplicates_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let cache = ImageCache::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-07-01T08:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = cache
            .store_bytes(fetched_at, "itm-1", "jpg", b"same-photo-bytes")
            .await
            .expect("first store");
        let second = cache
            .store_bytes(fetched_at, "itm-1", "jpg", b"same-photo-bytes")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn host_extraction_tolerates_bad_urls() {
        assert_eq!(host_of("https://img.example.com/p/1.jpg"), "img.example.com");
        assert_eq!(host_of("not a url"), "unknown-host");
    }
}

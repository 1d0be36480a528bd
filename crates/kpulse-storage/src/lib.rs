//! Outbound request gating, response caching, retry policy and metrics cache storage for kpulse.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kpulse_core::MetricsCacheRecord;
use moka::sync::Cache;
use moka::Expiry;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kpulse-storage";

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub max_concurrent: usize,
    pub min_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            min_interval: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone, Copy, Error)]
#[error("request gate is closed")]
pub struct GateClosed;

/// Process-wide throttle in front of the CRM.
#[derive(Debug)]
pub struct RequestGate {
    permits: Semaphore,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(config: GateConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            permits: Semaphore::new(max_concurrent),
            min_interval: config.min_interval,
            last_start: Mutex::new(None),
        }
    }

    pub async fn schedule<F, Fut, T>(&self, task: F) -> Result<T, GateClosed>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| GateClosed)?;
        self.wait_for_slot().await;
        Ok(task().await)
    }

    async fn wait_for_slot(&self) {
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_start = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    pub value: V,
    pub expires_at: std::time::Instant,
    ttl: Duration,
}

struct PerEntryTtl;

impl<V> Expiry<String, CachedEntry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedEntry<V>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Clone)]
pub struct ResponseCache<V> {
    inner: Cache<String, CachedEntry<V>>,
    default_ttl: Duration,
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { inner, default_ttl }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.inner.get(key)?;
        if entry.expires_at <= std::time::Instant::now() {
            self.inner.invalidate(key);
            return None;
        }
        Some(entry.value)
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CachedEntry {
            value,
            expires_at: std::time::Instant::now() + ttl,
            ttl,
        };
        self.inner.insert(key.into(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.inner.invalidate(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.iter().map(|(key, _)| key.as_ref().clone()).collect()
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let doomed = self
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect::<Vec<_>>();
        for key in &doomed {
            self.inner.invalidate(key.as_str());
        }
        debug!(prefix, removed = doomed.len(), "invalidated cache prefix");
        doomed.len()
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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

/// Bounded retry schedule; the wait after attempt `n` is `n² × base_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let factor = attempt.saturating_mul(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32, disposition: RetryDisposition) -> bool {
        disposition == RetryDisposition::Retryable && attempt < self.max_attempts.max(1)
    }
}

/// Durable key-value store behind the metrics cache, unique on (user, cache key).
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn read(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Option<MetricsCacheRecord>>;

    async fn upsert(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
        record: &MetricsCacheRecord,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetrics {
    user_id: String,
    cache_key: String,
    connection_id: Option<String>,
    record: MetricsCacheRecord,
}

impl StoredMetrics {
    fn visible_to(&self, connection_id: Option<&str>) -> bool {
        match connection_id {
            Some(wanted) => self.connection_id.as_deref() == Some(wanted),
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    rows: Mutex<HashMap<(String, String), StoredMetrics>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn read(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Option<MetricsCacheRecord>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(user_id.to_string(), cache_key.to_string()))
            .filter(|row| row.visible_to(connection_id))
            .map(|row| row.record.clone()))
    }

    async fn upsert(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
        record: &MetricsCacheRecord,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().await;
        rows.insert(
            (user_id.to_string(), cache_key.to_string()),
            StoredMetrics {
                user_id: user_id.to_string(),
                cache_key: cache_key.to_string(),
                connection_id: connection_id.map(ToString::to_string),
                record: record.clone(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileMetricsStore {
    root: PathBuf,
}

impl FileMetricsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn record_relative_path(user_id: &str, cache_key: &str) -> PathBuf {
        let hash = Self::sha256_hex(format!("{user_id}\0{cache_key}").as_bytes());
        PathBuf::from(&hash[..2]).join(format!("{hash}.json"))
    }
}

#[async_trait]
impl MetricsStore for FileMetricsStore {
    async fn read(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Option<MetricsCacheRecord>> {
        let path = self.root.join(Self::record_relative_path(user_id, cache_key));
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking metrics record {}", path.display()))?
        {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading metrics record {}", path.display()))?;
        let stored: StoredMetrics = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing metrics record {}", path.display()))?;

        if stored.user_id != user_id || stored.cache_key != cache_key {
            return Ok(None);
        }
        Ok(stored
            .visible_to(connection_id)
            .then_some(stored.record))
    }

    async fn upsert(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
        record: &MetricsCacheRecord,
    ) -> anyhow::Result<()> {
        let relative_path = Self::record_relative_path(user_id, cache_key);
        let absolute_path = self.root.join(&relative_path);
        let directory = match relative_path.parent() {
            Some(parent) => self.root.join(parent),
            None => self.root.clone(),
        };
        fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("creating metrics directory {}", directory.display()))?;

        let document = StoredMetrics {
            user_id: user_id.to_string(),
            cache_key: cache_key.to_string(),
            connection_id: connection_id.map(ToString::to_string),
            record: record.clone(),
        };
        let bytes = serde_json::to_vec(&document).context("serializing metrics record")?;

        let temp_path = directory.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp metrics file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp metrics file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp metrics file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp metrics file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgMetricsStore {
    pool: PgPool,
}

impl PgMetricsStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to metrics database")?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics_cache (
                user_id        TEXT        NOT NULL,
                connection_id  TEXT,
                cache_key      TEXT        NOT NULL,
                payload        JSONB       NOT NULL,
                ttl_expires_at TIMESTAMPTZ NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (user_id, cache_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating metrics_cache table")?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for PgMetricsStore {
    async fn read(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Option<MetricsCacheRecord>> {
        let row = sqlx::query(
            r#"
            SELECT payload, ttl_expires_at, updated_at
              FROM metrics_cache
             WHERE user_id = $1
               AND cache_key = $2
               AND ($3::text IS NULL OR connection_id = $3)
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(cache_key)
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .context("reading metrics_cache")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(MetricsCacheRecord {
            payload: row.try_get("payload")?,
            ttl_expires_at: row.try_get("ttl_expires_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn upsert(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
        record: &MetricsCacheRecord,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics_cache (user_id, connection_id, cache_key, payload, ttl_expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, cache_key) DO UPDATE
               SET connection_id = EXCLUDED.connection_id,
                   payload = EXCLUDED.payload,
                   ttl_expires_at = EXCLUDED.ttl_expires_at,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user_id)
        .bind(connection_id)
        .bind(cache_key)
        .bind(&record.payload)
        .bind(record.ttl_expires_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .context("writing metrics_cache")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsCacheConfig {
    pub ttl: Duration,
    pub force_cooldown: Duration,
}

impl Default for MetricsCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            force_cooldown: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    Serve {
        record: MetricsCacheRecord,
        /// Non-zero when a forced refresh was refused by the cooldown.
        cooldown_remaining_secs: u64,
    },
    Recompute,
}

/// TTL and force-refresh cooldown bookkeeping over a [`MetricsStore`].
#[derive(Clone)]
pub struct MetricsCache {
    store: Arc<dyn MetricsStore>,
    config: MetricsCacheConfig,
}

impl MetricsCache {
    pub fn new(store: Arc<dyn MetricsStore>, config: MetricsCacheConfig) -> Self {
        Self { store, config }
    }

    pub async fn read(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
    ) -> anyhow::Result<Option<MetricsCacheRecord>> {
        self.store.read(user_id, cache_key, connection_id).await
    }

    pub async fn write(
        &self,
        user_id: &str,
        cache_key: &str,
        connection_id: Option<&str>,
        payload: serde_json::Value,
    ) -> anyhow::Result<MetricsCacheRecord> {
        let now = Utc::now();
        let record = MetricsCacheRecord {
            payload,
            ttl_expires_at: now + to_chrono(self.config.ttl),
            updated_at: now,
        };
        self.store
            .upsert(user_id, cache_key, connection_id, &record)
            .await?;
        Ok(record)
    }

    pub fn cooldown_remaining(
        &self,
        record: &MetricsCacheRecord,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let cooldown = to_chrono(self.config.force_cooldown);
        let elapsed = record.age_at(now).max(chrono::Duration::zero());
        if elapsed >= cooldown {
            return None;
        }
        (cooldown - elapsed).to_std().ok()
    }

    pub fn decide(
        &self,
        cached: Option<&MetricsCacheRecord>,
        force: bool,
        now: DateTime<Utc>,
    ) -> CacheDecision {
        let Some(record) = cached else {
            return CacheDecision::Recompute;
        };

        if force {
            return match self.cooldown_remaining(record, now) {
                Some(remaining) => CacheDecision::Serve {
                    record: record.clone(),
                    cooldown_remaining_secs: ceil_secs(remaining),
                },
                None => CacheDecision::Recompute,
            };
        }

        if record.is_fresh_at(now) {
            CacheDecision::Serve {
                record: record.clone(),
                cooldown_remaining_secs: 0,
            }
        } else {
            CacheDecision::Recompute
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis();
    u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
}

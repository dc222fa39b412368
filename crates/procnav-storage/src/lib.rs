//! TTL record cache + retrying HTTP fetch utilities for procnav.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procnav_core::{FetchKey, NoticeRecord};
use reqwest::{header, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "procnav-storage";

/// Source of "now" for expiry checks; injected so TTL behaviour is testable.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Raw (pre-filter) record set for one fetch key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Arc<[NoticeRecord]>,
    pub fetched_at: DateTime<Utc>,
}

/// Key-value store with TTL semantics, owned by an engine instance.
#[async_trait]
pub trait NoticeCache: Send + Sync {
    /// Live entry for `key`, or `None` when never populated or expired.
    async fn get(&self, key: &FetchKey) -> Option<CacheEntry>;

    /// Replaces any entry for `key` with a freshly stamped one.
    async fn put(&self, key: FetchKey, records: Vec<NoticeRecord>) -> CacheEntry;

    async fn clear(&self);
}

#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<FetchKey, CacheEntry>>,
}

impl TtlCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        now - entry.fetched_at > ttl
    }
}

#[async_trait]
impl NoticeCache for TtlCache {
    async fn get(&self, key: &FetchKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => {
                    debug!(%key, "cache miss");
                    return None;
                }
                Some(entry) if !self.is_expired(entry, now) => {
                    debug!(%key, records = entry.records.len(), "cache hit");
                    return Some(entry.clone());
                }
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        // A concurrent put may have refreshed the slot between the two locks.
        match entries.get(key) {
            Some(entry) if !self.is_expired(entry, now) => Some(entry.clone()),
            Some(_) => {
                debug!(%key, "cache entry expired");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: FetchKey, records: Vec<NoticeRecord>) -> CacheEntry {
        let entry = CacheEntry {
            records: records.into(),
            fetched_at: self.clock.now(),
        };
        debug!(%key, records = entry.records.len(), "cache put");
        self.entries.write().await.insert(key, entry.clone());
        entry
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

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
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_feed_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            user_agent: None,
            global_concurrency: 8,
            per_feed_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Request pacing: at most `capacity` requests back to back, then one per `refill_every`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `interval`; `None` when the interval is zero.
    pub fn min_interval(interval: Duration) -> Option<Self> {
        (!interval.is_zero()).then_some(Self {
            capacity: 1,
            refill_every: interval,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketState {
    fn refill(&mut self, capacity: u32, every: Duration) {
        if every.is_zero() {
            self.tokens = capacity;
            return;
        }
        let due = self.last_refill.elapsed().as_nanos() / every.as_nanos();
        if due == 0 {
            return;
        }
        let due = u32::try_from(due).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(due).min(capacity);
        if self.tokens == capacity {
            self.last_refill = Instant::now();
        } else {
            self.last_refill += every * due;
        }
    }
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(self.capacity, self.refill_every);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
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
    #[error("request limiter closed")]
    LimiterClosed,
}

/// Shared HTTP client: bounded concurrency, optional rate limiting and retry with backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_feed_limit: usize,
    per_feed: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_feed_limit: config.per_feed_concurrency.max(1),
            per_feed: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_feed_semaphore(&self, feed_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_feed.lock().await;
        map.entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_feed_limit)))
            .clone()
    }

    /// GETs `url`, retrying transient failures. Non-retryable statuses fail immediately.
    pub async fn fetch_bytes(
        &self,
        request_id: Uuid,
        feed_id: &str,
        url: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_feed = self.per_feed_semaphore(feed_id).await;
        let _feed = per_feed.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %request_id, feed_id, url);
        self.fetch_with_retries(url, accept).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str, accept: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .get(url)
                .header(header::ACCEPT, accept)
                .send()
                .await;
            let can_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying upstream status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying upstream request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

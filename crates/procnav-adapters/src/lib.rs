//! Upstream feed contracts + the JSON API, RSS and fixture feed implementations.
//!
//! Every feed normalizes its own payload shape into [`NoticeRecord`] before the
//! engine sees it. Which upstream field becomes which attribute is configuration
//! (`feeds.yaml`), not code.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use procnav_core::{FeedKind, FeedStatus, FetchKey, NoticeRecord, UNASSIGNED_ENTITY};
use procnav_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "procnav-adapters";

pub const ALL_FETCH_KEYS: [FetchKey; 4] = [
    FetchKey { kind: FeedKind::Works, status: FeedStatus::Open },
    FetchKey { kind: FeedKind::Works, status: FeedStatus::Closed },
    FetchKey { kind: FeedKind::Services, status: FeedStatus::Open },
    FetchKey { kind: FeedKind::Services, status: FeedStatus::Closed },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    JsonApi,
    Rss,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedContext {
    pub request_id: Uuid,
    /// Zone that timestamped feed dates are converted into before truncation.
    pub timezone: Tz,
}

impl FeedContext {
    pub fn new(timezone: Tz) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timezone,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed payload from {feed_id}: {message}")]
    Malformed { feed_id: String, message: String },
    #[error("no enabled feed serves {key}")]
    NoRoute { key: FetchKey },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl FeedError {
    fn malformed(feed_id: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            feed_id: feed_id.to_string(),
            message: message.into(),
        }
    }
}

/// One upstream source of notice pages.
#[async_trait]
pub trait NoticeFeed: Send + Sync {
    fn feed_id(&self) -> &str;
    fn format(&self) -> FeedFormat;

    /// Records per full page; a shorter page is the last one.
    fn page_size(&self) -> usize;

    /// Fetches one logical page (0-based) for `key`, already normalized.
    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        key: FetchKey,
        page: usize,
    ) -> Result<Vec<NoticeRecord>, FeedError>;
}

/// Dotted path into a JSON item, e.g. `contractingAuthority.name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub String);

impl FieldPath {
    fn lookup<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut cur = value;
        for segment in self.0.split('.').filter(|s| !s.is_empty()) {
            cur = cur.get(segment)?;
        }
        if cur.is_null() {
            None
        } else {
            Some(cur)
        }
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which JSON fields become which record attributes. Each attribute lists
/// candidate paths tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub items: FieldPath,
    pub id: Vec<FieldPath>,
    pub title: Vec<FieldPath>,
    #[serde(default)]
    pub entity_name: Vec<FieldPath>,
    #[serde(default)]
    pub first_published: Vec<FieldPath>,
    #[serde(default)]
    pub deadline: Vec<FieldPath>,
    #[serde(default)]
    pub budget_ex_vat: Vec<FieldPath>,
    #[serde(default)]
    pub detail_url: Vec<FieldPath>,
    #[serde(default)]
    pub region_code: Vec<FieldPath>,
    #[serde(default)]
    pub authority_region_code: Vec<FieldPath>,
}

impl FieldMapping {
    /// Field names of the Euskadi contracting-notices API.
    pub fn euskadi() -> Self {
        fn paths(list: &[&str]) -> Vec<FieldPath> {
            list.iter().copied().map(FieldPath::from).collect()
        }
        Self {
            items: "items".into(),
            id: paths(&["id"]),
            title: paths(&["object"]),
            entity_name: paths(&["entity.name", "contractingAuthority.name"]),
            first_published: paths(&["firstPublicationDate"]),
            deadline: paths(&["deadlineDate"]),
            budget_ex_vat: paths(&["budgetWithoutVAT"]),
            detail_url: paths(&["mainEntityOfPage"]),
            region_code: Vec::new(),
            authority_region_code: Vec::new(),
        }
    }

    fn validate(&self, feed_id: &str) -> Result<()> {
        if self.items.0.trim().is_empty() {
            bail!("feed {feed_id}: mapping.items must name the item array");
        }
        if self.id.is_empty() {
            bail!("feed {feed_id}: mapping.id needs at least one path");
        }
        if self.title.is_empty() {
            bail!("feed {feed_id}: mapping.title needs at least one path");
        }
        Ok(())
    }

    fn first<'a>(paths: &[FieldPath], item: &'a JsonValue) -> Option<&'a JsonValue> {
        paths.iter().find_map(|p| p.lookup(item))
    }

    fn text(paths: &[FieldPath], item: &JsonValue) -> Option<String> {
        Self::first(paths, item).and_then(scalar_to_string)
    }

    /// Normalizes one item; `None` when the item carries no usable id. Dates with
    /// an offset are read as calendar dates in `tz`.
    pub fn to_record(&self, item: &JsonValue, tz: Tz) -> Option<NoticeRecord> {
        let id = Self::text(&self.id, item)?;
        let title = Self::text(&self.title, item).unwrap_or_default();
        let budget_ex_vat = Self::first(&self.budget_ex_vat, item).and_then(|raw| {
            let parsed = scalar_to_f64(raw);
            if parsed.is_none() {
                warn!(notice_id = %id, budget = %raw, "unparseable budget, ignoring");
            }
            parsed
        });
        Some(NoticeRecord {
            id,
            title,
            entity_name: Self::text(&self.entity_name, item)
                .unwrap_or_else(|| UNASSIGNED_ENTITY.to_string()),
            first_published: Self::text(&self.first_published, item)
                .as_deref()
                .and_then(|raw| parse_feed_date(raw, tz)),
            deadline: Self::text(&self.deadline, item)
                .as_deref()
                .and_then(|raw| parse_feed_date(raw, tz)),
            budget_ex_vat,
            detail_url: Self::text(&self.detail_url, item),
            region_code: Self::text(&self.region_code, item),
            authority_region_code: Self::text(&self.authority_region_code, item),
        })
    }
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn scalar_to_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Plain decimals (`125000.50`) and Spanish notation (`1.250,50`, `1.250.000`).
fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_end_matches('€')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else if cleaned.matches('.').count() > 1 {
        cleaned.replace('.', "")
    } else {
        cleaned
    };
    normalized.parse().ok()
}

/// Accepts ISO dates with or without a time part, `dd/mm/yyyy` and RFC 2822.
/// Timestamps carrying an offset are converted into `tz` first; bare dates and
/// offset-less timestamps keep their calendar date.
pub fn parse_feed_date(raw: &str, tz: Tz) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz).date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&tz).date_naive());
    }
    if let Some(prefix) = raw.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%d/%m/%Y") {
            return Some(date);
        }
    }
    DateTime::parse_from_rfc2822(raw)
        .map(|dt| dt.with_timezone(&tz).date_naive())
        .ok()
}

/// Normalizes one JSON page. A missing item array is malformed; items without an
/// id are skipped because they cannot be deduplicated.
pub fn normalize_json_page(
    feed_id: &str,
    mapping: &FieldMapping,
    page: &JsonValue,
    tz: Tz,
) -> Result<Vec<NoticeRecord>, FeedError> {
    let items = mapping
        .items
        .lookup(page)
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            FeedError::malformed(feed_id, format!("no `{}` array in page", mapping.items.0))
        })?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match mapping.to_record(item, tz) {
            Some(record) => out.push(record),
            None => warn!(feed_id, "skipping feed item without id"),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindIds {
    pub works: String,
    pub services: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusIds {
    pub open: String,
    pub closed: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonApiConfig {
    pub base_url: String,
    pub page_size: usize,
    /// Upstream number of logical page 0.
    #[serde(default)]
    pub first_page_number: usize,
    pub page_param: String,
    pub page_size_param: String,
    pub kind_param: String,
    pub kind_ids: KindIds,
    pub status_param: String,
    pub status_ids: StatusIds,
    #[serde(default)]
    pub static_params: BTreeMap<String, String>,
    pub mapping: FieldMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssConfig {
    pub url: String,
    /// Structured region code stamped on every item of a region feed.
    #[serde(default)]
    pub region_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub dir: PathBuf,
    pub page_size: usize,
    pub mapping: FieldMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum FeedSettings {
    JsonApi(JsonApiConfig),
    Rss(RssConfig),
    Fixture(FixtureConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fetch keys this feed answers, as `works/open`-style strings.
    pub serves: Vec<String>,
    #[serde(flatten)]
    pub settings: FeedSettings,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedsFile {
    pub feeds: Vec<FeedConfig>,
}

pub fn parse_fetch_key(raw: &str) -> Option<FetchKey> {
    ALL_FETCH_KEYS.into_iter().find(|k| k.to_string() == raw.trim())
}

impl FeedsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }
}

impl FeedConfig {
    pub fn served_keys(&self) -> Result<Vec<FetchKey>> {
        self.serves
            .iter()
            .map(|raw| {
                parse_fetch_key(raw)
                    .with_context(|| format!("feed {}: unknown fetch key `{raw}`", self.feed_id))
            })
            .collect()
    }

    /// Startup checks; any failure here means the process must not serve.
    pub fn validate(&self) -> Result<()> {
        if self.feed_id.trim().is_empty() {
            bail!("feed with empty feed_id");
        }
        if self.serves.is_empty() {
            bail!("feed {} serves no fetch keys", self.feed_id);
        }
        self.served_keys()?;
        match &self.settings {
            FeedSettings::JsonApi(api) => {
                Url::parse(&api.base_url)
                    .with_context(|| format!("feed {}: invalid base_url", self.feed_id))?;
                if api.page_size == 0 {
                    bail!("feed {}: page_size must be positive", self.feed_id);
                }
                api.mapping.validate(&self.feed_id)?;
            }
            FeedSettings::Rss(rss) => {
                Url::parse(&rss.url).with_context(|| format!("feed {}: invalid url", self.feed_id))?;
            }
            FeedSettings::Fixture(fixture) => {
                if fixture.page_size == 0 {
                    bail!("feed {}: page_size must be positive", self.feed_id);
                }
                fixture.mapping.validate(&self.feed_id)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct JsonApiFeed {
    feed_id: String,
    config: JsonApiConfig,
    http: Arc<HttpFetcher>,
}

impl JsonApiFeed {
    pub fn new(feed_id: impl Into<String>, config: JsonApiConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            feed_id: feed_id.into(),
            config,
            http,
        }
    }

    pub fn page_url(&self, key: FetchKey, page: usize) -> Result<Url, FeedError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| FeedError::malformed(&self.feed_id, format!("base_url: {e}")))?;
        let kind_id = match key.kind {
            FeedKind::Works => &self.config.kind_ids.works,
            FeedKind::Services => &self.config.kind_ids.services,
        };
        let status_id = match key.status {
            FeedStatus::Open => &self.config.status_ids.open,
            FeedStatus::Closed => &self.config.status_ids.closed,
        };
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.config.kind_param, kind_id);
            query.append_pair(&self.config.status_param, status_id);
            query.append_pair(
                &self.config.page_param,
                &(self.config.first_page_number + page).to_string(),
            );
            query.append_pair(&self.config.page_size_param, &self.config.page_size.to_string());
            for (name, value) in &self.config.static_params {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl NoticeFeed for JsonApiFeed {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::JsonApi
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }

    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        key: FetchKey,
        page: usize,
    ) -> Result<Vec<NoticeRecord>, FeedError> {
        let url = self.page_url(key, page)?;
        let resp = self
            .http
            .fetch_bytes(ctx.request_id, &self.feed_id, url.as_str(), "application/json")
            .await?;
        let value: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|e| FeedError::malformed(&self.feed_id, format!("invalid JSON: {e}")))?;
        normalize_json_page(&self.feed_id, &self.config.mapping, &value, ctx.timezone)
    }
}

#[derive(Debug, Deserialize)]
struct RssDocument {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    guid: Option<TextNode>,
    #[serde(rename = "pubDate", default)]
    pub_date: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<TextNode>,
}

#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    text: String,
}

/// Parses an RSS 2.0 document into records. Items need a guid or a link to be kept.
pub fn parse_rss(
    feed_id: &str,
    xml: &str,
    region_code: Option<&str>,
    tz: Tz,
) -> Result<Vec<NoticeRecord>, FeedError> {
    let doc: RssDocument = quick_xml::de::from_str(xml)
        .map_err(|e| FeedError::malformed(feed_id, format!("invalid RSS: {e}")))?;

    let mut out = Vec::with_capacity(doc.channel.items.len());
    for item in doc.channel.items {
        let link = item.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
        let id = item
            .guid
            .map(|g| g.text.trim().to_string())
            .filter(|g| !g.is_empty())
            .or_else(|| link.clone());
        let Some(id) = id else {
            warn!(feed_id, "skipping rss item without guid or link");
            continue;
        };
        let category_region = item
            .categories
            .into_iter()
            .map(|c| c.text.trim().to_string())
            .find(|c| !c.is_empty());

        out.push(NoticeRecord {
            id,
            title: item.title.unwrap_or_default().trim().to_string(),
            entity_name: item
                .author
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| UNASSIGNED_ENTITY.to_string()),
            first_published: item.pub_date.as_deref().and_then(|raw| parse_feed_date(raw, tz)),
            deadline: None,
            budget_ex_vat: None,
            detail_url: link,
            region_code: region_code.map(ToString::to_string).or(category_region),
            authority_region_code: None,
        });
    }
    Ok(out)
}

/// Syndication feed for a region subset. It has no paging: page 0 carries
/// everything and later pages are empty.
#[derive(Debug)]
pub struct RssFeed {
    feed_id: String,
    config: RssConfig,
    http: Arc<HttpFetcher>,
}

impl RssFeed {
    pub fn new(feed_id: impl Into<String>, config: RssConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            feed_id: feed_id.into(),
            config,
            http,
        }
    }
}

#[async_trait]
impl NoticeFeed for RssFeed {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::Rss
    }

    fn page_size(&self) -> usize {
        usize::MAX
    }

    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        _key: FetchKey,
        page: usize,
    ) -> Result<Vec<NoticeRecord>, FeedError> {
        if page > 0 {
            return Ok(Vec::new());
        }
        let resp = self
            .http
            .fetch_bytes(
                ctx.request_id,
                &self.feed_id,
                &self.config.url,
                "application/rss+xml, application/xml",
            )
            .await?;
        let text = String::from_utf8_lossy(&resp.body);
        parse_rss(&self.feed_id, &text, self.config.region_code.as_deref(), ctx.timezone)
    }
}

/// Serves recorded JSON pages from `<dir>/<kind>/<status>/page-<n>.json`.
/// A missing page file reads as an empty page.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    feed_id: String,
    config: FixtureConfig,
}

impl FixtureFeed {
    pub fn new(feed_id: impl Into<String>, config: FixtureConfig) -> Self {
        Self {
            feed_id: feed_id.into(),
            config,
        }
    }

    pub fn page_path(&self, key: FetchKey, page: usize) -> PathBuf {
        self.config
            .dir
            .join(key.to_string())
            .join(format!("page-{page}.json"))
    }
}

#[async_trait]
impl NoticeFeed for FixtureFeed {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::Fixture
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }

    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        key: FetchKey,
        page: usize,
    ) -> Result<Vec<NoticeRecord>, FeedError> {
        let path = self.page_path(key, page);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading fixture page {}", path.display()))?;
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| FeedError::malformed(&self.feed_id, format!("{}: {e}", path.display())))?;
        normalize_json_page(&self.feed_id, &self.config.mapping, &value, ctx.timezone)
    }
}

/// Builds a feed from validated config. Relative fixture dirs resolve against `root`.
pub fn build_feed(config: &FeedConfig, http: Arc<HttpFetcher>, root: &Path) -> Arc<dyn NoticeFeed> {
    match &config.settings {
        FeedSettings::JsonApi(api) => Arc::new(JsonApiFeed::new(&config.feed_id, api.clone(), http)),
        FeedSettings::Rss(rss) => Arc::new(RssFeed::new(&config.feed_id, rss.clone(), http)),
        FeedSettings::Fixture(fixture) => {
            let mut fixture = fixture.clone();
            if fixture.dir.is_relative() {
                fixture.dir = root.join(&fixture.dir);
            }
            Arc::new(FixtureFeed::new(&config.feed_id, fixture))
        }
    }
}

/// Routes each fetch key to the first enabled feed that serves it.
#[derive(Clone, Default)]
pub struct FeedRegistry {
    routes: HashMap<FetchKey, Arc<dyn NoticeFeed>>,
}

impl std::fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes = self
            .routes
            .iter()
            .map(|(k, feed)| (k.to_string(), feed.feed_id().to_string()))
            .collect::<Vec<_>>();
        routes.sort();
        f.debug_struct("FeedRegistry").field("routes", &routes).finish()
    }
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `key` to `feed` unless an earlier feed already serves it.
    pub fn register(&mut self, key: FetchKey, feed: Arc<dyn NoticeFeed>) {
        self.routes.entry(key).or_insert(feed);
    }

    /// Registry serving every fetch key from one feed.
    pub fn single(feed: Arc<dyn NoticeFeed>) -> Self {
        let mut registry = Self::new();
        for key in ALL_FETCH_KEYS {
            registry.register(key, feed.clone());
        }
        registry
    }

    /// Validates the endpoint mapping and builds the routes. Every fetch key must
    /// be served; a gap is a startup error.
    pub fn from_feeds_file(file: &FeedsFile, http: Arc<HttpFetcher>, root: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for config in file.enabled() {
            config.validate()?;
            let feed = build_feed(config, http.clone(), root);
            for key in config.served_keys()? {
                registry.register(key, feed.clone());
            }
        }
        let missing = ALL_FETCH_KEYS
            .iter()
            .filter(|k| !registry.routes.contains_key(k))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            bail!("no enabled feed serves: {}", missing.join(", "));
        }
        Ok(registry)
    }

    pub fn feed_for(&self, key: FetchKey) -> Option<Arc<dyn NoticeFeed>> {
        self.routes.get(&key).cloned()
    }

    pub fn route(&self, key: FetchKey) -> Result<Arc<dyn NoticeFeed>, FeedError> {
        self.feed_for(key).ok_or(FeedError::NoRoute { key })
    }
}

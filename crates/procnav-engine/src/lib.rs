//! Navigation engine: fetch + dedup, filter pipeline, grouping, pagination and
//! the token-driven screen flow, plus the scheduled daily digest.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use procnav_adapters::{FeedContext, FeedError, FeedRegistry, FeedsFile, NoticeFeed};
use procnav_core::{
    decode, ContractKind, EntityGroup, FeedKind, FeedStatus, FetchKey, NavAction, NoticeRecord,
    QueryState, Scope, Selection, StatusMode, TokenError, ViewDensity,
};
use procnav_storage::{
    CacheEntry, Clock, HttpClientConfig, HttpFetcher, NoticeCache, SystemClock, TokenBucketConfig,
    TtlCache,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "procnav-engine";

pub const DEFAULT_SUMMARY_PAGE_SIZE: usize = 4;
pub const DEFAULT_DETAIL_PAGE_SIZE: usize = 2;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    /// Endpoint mapping, relative to `workspace_root` unless absolute.
    pub feeds_file: PathBuf,
    pub timezone: Tz,
    pub browse_ttl: Duration,
    pub keyword_ttl: Duration,
    pub summary_page_size: usize,
    pub detail_page_size: usize,
    pub max_fetch_pages: usize,
    pub http_timeout_secs: u64,
    /// Minimum spacing between upstream requests; zero disables pacing.
    pub http_min_interval_ms: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub digest_cron_1: String,
    pub digest_cron_2: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            feeds_file: PathBuf::from("feeds.yaml"),
            timezone: chrono_tz::Europe::Madrid,
            browse_ttl: Duration::from_secs(300),
            keyword_ttl: Duration::from_secs(900),
            summary_page_size: DEFAULT_SUMMARY_PAGE_SIZE,
            detail_page_size: DEFAULT_DETAIL_PAGE_SIZE,
            max_fetch_pages: 40,
            http_timeout_secs: 10,
            http_min_interval_ms: 0,
            user_agent: "procnav/0.1".to_string(),
            scheduler_enabled: false,
            digest_cron_1: "0 0 11 * * *".to_string(),
            digest_cron_2: "0 0 17 * * *".to_string(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let timezone = match std::env::var("PROCNAV_TIMEZONE") {
            Ok(name) => name
                .parse::<Tz>()
                .map_err(|e| anyhow!("invalid PROCNAV_TIMEZONE `{name}`: {e}"))?,
            Err(_) => defaults.timezone,
        };
        let config = Self {
            workspace_root: std::env::var("PROCNAV_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            feeds_file: std::env::var("PROCNAV_FEEDS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.feeds_file),
            timezone,
            browse_ttl: Duration::from_secs(env_or(
                "PROCNAV_BROWSE_TTL_SECS",
                defaults.browse_ttl.as_secs(),
            )),
            keyword_ttl: Duration::from_secs(env_or(
                "PROCNAV_KEYWORD_TTL_SECS",
                defaults.keyword_ttl.as_secs(),
            )),
            summary_page_size: env_or("PROCNAV_SUMMARY_PAGE_SIZE", defaults.summary_page_size),
            detail_page_size: env_or("PROCNAV_DETAIL_PAGE_SIZE", defaults.detail_page_size),
            max_fetch_pages: env_or("PROCNAV_MAX_FETCH_PAGES", defaults.max_fetch_pages),
            http_timeout_secs: env_or("PROCNAV_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_min_interval_ms: env_or("PROCNAV_HTTP_MIN_INTERVAL_MS", defaults.http_min_interval_ms),
            user_agent: std::env::var("PROCNAV_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("PROCNAV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            digest_cron_1: std::env::var("DIGEST_CRON_1").unwrap_or(defaults.digest_cron_1),
            digest_cron_2: std::env::var("DIGEST_CRON_2").unwrap_or(defaults.digest_cron_2),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.summary_page_size == 0 || self.detail_page_size == 0 {
            bail!("page sizes must be positive");
        }
        if self.max_fetch_pages == 0 {
            bail!("PROCNAV_MAX_FETCH_PAGES must be positive");
        }
        Ok(())
    }

    pub fn feeds_path(&self) -> PathBuf {
        if self.feeds_file.is_absolute() {
            self.feeds_file.clone()
        } else {
            self.workspace_root.join(&self.feeds_file)
        }
    }
}

/// Accent- and case-insensitive form used for every keyword comparison:
/// NFD, combining marks dropped, upper-cased, non-alphanumerics collapsed to one space.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_uppercase)
    {
        out.push(if c.is_alphanumeric() { c } else { ' ' });
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

const DEFAULT_ENGINEERING_POSITIVE: &[&str] = &[
    "ingeniería",
    "ingenieria",
    "ingeniería civil",
    "arquitectura",
    "proyecto",
    "dirección de obra",
    "asistencia técnica",
    "redacción",
];

const DEFAULT_ENGINEERING_NEGATIVE: &[&str] = &["limpieza", "vigilancia", "catering"];

const GIPUZKOA_PLACES: &[&str] = &[
    "gipuzkoa",
    "guipuzcoa",
    "donostia",
    "san sebastián",
    "irun",
    "eibar",
    "zarautz",
    "tolosa",
    "beasain",
    "bergara",
    "errenteria",
    "mondragón",
    "arrasate",
    "mutriku",
    "ondarroa",
    "azpeitia",
    "azkoitia",
    "hondarribia",
    "lezo",
    "pasaia",
    "oiartzun",
    "urnieta",
    "lasarte",
    "andoain",
    "ordizia",
    "legazpi",
    "zumarraga",
    "elgoibar",
    "txingudi",
    "añarbe",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSet {
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRule {
    /// Token code, e.g. `GIP`.
    pub code: String,
    #[serde(default)]
    pub name: String,
    /// Code carried by records whose classification is structured.
    pub structured_code: String,
    #[serde(default)]
    pub places: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRulesFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub engineering: KeywordSet,
    #[serde(default)]
    pub regions: Vec<RegionRule>,
}

impl Default for KeywordRulesFile {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            version: 1,
            engineering: KeywordSet {
                positive: owned(DEFAULT_ENGINEERING_POSITIVE),
                negative: owned(DEFAULT_ENGINEERING_NEGATIVE),
            },
            regions: vec![RegionRule {
                code: "GIP".to_string(),
                name: "Gipuzkoa".to_string(),
                structured_code: "20".to_string(),
                places: owned(GIPUZKOA_PLACES),
            }],
        }
    }
}

/// Region with its place names already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRegion {
    pub code: String,
    pub name: String,
    pub structured_code: String,
    places: Vec<String>,
}

/// Engineering keyword sets and region definitions, normalized once at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordRules {
    positive: Vec<String>,
    negative: Vec<String>,
    regions: Vec<CompiledRegion>,
}

fn normalized_keywords(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|k| normalize_text(k))
        .filter(|k| !k.is_empty())
        .collect()
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self::build(&KeywordRulesFile::default())
    }
}

impl KeywordRules {
    pub fn compile(file: &KeywordRulesFile) -> Result<Self> {
        let mut seen = HashSet::new();
        for region in &file.regions {
            match Scope::from_code(&region.code) {
                Ok(Scope::Region(_)) => {}
                Ok(Scope::General) => bail!("region code `{}` is reserved", region.code),
                Err(err) => bail!("region `{}`: {err}", region.code),
            }
            if region.structured_code.trim().is_empty() {
                bail!("region `{}` has no structured_code", region.code);
            }
            if !seen.insert(region.code.as_str()) {
                bail!("region `{}` defined twice", region.code);
            }
        }
        Ok(Self::build(file))
    }

    fn build(file: &KeywordRulesFile) -> Self {
        Self {
            positive: normalized_keywords(&file.engineering.positive),
            negative: normalized_keywords(&file.engineering.negative),
            regions: file
                .regions
                .iter()
                .map(|r| CompiledRegion {
                    code: r.code.clone(),
                    name: r.name.clone(),
                    structured_code: r.structured_code.trim().to_string(),
                    places: normalized_keywords(&r.places),
                })
                .collect(),
        }
    }

    /// Reads `rules/keywords.yaml`; built-in rules apply when the file is absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("keywords.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no keyword rules file; using built-in rules");
            return Ok(Self::default());
        }
        let file: KeywordRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(&path).context("reading rules/keywords.yaml")?,
        )
        .context("parsing rules/keywords.yaml")?;
        Self::compile(&file).context("validating rules/keywords.yaml")
    }

    pub fn regions(&self) -> &[CompiledRegion] {
        &self.regions
    }

    pub fn region(&self, code: &str) -> Option<&CompiledRegion> {
        self.regions.iter().find(|r| r.code == code)
    }

    /// At least one positive keyword and no negative one. Negative wins.
    pub fn is_engineering(&self, title: &str) -> bool {
        let text = normalize_text(title);
        if self.negative.iter().any(|k| text.contains(k.as_str())) {
            return false;
        }
        self.positive.iter().any(|k| text.contains(k.as_str()))
    }
}

/// Drops records whose id was already admitted.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    /// Appends the unseen records of `batch` to `out` and returns how many were new.
    pub fn admit(&mut self, batch: Vec<NoticeRecord>, out: &mut Vec<NoticeRecord>) -> usize {
        let before = out.len();
        for record in batch {
            if self.seen.insert(record.id.clone()) {
                out.push(record);
            }
        }
        out.len() - before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStop {
    ShortPage,
    NoNewRecords,
    PageCap,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub records: Vec<NoticeRecord>,
    pub pages: usize,
    pub stop: FetchStop,
}

/// Walks the feed from page 0 until a short page, a page with nothing new, or the
/// page cap. Any page error aborts the whole fetch.
pub async fn fetch_deduplicated(
    feed: &dyn NoticeFeed,
    key: FetchKey,
    max_pages: usize,
    timezone: Tz,
) -> Result<FetchOutcome, FeedError> {
    let ctx = FeedContext::new(timezone);
    let request_id = ctx.request_id;
    let feed_id = feed.feed_id();
    let page_size = feed.page_size();
    let mut dedup = Deduplicator::default();
    let mut records = Vec::new();
    let mut page = 0usize;

    let stop = loop {
        if page >= max_pages.max(1) {
            warn!(%request_id, feed_id, %key, pages = page, "fetch stopped at page cap");
            break FetchStop::PageCap;
        }
        let span = info_span!("feed_fetch", %request_id, feed_id, page);
        let batch = feed.fetch_page(&ctx, key, page).instrument(span).await?;
        let batch_len = batch.len();
        let fresh = dedup.admit(batch, &mut records);
        page += 1;

        if batch_len < page_size {
            break FetchStop::ShortPage;
        }
        if fresh == 0 {
            warn!(%request_id, feed_id, %key, page = page - 1, "page contributed no new records");
            break FetchStop::NoNewRecords;
        }
    };

    debug!(%request_id, feed_id, %key, pages = page, records = records.len(), ?stop, "fetch complete");
    Ok(FetchOutcome {
        records,
        pages: page,
        stop,
    })
}

pub fn keep_open_deadline(record: &NoticeRecord, today: NaiveDate) -> bool {
    record.deadline.is_some_and(|deadline| deadline >= today)
}

/// Structured codes decide when present; place names in title + entity only
/// decide for records without any code.
pub fn in_region(record: &NoticeRecord, region: &CompiledRegion) -> bool {
    let mut codes = record.structured_region_codes().peekable();
    if codes.peek().is_some() {
        return codes.any(|code| code == region.structured_code);
    }
    let text = normalize_text(&format!("{} {}", record.title, record.entity_name));
    region.places.iter().any(|place| text.contains(place.as_str()))
}

/// Status, then classification, then scope.
pub fn apply_filters(
    records: &[NoticeRecord],
    selection: &Selection,
    today: NaiveDate,
    rules: &KeywordRules,
) -> Result<Vec<NoticeRecord>, NavError> {
    let region = match &selection.scope {
        Scope::General => None,
        Scope::Region(code) => Some(
            rules
                .region(code)
                .ok_or_else(|| NavError::UnknownRegion(code.clone()))?,
        ),
    };

    Ok(records
        .iter()
        .filter(|r| selection.status != StatusMode::InTerm || keep_open_deadline(r, today))
        .filter(|r| selection.kind != ContractKind::Engineering || rules.is_engineering(&r.title))
        .filter(|r| region.map_or(true, |region| in_region(r, region)))
        .cloned()
        .collect())
}

fn by_deadline(a: &NoticeRecord, b: &NoticeRecord) -> Ordering {
    let a_deadline = a.deadline.unwrap_or(NaiveDate::MAX);
    let b_deadline = b.deadline.unwrap_or(NaiveDate::MAX);
    a_deadline.cmp(&b_deadline).then_with(|| a.id.cmp(&b.id))
}

/// Groups by entity name (ordinal order); within a group, earliest deadline first
/// and undated records last.
pub fn group_by_entity(records: Vec<NoticeRecord>) -> Vec<EntityGroup> {
    let mut buckets: BTreeMap<String, Vec<NoticeRecord>> = BTreeMap::new();
    for record in records {
        buckets.entry(record.entity_name.clone()).or_default().push(record);
    }
    buckets
        .into_iter()
        .map(|(entity_name, mut records)| {
            records.sort_by(by_deadline);
            EntityGroup {
                entity_name,
                records,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub clamped_index: usize,
    pub total_pages: usize,
}

/// Any requested index is clamped into `[0, total_pages - 1]`; an empty list is one page.
pub fn paginate<T: Clone>(items: &[T], page_index: i64, page_size: usize) -> Page<T> {
    let size = page_size.max(1);
    let total_pages = items.len().div_ceil(size).max(1);
    let last = i64::try_from(total_pages - 1).unwrap_or(i64::MAX);
    let clamped_index = usize::try_from(page_index.clamp(0, last)).unwrap_or(0);
    let start = (clamped_index * size).min(items.len());
    let end = (start + size).min(items.len());
    Page {
        items: items[start..end].to_vec(),
        clamped_index,
        total_pages,
    }
}

#[derive(Debug, Error)]
pub enum NavError {
    #[error("invalid navigation token: {0}")]
    Token(#[from] TokenError),
    #[error("cached results for {key} expired; re-issue the base query")]
    CacheExpired { key: FetchKey, retry_token: String },
    #[error("unknown region `{0}`")]
    UnknownRegion(String),
    #[error("upstream fetch failed: {0}")]
    Fetch(#[from] FeedError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub label: String,
    pub token: String,
}

impl Button {
    fn new(label: impl Into<String>, action: &NavAction) -> Self {
        Self {
            label: label.into(),
            token: action.encode(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuScreen {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    pub buttons: Vec<Button>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupView {
    pub entity_name: String,
    pub notice_count: usize,
    pub budget_total: f64,
    /// Running 1-based number across detail pages; absent in summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<NoticeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PagePayload {
    pub title: String,
    pub view: ViewDensity,
    pub page_index: usize,
    pub total_pages: usize,
    pub total_groups: usize,
    pub total_notices: usize,
    pub fetched_at: DateTime<Utc>,
    pub groups: Vec<GroupView>,
    pub buttons: Vec<Button>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum Screen {
    Menu(MenuScreen),
    Results(PagePayload),
}

impl Screen {
    pub fn title(&self) -> &str {
        match self {
            Self::Menu(menu) => &menu.title,
            Self::Results(page) => &page.title,
        }
    }

    pub fn buttons(&self) -> &[Button] {
        match self {
            Self::Menu(menu) => &menu.buttons,
            Self::Results(page) => &page.buttons,
        }
    }
}

fn kind_label(kind: ContractKind) -> &'static str {
    kind.code()
}

fn status_label(status: StatusMode) -> &'static str {
    match status {
        StatusMode::Open => "ABIERTAS",
        StatusMode::InTerm => "EN PLAZO",
        StatusMode::Closed => "CERRADAS",
    }
}

fn selection_title(selection: &Selection) -> String {
    format!(
        "{} / {} / {}",
        selection.kind.code(),
        selection.status.code(),
        selection.scope.code()
    )
}

const BACK_LABEL: &str = "ATRÁS";
const RESET_LABEL: &str = "RESET";

/// Owns the feeds, caches and clock for one deployment. Stateless per request.
pub struct NoticeEngine {
    feeds: FeedRegistry,
    rules: KeywordRules,
    browse_cache: Arc<dyn NoticeCache>,
    keyword_cache: Arc<dyn NoticeCache>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    summary_page_size: usize,
    detail_page_size: usize,
    max_fetch_pages: usize,
}

impl NoticeEngine {
    pub fn new(
        config: &EngineConfig,
        feeds: FeedRegistry,
        rules: KeywordRules,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            feeds,
            rules,
            browse_cache: Arc::new(TtlCache::new(config.browse_ttl, clock.clone())),
            keyword_cache: Arc::new(TtlCache::new(config.keyword_ttl, clock.clone())),
            clock,
            timezone: config.timezone,
            summary_page_size: config.summary_page_size.max(1),
            detail_page_size: config.detail_page_size.max(1),
            max_fetch_pages: config.max_fetch_pages.max(1),
        }
    }

    pub fn with_caches(mut self, browse: Arc<dyn NoticeCache>, keyword: Arc<dyn NoticeCache>) -> Self {
        self.browse_cache = browse;
        self.keyword_cache = keyword;
        self
    }

    /// Loads and validates the endpoint mapping and keyword rules. Fails fast.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: TokenBucketConfig::min_interval(Duration::from_millis(
                config.http_min_interval_ms,
            )),
            ..Default::default()
        })?);
        let feeds_file = FeedsFile::load(config.feeds_path())?;
        let feeds = FeedRegistry::from_feeds_file(&feeds_file, http, &config.workspace_root)
            .context("validating endpoint mapping")?;
        let rules = KeywordRules::from_workspace_root(&config.workspace_root)?;
        info!(?feeds, regions = rules.regions().len(), "engine configured");
        Ok(Self::new(config, feeds, rules, Arc::new(SystemClock)))
    }

    pub fn rules(&self) -> &KeywordRules {
        &self.rules
    }

    /// Calendar date in the reference timezone.
    pub fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.timezone).date_naive()
    }

    pub async fn navigate(&self, token: &str) -> Result<Screen, NavError> {
        let action = decode(token)?;
        self.apply(action).await
    }

    pub async fn apply(&self, action: NavAction) -> Result<Screen, NavError> {
        match action {
            NavAction::ShowRoot => Ok(self.root_menu(None)),
            NavAction::Reset => {
                self.reset().await;
                Ok(self.root_menu(Some("Sesión reiniciada".to_string())))
            }
            NavAction::PickKind(kind) => Ok(self.status_menu(kind)),
            NavAction::PickStatus { kind, status } => Ok(self.scope_menu(kind, status)),
            NavAction::PickScope(selection) => {
                self.check_scope(&selection.scope)?;
                Ok(self.view_menu(&selection))
            }
            action @ NavAction::OpenView { .. } => {
                let state = action
                    .query_state()
                    .ok_or_else(|| TokenError::NotAPage(action.encode()))?;
                self.results(state, true).await
            }
            action @ (NavAction::ShowSummaryPage { .. } | NavAction::ShowDetailPage { .. }) => {
                let state = action
                    .query_state()
                    .ok_or_else(|| TokenError::NotAPage(action.encode()))?;
                self.results(state, false).await
            }
        }
    }

    pub async fn reset(&self) {
        self.browse_cache.clear().await;
        self.keyword_cache.clear().await;
        info!("navigation caches cleared");
    }

    fn check_scope(&self, scope: &Scope) -> Result<(), NavError> {
        match scope {
            Scope::Region(code) if self.rules.region(code).is_none() => {
                Err(NavError::UnknownRegion(code.clone()))
            }
            _ => Ok(()),
        }
    }

    fn cache_for(&self, selection: &Selection) -> &Arc<dyn NoticeCache> {
        if selection.uses_keyword_filters() {
            &self.keyword_cache
        } else {
            &self.browse_cache
        }
    }

    fn page_size(&self, view: ViewDensity) -> usize {
        match view {
            ViewDensity::Summary => self.summary_page_size,
            ViewDensity::Detail => self.detail_page_size,
        }
    }

    async fn fetch_records(&self, key: FetchKey) -> Result<Vec<NoticeRecord>, FeedError> {
        let feed = self.feeds.route(key)?;
        Ok(fetch_deduplicated(feed.as_ref(), key, self.max_fetch_pages, self.timezone)
            .await?
            .records)
    }

    /// Cache read; on a miss, fetches only when `allow_fetch` (base queries).
    async fn records_for(&self, state: &QueryState, allow_fetch: bool) -> Result<CacheEntry, NavError> {
        let selection = state.selection();
        let key = selection.fetch_key();
        let cache = self.cache_for(&selection);
        if let Some(entry) = cache.get(&key).await {
            return Ok(entry);
        }
        if !allow_fetch {
            return Err(NavError::CacheExpired {
                key,
                retry_token: NavAction::OpenView {
                    selection,
                    view: state.view,
                }
                .encode(),
            });
        }
        let records = self.fetch_records(key).await?;
        Ok(cache.put(key, records).await)
    }

    async fn results(&self, state: QueryState, allow_fetch: bool) -> Result<Screen, NavError> {
        let selection = state.selection();
        self.check_scope(&selection.scope)?;
        let entry = self.records_for(&state, allow_fetch).await?;

        let filtered = apply_filters(&entry.records, &selection, self.today(), &self.rules)?;
        let total_notices = filtered.len();
        let groups = group_by_entity(filtered);
        let page_size = self.page_size(state.view);
        let page = paginate(&groups, state.page_index, page_size);
        let first_ordinal = 1 + page.clamped_index * page_size;

        let group_views = page
            .items
            .into_iter()
            .enumerate()
            .map(|(i, group)| GroupView {
                entity_name: group.entity_name.clone(),
                notice_count: group.records.len(),
                budget_total: group.budget_total(),
                ordinal: (state.view == ViewDensity::Detail).then_some(first_ordinal + i),
                notices: match state.view {
                    ViewDensity::Summary => Vec::new(),
                    ViewDensity::Detail => group.records,
                },
            })
            .collect();

        let clamped = state.at_page(i64::try_from(page.clamped_index).unwrap_or(0));
        Ok(Screen::Results(PagePayload {
            title: format!("{} / {}", state.view.code(), selection_title(&selection)),
            view: state.view,
            page_index: page.clamped_index,
            total_pages: page.total_pages,
            total_groups: groups.len(),
            total_notices,
            fetched_at: entry.fetched_at,
            groups: group_views,
            buttons: self.page_buttons(&clamped, page.total_pages),
        }))
    }

    fn page_buttons(&self, state: &QueryState, total_pages: usize) -> Vec<Button> {
        let mut buttons = Vec::new();
        if state.page_index > 0 {
            buttons.push(Button::new("◁", &NavAction::for_page(&state.at_page(state.page_index - 1))));
        }
        if state.page_index + 1 < i64::try_from(total_pages).unwrap_or(i64::MAX) {
            buttons.push(Button::new("▷", &NavAction::for_page(&state.at_page(state.page_index + 1))));
        }
        let other = match state.view {
            ViewDensity::Summary => ViewDensity::Detail,
            ViewDensity::Detail => ViewDensity::Summary,
        };
        buttons.push(Button::new(
            other.code(),
            &NavAction::OpenView {
                selection: state.selection(),
                view: other,
            },
        ));
        buttons.push(Button::new(BACK_LABEL, &NavAction::PickScope(state.selection())));
        buttons.push(Button::new(RESET_LABEL, &NavAction::Reset));
        buttons
    }

    fn root_menu(&self, notice: Option<String>) -> Screen {
        let mut buttons: Vec<Button> = ContractKind::ALL
            .iter()
            .map(|kind| Button::new(kind_label(*kind), &NavAction::PickKind(*kind)))
            .collect();
        buttons.push(Button::new(RESET_LABEL, &NavAction::Reset));
        Screen::Menu(MenuScreen {
            title: "CONTRATO".to_string(),
            notice,
            buttons,
        })
    }

    fn status_menu(&self, kind: ContractKind) -> Screen {
        let mut buttons: Vec<Button> = StatusMode::ALL
            .iter()
            .map(|status| {
                Button::new(
                    status_label(*status),
                    &NavAction::PickStatus {
                        kind,
                        status: *status,
                    },
                )
            })
            .collect();
        buttons.push(Button::new(BACK_LABEL, &NavAction::ShowRoot));
        Screen::Menu(MenuScreen {
            title: kind.code().to_string(),
            notice: None,
            buttons,
        })
    }

    fn scope_menu(&self, kind: ContractKind, status: StatusMode) -> Screen {
        let scopes = std::iter::once(Scope::General).chain(
            self.rules
                .regions()
                .iter()
                .map(|region| Scope::Region(region.code.clone())),
        );
        let mut buttons: Vec<Button> = scopes
            .map(|scope| {
                let label = scope.code().to_string();
                Button::new(label, &NavAction::PickScope(Selection::new(kind, status, scope)))
            })
            .collect();
        buttons.push(Button::new(BACK_LABEL, &NavAction::PickKind(kind)));
        Screen::Menu(MenuScreen {
            title: format!("{} / {}", kind.code(), status.code()),
            notice: None,
            buttons,
        })
    }

    fn view_menu(&self, selection: &Selection) -> Screen {
        let mut buttons: Vec<Button> = [ViewDensity::Summary, ViewDensity::Detail]
            .into_iter()
            .map(|view| {
                Button::new(
                    view.code(),
                    &NavAction::OpenView {
                        selection: selection.clone(),
                        view,
                    },
                )
            })
            .collect();
        buttons.push(Button::new(
            BACK_LABEL,
            &NavAction::PickStatus {
                kind: selection.kind,
                status: selection.status,
            },
        ));
        Screen::Menu(MenuScreen {
            title: selection_title(selection),
            notice: None,
            buttons,
        })
    }

    /// Open works notices first published today. Always a fresh fetch; the
    /// navigation caches are neither read nor written.
    pub async fn todays_open_notices(&self) -> Result<Digest, FeedError> {
        let key = FetchKey::new(FeedKind::Works, FeedStatus::Open);
        let today = self.today();
        let records = self
            .fetch_records(key)
            .await?
            .into_iter()
            .filter(|r| r.first_published == Some(today))
            .collect();
        Ok(Digest::from_groups(today, group_by_entity(records)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestEntry {
    pub entity_name: String,
    pub notice_count: usize,
    pub budgets: Vec<f64>,
    pub budget_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Digest {
    pub date: NaiveDate,
    pub entries: Vec<DigestEntry>,
}

impl Digest {
    pub fn from_groups(date: NaiveDate, groups: Vec<EntityGroup>) -> Self {
        let entries = groups
            .iter()
            .map(|group| DigestEntry {
                entity_name: group.entity_name.clone(),
                notice_count: group.records.len(),
                budgets: group.records.iter().filter_map(|r| r.budget_ex_vat).collect(),
                budget_total: group.budget_total(),
            })
            .collect();
        Self { date, entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notice_count(&self) -> usize {
        self.entries.iter().map(|e| e.notice_count).sum()
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![format!("NOVEDADES HOY ({}) OBRAS", self.date)];
        for entry in &self.entries {
            let amounts = entry
                .budgets
                .iter()
                .map(|b| format!("{b:.2} €"))
                .collect::<Vec<_>>()
                .join("; ");
            lines.push(format!("{}: {} · {amounts}", entry.entity_name, entry.notice_count));
        }
        lines.join("\n")
    }
}

/// Destination of the scheduled digest.
#[async_trait]
pub trait DigestSink: Send + Sync {
    async fn deliver(&self, digest: &Digest) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogDigestSink;

#[async_trait]
impl DigestSink for LogDigestSink {
    async fn deliver(&self, digest: &Digest) -> Result<()> {
        info!(
            date = %digest.date,
            entities = digest.entries.len(),
            notices = digest.notice_count(),
            "daily digest\n{}",
            digest.render_text()
        );
        Ok(())
    }
}

/// Builds today's digest and hands it to `sink` unless it is empty.
pub async fn run_digest(engine: &NoticeEngine, sink: &dyn DigestSink) -> Result<Digest> {
    let digest = engine
        .todays_open_notices()
        .await
        .context("building daily digest")?;
    if digest.is_empty() {
        debug!(date = %digest.date, "no notices published today; digest skipped");
        return Ok(digest);
    }
    sink.deliver(&digest).await.context("delivering daily digest")?;
    Ok(digest)
}

pub async fn maybe_build_scheduler(
    config: &EngineConfig,
    engine: Arc<NoticeEngine>,
    sink: Arc<dyn DigestSink>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.digest_cron_1, &config.digest_cron_2] {
        let engine = engine.clone();
        let sink = sink.clone();
        let job = Job::new_async_tz(cron.as_str(), config.timezone, move |_uuid, _l| {
            let engine = engine.clone();
            let sink = sink.clone();
            Box::pin(async move {
                if let Err(err) = run_digest(&engine, sink.as_ref()).await {
                    warn!(error = %err, "scheduled digest failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Madrid;
    use procnav_adapters::{normalize_json_page, FeedFormat, FieldMapping};
    use procnav_storage::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn rec(id: &str, entity: &str, deadline: Option<NaiveDate>) -> NoticeRecord {
        NoticeRecord::new(id, format!("Notice {id}"))
            .with_entity(entity)
            .with_deadline(deadline)
    }

    /// In-memory feed serving fixed pages for every key; counts page requests.
    #[derive(Debug)]
    struct PagedFeed {
        pages: Mutex<Vec<Vec<NoticeRecord>>>,
        page_size: usize,
        calls: AtomicUsize,
        fail: bool,
    }

    impl PagedFeed {
        fn new(pages: Vec<Vec<NoticeRecord>>, page_size: usize) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages),
                page_size,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(Vec::new()),
                page_size: 2,
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }

        fn replace_pages(&self, pages: Vec<Vec<NoticeRecord>>) {
            *self.pages.lock().unwrap() = pages;
        }
    }

    #[async_trait]
    impl NoticeFeed for PagedFeed {
        fn feed_id(&self) -> &str {
            "paged"
        }

        fn format(&self) -> FeedFormat {
            FeedFormat::Fixture
        }

        fn page_size(&self) -> usize {
            self.page_size
        }

        async fn fetch_page(
            &self,
            _ctx: &FeedContext,
            _key: FetchKey,
            page: usize,
        ) -> Result<Vec<NoticeRecord>, FeedError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail {
                return Err(FeedError::Malformed {
                    feed_id: "paged".into(),
                    message: "upstream down".into(),
                });
            }
            Ok(self.pages.lock().unwrap().get(page).cloned().unwrap_or_default())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn engine_with(feed: Arc<PagedFeed>, config: EngineConfig) -> (NoticeEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = NoticeEngine::new(
            &config,
            FeedRegistry::single(feed),
            KeywordRules::default(),
            clock.clone(),
        );
        (engine, clock)
    }

    fn results(screen: Screen) -> PagePayload {
        match screen {
            Screen::Results(page) => page,
            Screen::Menu(menu) => panic!("expected results, got menu {}", menu.title),
        }
    }

    fn ids(records: &[NoticeRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn normalization_strips_accents_case_and_punctuation() {
        assert_eq!(normalize_text("Ingeniería  civil/árbol"), "INGENIERIA CIVIL ARBOL");
        assert_eq!(normalize_text("Añarbe, S.A."), "ANARBE S A");
        assert_eq!(normalize_text("  --  "), "");
    }

    #[test]
    fn negative_keyword_wins_over_positive() {
        let rules = KeywordRules::default();
        assert!(!rules.is_engineering("Servicio de INGENIERIA y LIMPIEZA"));
        assert!(rules.is_engineering("Redacción del PROYECTO de urbanización"));
        assert!(rules.is_engineering("asistencia tecnica a la direccion de obra"));
        assert!(!rules.is_engineering("Suministro de mobiliario"));
    }

    #[test]
    fn open_deadline_filter_keeps_today_and_drops_undated() {
        let today = date(2026, 3, 2);
        assert!(keep_open_deadline(&rec("a", "E", Some(today)), today));
        assert!(!keep_open_deadline(&rec("b", "E", Some(date(2026, 3, 1))), today));
        assert!(!keep_open_deadline(&rec("c", "E", None), today));
    }

    #[test]
    fn structured_code_takes_precedence_over_place_names() {
        let rules = KeywordRules::default();
        let gip = rules.region("GIP").unwrap();

        let coded = rec("a", "Ayuntamiento de Bilbao", None).with_region_code(Some("20".into()));
        assert!(in_region(&coded, gip));

        let other_code = NoticeRecord::new("b", "Obras en Tolosa")
            .with_entity("Ayuntamiento de Tolosa")
            .with_region_code(Some("48".into()));
        assert!(!in_region(&other_code, gip));

        let by_authority = rec("c", "Gobierno Vasco", None).with_authority_region_code(Some("20".into()));
        assert!(in_region(&by_authority, gip));

        let by_text = NoticeRecord::new("d", "Reforma del puerto de DONOSTIA").with_entity("Euskadi");
        assert!(in_region(&by_text, gip));

        let uncoded_elsewhere = NoticeRecord::new("e", "Reforma en Getxo").with_entity("Ayuntamiento de Getxo");
        assert!(!in_region(&uncoded_elsewhere, gip));
    }

    #[test]
    fn filters_apply_in_conjunction_and_reject_unknown_regions() {
        let rules = KeywordRules::default();
        let today = date(2026, 3, 2);
        let records = vec![
            NoticeRecord::new("1", "Redacción de proyecto en Irun").with_deadline(Some(date(2026, 3, 9))),
            NoticeRecord::new("2", "Redacción de proyecto en Irun").with_deadline(Some(date(2026, 2, 9))),
            NoticeRecord::new("3", "Limpieza de edificios en Irun").with_deadline(Some(date(2026, 3, 9))),
            NoticeRecord::new("4", "Redacción de proyecto en Getxo").with_deadline(Some(date(2026, 3, 9))),
        ];
        let selection = Selection::new(
            ContractKind::Engineering,
            StatusMode::InTerm,
            Scope::Region("GIP".into()),
        );
        let kept = apply_filters(&records, &selection, today, &rules).unwrap();
        assert_eq!(ids(&kept), ["1"]);

        let unknown = Selection::new(ContractKind::Works, StatusMode::Open, Scope::Region("BIZ".into()));
        assert!(matches!(
            apply_filters(&records, &unknown, today, &rules),
            Err(NavError::UnknownRegion(code)) if code == "BIZ"
        ));
    }

    #[test]
    fn grouping_orders_entities_and_deadlines_and_is_idempotent() {
        let records = vec![
            rec("3", "Beta", None),
            rec("1", "Alpha", Some(date(2026, 3, 20))),
            rec("2", "Beta", Some(date(2026, 3, 5))),
            rec("4", "Alpha", Some(date(2026, 3, 10))),
        ];
        let groups = group_by_entity(records);
        let names: Vec<_> = groups.iter().map(|g| g.entity_name.as_str()).collect();
        assert_eq!(names, ["Alpha", "Beta"]);
        assert_eq!(ids(&groups[0].records), ["4", "1"]);
        assert_eq!(ids(&groups[1].records), ["2", "3"]);

        let flattened = groups.iter().flat_map(|g| g.records.clone()).collect();
        assert_eq!(group_by_entity(flattened), groups);
    }

    #[test]
    fn filter_and_group_pipeline_is_deterministic() {
        let rules = KeywordRules::default();
        let today = date(2026, 3, 2);
        let records = vec![
            rec("5", "Gamma", Some(date(2026, 3, 9))),
            rec("2", "Alpha", None),
            rec("4", "Beta", Some(date(2026, 3, 9))),
            rec("1", "Alpha", Some(date(2026, 3, 9))),
            rec("3", "Alpha", Some(date(2026, 3, 4))),
            rec("6", "Beta", Some(date(2026, 2, 1))),
        ];
        for status in [StatusMode::Open, StatusMode::InTerm] {
            let selection = Selection::new(ContractKind::Works, status, Scope::General);
            let once = group_by_entity(apply_filters(&records, &selection, today, &rules).unwrap());
            let twice = group_by_entity(apply_filters(&records, &selection, today, &rules).unwrap());
            assert_eq!(once, twice);
        }

        let selection = Selection::new(ContractKind::Works, StatusMode::InTerm, Scope::General);
        let groups = group_by_entity(apply_filters(&records, &selection, today, &rules).unwrap());
        assert_eq!(ids(&groups[0].records), ["3", "1"]);
    }

    #[test]
    fn pagination_clamps_any_index() {
        let items: Vec<u32> = (0..5).collect();
        let page = paginate(&items, 1, 2);
        assert_eq!((page.items.clone(), page.clamped_index, page.total_pages), (vec![2, 3], 1, 3));
        assert_eq!(paginate(&items, 99, 2).items, vec![4]);
        assert_eq!(paginate(&items, 99, 2).clamped_index, 2);
        assert_eq!(paginate(&items, -7, 2).clamped_index, 0);
        assert_eq!(paginate(&items, i64::MIN, 2).items, vec![0, 1]);

        let empty: Vec<u32> = Vec::new();
        let page = paginate(&empty, 3, 4);
        assert_eq!((page.total_pages, page.clamped_index), (1, 0));
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn dedup_result_is_independent_of_page_split() {
        let all: Vec<_> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|id| rec(id, "E", None))
            .collect();
        let key = FetchKey::new(FeedKind::Works, FeedStatus::Open);

        let overlapping = PagedFeed::new(
            vec![
                vec![all[0].clone(), all[1].clone(), all[2].clone()],
                vec![all[2].clone(), all[3].clone(), all[4].clone()],
                vec![all[5].clone(), all[0].clone()],
            ],
            3,
        );
        let pairs = PagedFeed::new(all.chunks(2).map(|c| c.to_vec()).collect(), 2);

        let a = fetch_deduplicated(overlapping.as_ref(), key, 40, Madrid).await.unwrap();
        let b = fetch_deduplicated(pairs.as_ref(), key, 40, Madrid).await.unwrap();
        let mut a_ids = ids(&a.records);
        let mut b_ids = ids(&b.records);
        a_ids.sort();
        b_ids.sort();
        assert_eq!(a_ids, b_ids);
        assert_eq!(a_ids.len(), 6);
        assert_eq!(a.stop, FetchStop::ShortPage);
        // Exact multiple of the page size: the empty page after the last one ends it.
        assert_eq!(b.pages, 4);
    }

    #[tokio::test]
    async fn repeated_full_page_stops_the_fetch() {
        let page = vec![rec("a", "E", None), rec("b", "E", None)];
        let feed = PagedFeed::new(vec![page.clone(), page.clone(), page], 2);
        let key = FetchKey::new(FeedKind::Works, FeedStatus::Closed);
        let outcome = fetch_deduplicated(feed.as_ref(), key, 40, Madrid).await.unwrap();
        assert_eq!(outcome.stop, FetchStop::NoNewRecords);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn page_cap_bounds_an_endless_feed() {
        let pages = (0..10)
            .map(|p| vec![rec(&format!("{p}-a"), "E", None), rec(&format!("{p}-b"), "E", None)])
            .collect();
        let feed = PagedFeed::new(pages, 2);
        let key = FetchKey::new(FeedKind::Works, FeedStatus::Open);
        let outcome = fetch_deduplicated(feed.as_ref(), key, 3, Madrid).await.unwrap();
        assert_eq!(outcome.stop, FetchStop::PageCap);
        assert_eq!(outcome.records.len(), 6);
    }

    fn end_to_end_records() -> Vec<NoticeRecord> {
        vec![
            rec("r1", "Alpha", Some(date(2026, 3, 10))),
            rec("r2", "Alpha", Some(date(2026, 2, 10))),
            rec("r3", "Beta", Some(date(2026, 3, 12))),
            rec("r4", "Beta", Some(date(2026, 1, 31))),
            rec("r5", "Gamma", Some(date(2026, 4, 1))),
        ]
    }

    #[tokio::test]
    async fn end_to_end_clamps_to_last_detail_page() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, _clock) = engine_with(feed.clone(), EngineConfig::default());

        let first = results(engine.navigate("view:OBRAS:PLAZO:GEN:DET").await.unwrap());
        assert_eq!(first.total_groups, 3);
        assert_eq!(first.total_notices, 3);
        assert_eq!(first.total_pages, 2);

        let page = results(engine.navigate("det:OBRAS:PLAZO:GEN:5").await.unwrap());
        assert_eq!(page.page_index, 1);
        assert_eq!(page.groups.len(), 1);
        assert_eq!(page.groups[0].entity_name, "Gamma");
        assert_eq!(page.groups[0].ordinal, Some(3));
        assert_eq!(ids(&page.groups[0].notices), ["r5"]);

        let tokens: Vec<_> = page.buttons.iter().map(|b| b.token.as_str()).collect();
        assert!(tokens.contains(&"det:OBRAS:PLAZO:GEN:0"));
        assert!(!tokens.iter().any(|t| t.ends_with(":2")));
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn same_page_token_renders_the_same_groups() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, _clock) = engine_with(feed.clone(), EngineConfig::default());
        engine.navigate("view:OBRAS:OPEN:GEN:DET").await.unwrap();

        for token in ["det:OBRAS:OPEN:GEN:1", "sum:OBRAS:OPEN:GEN:0"] {
            let first = results(engine.navigate(token).await.unwrap());
            let again = results(engine.navigate(token).await.unwrap());
            assert_eq!(first.groups, again.groups);
            assert_eq!(first, again);
        }
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn summary_pages_carry_totals_without_notices() {
        let records = vec![
            rec("1", "Alpha", None).with_budget(Some(100.0)),
            rec("2", "Alpha", None).with_budget(Some(50.5)),
            rec("3", "Alpha", None),
        ];
        let feed = PagedFeed::new(vec![records], 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());
        let page = results(engine.navigate("view:OBRAS:OPEN:GEN:RES").await.unwrap());
        assert_eq!(page.groups[0].budget_total, 150.5);
        assert_eq!(page.groups[0].notice_count, 3);
        assert_eq!(page.groups[0].ordinal, None);
        assert!(page.groups[0].notices.is_empty());
    }

    #[tokio::test]
    async fn paging_reads_cache_only_and_expires_with_browse_ttl() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, clock) = engine_with(feed.clone(), EngineConfig::default());

        engine.navigate("view:OBRAS:OPEN:GEN:RES").await.unwrap();
        clock.advance(chrono::Duration::seconds(300));
        engine.navigate("sum:OBRAS:OPEN:GEN:1").await.unwrap();
        engine.navigate("det:OBRAS:OPEN:GEN:0").await.unwrap();
        assert_eq!(feed.calls(), 1);

        clock.advance(chrono::Duration::seconds(1));
        let err = engine.navigate("sum:OBRAS:OPEN:GEN:1").await.unwrap_err();
        match err {
            NavError::CacheExpired { retry_token, .. } => {
                assert_eq!(retry_token, "view:OBRAS:OPEN:GEN:RES");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(feed.calls(), 1);

        engine.navigate("view:OBRAS:OPEN:GEN:RES").await.unwrap();
        assert_eq!(feed.calls(), 2);
    }

    /// Wraps a real cache and counts calls per operation.
    #[derive(Debug)]
    struct CountingCache {
        inner: TtlCache,
        gets: AtomicUsize,
        puts: AtomicUsize,
        clears: AtomicUsize,
    }

    impl CountingCache {
        fn new(clock: Arc<ManualClock>) -> Arc<Self> {
            Arc::new(Self {
                inner: TtlCache::new(Duration::from_secs(300), clock),
                gets: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
                clears: AtomicUsize::new(0),
            })
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.gets.load(AtomicOrdering::SeqCst),
                self.puts.load(AtomicOrdering::SeqCst),
                self.clears.load(AtomicOrdering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl NoticeCache for CountingCache {
        async fn get(&self, key: &FetchKey) -> Option<CacheEntry> {
            self.gets.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.get(key).await
        }

        async fn put(&self, key: FetchKey, records: Vec<NoticeRecord>) -> CacheEntry {
            self.puts.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.put(key, records).await
        }

        async fn clear(&self) {
            self.clears.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.clear().await;
        }
    }

    #[tokio::test]
    async fn injected_caches_see_reads_only_on_page_actions() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, clock) = engine_with(feed.clone(), EngineConfig::default());
        let browse = CountingCache::new(clock.clone());
        let keyword = CountingCache::new(clock);
        let engine = engine.with_caches(browse.clone(), keyword.clone());

        engine.navigate("view:OBRAS:OPEN:GEN:RES").await.unwrap();
        assert_eq!(browse.counts(), (1, 1, 0));

        engine.navigate("sum:OBRAS:OPEN:GEN:1").await.unwrap();
        engine.navigate("det:OBRAS:OPEN:GEN:0").await.unwrap();
        engine.navigate("view:OBRAS:OPEN:GEN:DET").await.unwrap();
        assert_eq!(browse.counts(), (4, 1, 0));
        assert_eq!(keyword.counts(), (0, 0, 0));
        assert_eq!(feed.calls(), 1);

        engine.navigate("view:ING:OPEN:GEN:RES").await.unwrap();
        assert_eq!(keyword.counts(), (1, 1, 0));

        engine.navigate("reset").await.unwrap();
        assert_eq!(browse.counts().2, 1);
        assert_eq!(keyword.counts().2, 1);
    }

    /// Serves one recorded JSON page through the Euskadi field mapping.
    #[derive(Debug)]
    struct JsonPageFeed {
        page: serde_json::Value,
    }

    #[async_trait]
    impl NoticeFeed for JsonPageFeed {
        fn feed_id(&self) -> &str {
            "json-page"
        }

        fn format(&self) -> FeedFormat {
            FeedFormat::Fixture
        }

        fn page_size(&self) -> usize {
            50
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
            normalize_json_page("json-page", &FieldMapping::euskadi(), &self.page, ctx.timezone)
        }
    }

    #[tokio::test]
    async fn utc_deadlines_are_judged_on_the_reference_calendar() {
        let feed = Arc::new(JsonPageFeed {
            page: serde_json::json!({"items": [
                {"id": "late", "object": "Obra", "entity": {"name": "Alpha"},
                 "deadlineDate": "2026-03-01T23:30:00Z"},
                {"id": "gone", "object": "Obra", "entity": {"name": "Alpha"},
                 "deadlineDate": "2026-03-01T22:30:00Z"}
            ]}),
        });
        let clock = Arc::new(ManualClock::new(start()));
        let engine = NoticeEngine::new(
            &EngineConfig::default(),
            FeedRegistry::single(feed),
            KeywordRules::default(),
            clock,
        );
        let page = results(engine.navigate("view:OBRAS:PLAZO:GEN:DET").await.unwrap());
        assert_eq!(page.total_notices, 1);
        assert_eq!(ids(&page.groups[0].notices), ["late"]);
        assert_eq!(page.groups[0].notices[0].deadline, Some(date(2026, 3, 2)));
    }

    #[tokio::test]
    async fn unrouted_key_is_a_fetch_error() {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = NoticeEngine::new(
            &EngineConfig::default(),
            FeedRegistry::new(),
            KeywordRules::default(),
            clock,
        );
        assert!(matches!(
            engine.navigate("view:SERV:OPEN:GEN:RES").await,
            Err(NavError::Fetch(FeedError::NoRoute { .. }))
        ));
    }

    #[tokio::test]
    async fn keyword_views_use_the_longer_ttl() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, clock) = engine_with(feed.clone(), EngineConfig::default());

        engine.navigate("view:ING:OPEN:GEN:DET").await.unwrap();
        clock.advance(chrono::Duration::seconds(600));
        engine.navigate("det:ING:OPEN:GEN:1").await.unwrap();
        clock.advance(chrono::Duration::seconds(301));
        assert!(matches!(
            engine.navigate("det:ING:OPEN:GEN:1").await,
            Err(NavError::CacheExpired { .. })
        ));
    }

    #[tokio::test]
    async fn base_query_reuses_live_entry_even_if_upstream_changed() {
        let feed = PagedFeed::new(vec![vec![rec("a", "Alpha", None)]], 50);
        let (engine, _clock) = engine_with(feed.clone(), EngineConfig::default());
        engine.navigate("view:SERV:CLOSED:GEN:RES").await.unwrap();
        feed.replace_pages(vec![vec![rec("a", "Alpha", None), rec("b", "Beta", None)]]);
        let page = results(engine.navigate("view:SERV:CLOSED:GEN:RES").await.unwrap());
        assert_eq!(page.total_notices, 1);
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_writes_nothing() {
        let feed = PagedFeed::failing();
        let (engine, _clock) = engine_with(feed.clone(), EngineConfig::default());
        assert!(matches!(
            engine.navigate("view:OBRAS:OPEN:GEN:RES").await,
            Err(NavError::Fetch(_))
        ));
        assert!(matches!(
            engine.navigate("sum:OBRAS:OPEN:GEN:0").await,
            Err(NavError::CacheExpired { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_tokens_and_unknown_regions_never_reach_the_feed() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, _clock) = engine_with(feed.clone(), EngineConfig::default());
        assert!(matches!(engine.navigate("sum:OBRAS:OPEN").await, Err(NavError::Token(_))));
        assert!(matches!(engine.navigate("zap").await, Err(NavError::Token(_))));
        assert!(matches!(
            engine.navigate("view:OBRAS:OPEN:BIZ:RES").await,
            Err(NavError::UnknownRegion(_))
        ));
        assert!(matches!(
            engine.navigate("scope:OBRAS:OPEN:BIZ").await,
            Err(NavError::UnknownRegion(_))
        ));
        assert_eq!(feed.calls(), 0);
    }

    #[tokio::test]
    async fn reset_purges_caches_and_returns_root() {
        let feed = PagedFeed::new(vec![end_to_end_records()], 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());
        engine.navigate("view:OBRAS:OPEN:GEN:RES").await.unwrap();
        let screen = engine.navigate("reset").await.unwrap();
        assert_eq!(screen.title(), "CONTRATO");
        assert!(matches!(
            engine.navigate("sum:OBRAS:OPEN:GEN:0").await,
            Err(NavError::CacheExpired { .. })
        ));
    }

    #[tokio::test]
    async fn menus_expose_forward_and_back_tokens() {
        let feed = PagedFeed::new(Vec::new(), 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());

        let root = engine.navigate("root").await.unwrap();
        let tokens: Vec<_> = root.buttons().iter().map(|b| b.token.as_str()).collect();
        assert_eq!(tokens, ["kind:OBRAS", "kind:SERV", "kind:ING", "reset"]);

        let scopes = engine.navigate("status:SERV:PLAZO").await.unwrap();
        let tokens: Vec<_> = scopes.buttons().iter().map(|b| b.token.as_str()).collect();
        assert_eq!(tokens, ["scope:SERV:PLAZO:GEN", "scope:SERV:PLAZO:GIP", "kind:SERV"]);

        let views = engine.navigate("scope:SERV:PLAZO:GIP").await.unwrap();
        let tokens: Vec<_> = views.buttons().iter().map(|b| b.token.as_str()).collect();
        assert_eq!(
            tokens,
            ["view:SERV:PLAZO:GIP:RES", "view:SERV:PLAZO:GIP:DET", "status:SERV:PLAZO"]
        );
    }

    #[tokio::test]
    async fn empty_result_is_a_single_page() {
        let feed = PagedFeed::new(Vec::new(), 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());
        let page = results(engine.navigate("view:OBRAS:CLOSED:GEN:DET").await.unwrap());
        assert_eq!((page.total_pages, page.page_index, page.groups.len()), (1, 0, 0));
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Digest>>,
    }

    #[async_trait]
    impl DigestSink for RecordingSink {
        async fn deliver(&self, digest: &Digest) -> Result<()> {
            self.delivered.lock().unwrap().push(digest.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn digest_keeps_only_todays_publications() {
        let today = date(2026, 3, 2);
        let records = vec![
            rec("1", "Alpha", None).with_first_published(Some(today)).with_budget(Some(1000.0)),
            rec("2", "Alpha", None).with_first_published(Some(today)),
            rec("3", "Beta", None).with_first_published(Some(date(2026, 3, 1))),
        ];
        let feed = PagedFeed::new(vec![records], 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());
        let sink = RecordingSink::default();

        let digest = run_digest(&engine, &sink).await.unwrap();
        assert_eq!(digest.date, today);
        assert_eq!(digest.entries.len(), 1);
        assert_eq!(digest.entries[0].notice_count, 2);
        assert_eq!(digest.entries[0].budgets, vec![1000.0]);
        assert!(digest.render_text().contains("Alpha: 2 · 1000.00 €"));
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_digest_is_not_delivered() {
        let feed = PagedFeed::new(Vec::new(), 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());
        let sink = RecordingSink::default();
        assert!(run_digest(&engine, &sink).await.unwrap().is_empty());
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn today_follows_the_reference_timezone() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap()));
        let engine = NoticeEngine::new(
            &EngineConfig::default(),
            FeedRegistry::new(),
            KeywordRules::default(),
            clock,
        );
        assert_eq!(engine.today(), date(2026, 3, 2));
    }

    #[test]
    fn keyword_rules_load_from_yaml_or_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            KeywordRules::from_workspace_root(dir.path()).unwrap(),
            KeywordRules::default()
        );

        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/keywords.yaml"),
            "engineering:\n  positive: [topografía]\nregions:\n  - code: BIZ\n    structured_code: \"48\"\n    places: [Getxo]\n",
        )
        .unwrap();
        let rules = KeywordRules::from_workspace_root(dir.path()).unwrap();
        assert!(rules.is_engineering("Levantamiento TOPOGRAFIA"));
        let biz = rules.region("BIZ").unwrap();
        assert!(in_region(&NoticeRecord::new("x", "Obras en getxo"), biz));
        assert!(rules.region("GIP").is_none());

        std::fs::write(
            dir.path().join("rules/keywords.yaml"),
            "regions:\n  - code: GEN\n    structured_code: \"1\"\n",
        )
        .unwrap();
        assert!(KeywordRules::from_workspace_root(dir.path()).is_err());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.browse_ttl, Duration::from_secs(300));
        assert_eq!(config.keyword_ttl, Duration::from_secs(900));
        assert_eq!((config.summary_page_size, config.detail_page_size), (4, 2));
        assert_eq!(config.timezone, chrono_tz::Europe::Madrid);
        assert_eq!(config.feeds_path(), PathBuf::from("./feeds.yaml"));
        config.validate().unwrap();

        let broken = EngineConfig {
            detail_page_size: 0,
            ..EngineConfig::default()
        };
        assert!(broken.validate().is_err());
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let feed = PagedFeed::new(Vec::new(), 50);
        let (engine, _clock) = engine_with(feed, EngineConfig::default());
        let sched = maybe_build_scheduler(&EngineConfig::default(), Arc::new(engine), Arc::new(LogDigestSink))
            .await
            .unwrap();
        assert!(sched.is_none());
    }
}

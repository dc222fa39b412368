//! Core domain model, query state and navigation token codec for procnav.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "procnav-core";

/// Entity name used when the feed does not name an issuing authority.
pub const UNASSIGNED_ENTITY: &str = "UNASSIGNED";

/// Tokens travel through transports with small payload limits (64 bytes for chat callbacks).
pub const MAX_TOKEN_LEN: usize = 64;

const TOKEN_DELIMITER: char = ':';
const MAX_REGION_CODE_LEN: usize = 16;

/// One procurement announcement, normalized from whichever upstream shape produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeRecord {
    pub id: String,
    pub title: String,
    pub entity_name: String,
    pub first_published: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub budget_ex_vat: Option<f64>,
    pub detail_url: Option<String>,
    /// Structured region code carried by the notice itself.
    pub region_code: Option<String>,
    /// Structured region code of the issuing authority.
    pub authority_region_code: Option<String>,
}

impl NoticeRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            entity_name: UNASSIGNED_ENTITY.to_string(),
            first_published: None,
            deadline: None,
            budget_ex_vat: None,
            detail_url: None,
            region_code: None,
            authority_region_code: None,
        }
    }

    pub fn with_entity(mut self, entity_name: impl Into<String>) -> Self {
        self.entity_name = entity_name.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Option<NaiveDate>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_budget(mut self, budget_ex_vat: Option<f64>) -> Self {
        self.budget_ex_vat = budget_ex_vat;
        self
    }

    pub fn with_first_published(mut self, first_published: Option<NaiveDate>) -> Self {
        self.first_published = first_published;
        self
    }

    pub fn with_region_code(mut self, region_code: Option<String>) -> Self {
        self.region_code = region_code;
        self
    }

    pub fn with_authority_region_code(mut self, code: Option<String>) -> Self {
        self.authority_region_code = code;
        self
    }

    /// Structured region codes present on the notice or its authority.
    pub fn structured_region_codes(&self) -> impl Iterator<Item = &str> {
        self.region_code
            .as_deref()
            .into_iter()
            .chain(self.authority_region_code.as_deref())
            .filter(|code| !code.trim().is_empty())
    }
}

/// Contract kind as the upstream feed understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Works,
    Services,
}

/// Procedure status as the upstream feed understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Open,
    Closed,
}

/// Identifies one upstream query and one cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchKey {
    pub kind: FeedKind,
    pub status: FeedStatus,
}

impl FetchKey {
    pub fn new(kind: FeedKind, status: FeedStatus) -> Self {
        Self { kind, status }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FeedKind::Works => "works",
            FeedKind::Services => "services",
        };
        let status = match self.status {
            FeedStatus::Open => "open",
            FeedStatus::Closed => "closed",
        };
        write!(f, "{kind}/{status}")
    }
}

/// Contract kind as the client picks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    Works,
    Services,
    /// Engineering subset of services; narrowed by keyword classification.
    Engineering,
}

impl ContractKind {
    pub const ALL: [ContractKind; 3] = [Self::Works, Self::Services, Self::Engineering];

    pub fn code(self) -> &'static str {
        match self {
            Self::Works => "OBRAS",
            Self::Services => "SERV",
            Self::Engineering => "ING",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn feed_kind(self) -> FeedKind {
        match self {
            Self::Works => FeedKind::Works,
            Self::Services | Self::Engineering => FeedKind::Services,
        }
    }
}

/// Procedure status as the client picks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusMode {
    Open,
    /// Open procedures whose deadline has not passed yet.
    InTerm,
    Closed,
}

impl StatusMode {
    pub const ALL: [StatusMode; 3] = [Self::Open, Self::InTerm, Self::Closed];

    pub fn code(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InTerm => "PLAZO",
            Self::Closed => "CLOSED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn feed_status(self) -> FeedStatus {
        match self {
            Self::Open | Self::InTerm => FeedStatus::Open,
            Self::Closed => FeedStatus::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    General,
    /// Named region, identified by its token code (e.g. `GIP`).
    Region(String),
}

impl Scope {
    pub const GENERAL_CODE: &'static str = "GEN";

    pub fn code(&self) -> &str {
        match self {
            Self::General => Self::GENERAL_CODE,
            Self::Region(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Result<Self, TokenError> {
        if code == Self::GENERAL_CODE {
            return Ok(Self::General);
        }
        let valid = !code.is_empty()
            && code.len() <= MAX_REGION_CODE_LEN
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self::Region(code.to_string()))
        } else {
            Err(TokenError::InvalidScope(code.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewDensity {
    Summary,
    Detail,
}

impl ViewDensity {
    pub fn code(self) -> &'static str {
        match self {
            Self::Summary => "RES",
            Self::Detail => "DET",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "RES" => Some(Self::Summary),
            "DET" => Some(Self::Detail),
            _ => None,
        }
    }
}

/// The filter dimensions of a query, without view or page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub kind: ContractKind,
    pub status: StatusMode,
    pub scope: Scope,
}

impl Selection {
    pub fn new(kind: ContractKind, status: StatusMode, scope: Scope) -> Self {
        Self {
            kind,
            status,
            scope,
        }
    }

    pub fn fetch_key(&self) -> FetchKey {
        FetchKey::new(self.kind.feed_kind(), self.status.feed_status())
    }

    /// True when the query narrows records by title keywords or place names.
    pub fn uses_keyword_filters(&self) -> bool {
        self.kind == ContractKind::Engineering || matches!(self.scope, Scope::Region(_))
    }
}

/// Full addressable state of a navigation session. Only ever lives inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryState {
    pub kind: ContractKind,
    pub status: StatusMode,
    pub scope: Scope,
    pub view: ViewDensity,
    pub page_index: i64,
}

impl QueryState {
    pub fn new(selection: Selection, view: ViewDensity, page_index: i64) -> Self {
        Self {
            kind: selection.kind,
            status: selection.status,
            scope: selection.scope,
            view,
            page_index,
        }
    }

    pub fn selection(&self) -> Selection {
        Selection::new(self.kind, self.status, self.scope.clone())
    }

    pub fn fetch_key(&self) -> FetchKey {
        FetchKey::new(self.kind.feed_kind(), self.status.feed_status())
    }

    pub fn at_page(&self, page_index: i64) -> Self {
        Self {
            page_index,
            ..self.clone()
        }
    }
}

/// Entity bucket produced by the grouping stage; derived per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityGroup {
    pub entity_name: String,
    pub records: Vec<NoticeRecord>,
}

impl EntityGroup {
    /// Sum of the known budgets in the group; notices without a budget count as zero.
    pub fn budget_total(&self) -> f64 {
        self.records.iter().filter_map(|r| r.budget_ex_vat).sum()
    }
}

/// Every action a client can request, each carrying only the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavAction {
    ShowRoot,
    PickKind(ContractKind),
    PickStatus {
        kind: ContractKind,
        status: StatusMode,
    },
    PickScope(Selection),
    /// Base query: enters a view at page 0 and may populate the cache.
    OpenView {
        selection: Selection,
        view: ViewDensity,
    },
    ShowSummaryPage {
        selection: Selection,
        page: i64,
    },
    ShowDetailPage {
        selection: Selection,
        page: i64,
    },
    Reset,
}

impl NavAction {
    pub fn for_page(state: &QueryState) -> Self {
        match state.view {
            ViewDensity::Summary => Self::ShowSummaryPage {
                selection: state.selection(),
                page: state.page_index,
            },
            ViewDensity::Detail => Self::ShowDetailPage {
                selection: state.selection(),
                page: state.page_index,
            },
        }
    }

    /// Query state addressed by the action, if it addresses a result page.
    pub fn query_state(&self) -> Option<QueryState> {
        match self {
            Self::OpenView { selection, view } => Some(QueryState::new(selection.clone(), *view, 0)),
            Self::ShowSummaryPage { selection, page } => {
                Some(QueryState::new(selection.clone(), ViewDensity::Summary, *page))
            }
            Self::ShowDetailPage { selection, page } => {
                Some(QueryState::new(selection.clone(), ViewDensity::Detail, *page))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NavAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = TOKEN_DELIMITER;
        match self {
            Self::ShowRoot => f.write_str("root"),
            Self::Reset => f.write_str("reset"),
            Self::PickKind(kind) => write!(f, "kind{d}{}", kind.code()),
            Self::PickStatus { kind, status } => {
                write!(f, "status{d}{}{d}{}", kind.code(), status.code())
            }
            Self::PickScope(sel) => write!(
                f,
                "scope{d}{}{d}{}{d}{}",
                sel.kind.code(),
                sel.status.code(),
                sel.scope.code()
            ),
            Self::OpenView { selection, view } => write!(
                f,
                "view{d}{}{d}{}{d}{}{d}{}",
                selection.kind.code(),
                selection.status.code(),
                selection.scope.code(),
                view.code()
            ),
            Self::ShowSummaryPage { selection, page } => write!(
                f,
                "sum{d}{}{d}{}{d}{}{d}{page}",
                selection.kind.code(),
                selection.status.code(),
                selection.scope.code()
            ),
            Self::ShowDetailPage { selection, page } => write!(
                f,
                "det{d}{}{d}{}{d}{}{d}{page}",
                selection.kind.code(),
                selection.status.code(),
                selection.scope.code()
            ),
        }
    }
}

impl FromStr for NavAction {
    type Err = TokenError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        decode(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("empty navigation token")]
    Empty,
    #[error("navigation token is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("unknown navigation action `{0}`")]
    UnknownAction(String),
    #[error("action `{action}` expects {expected} fields, got {found}")]
    Arity {
        action: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown contract kind `{0}`")]
    UnknownKind(String),
    #[error("unknown status `{0}`")]
    UnknownStatus(String),
    #[error("invalid scope `{0}`")]
    InvalidScope(String),
    #[error("unknown view density `{0}`")]
    UnknownView(String),
    #[error("invalid page index `{0}`")]
    InvalidPage(String),
    #[error("token `{0}` does not address a result page")]
    NotAPage(String),
}

/// Encodes the query state as a page-navigation token.
pub fn encode(state: &QueryState) -> String {
    NavAction::for_page(state).encode()
}

/// Decodes a token into the action it names; never coerces bad input to a default.
pub fn decode(token: &str) -> Result<NavAction, TokenError> {
    if token.is_empty() {
        return Err(TokenError::Empty);
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::TooLong {
            len: token.len(),
            max: MAX_TOKEN_LEN,
        });
    }

    let mut parts = token.split(TOKEN_DELIMITER);
    let action = parts.next().unwrap_or_default();
    let fields: Vec<&str> = parts.collect();

    let expected = match action {
        "root" | "reset" => 0,
        "kind" => 1,
        "status" => 2,
        "scope" => 3,
        "view" | "sum" | "det" => 4,
        other => return Err(TokenError::UnknownAction(other.to_string())),
    };
    if fields.len() != expected {
        return Err(TokenError::Arity {
            action: action.to_string(),
            expected,
            found: fields.len(),
        });
    }

    match action {
        "root" => Ok(NavAction::ShowRoot),
        "reset" => Ok(NavAction::Reset),
        "kind" => Ok(NavAction::PickKind(parse_kind(fields[0])?)),
        "status" => Ok(NavAction::PickStatus {
            kind: parse_kind(fields[0])?,
            status: parse_status(fields[1])?,
        }),
        "scope" => Ok(NavAction::PickScope(parse_selection(&fields)?)),
        "view" => {
            let view = ViewDensity::from_code(fields[3])
                .ok_or_else(|| TokenError::UnknownView(fields[3].to_string()))?;
            Ok(NavAction::OpenView {
                selection: parse_selection(&fields)?,
                view,
            })
        }
        "sum" => Ok(NavAction::ShowSummaryPage {
            selection: parse_selection(&fields)?,
            page: parse_page(fields[3])?,
        }),
        _ => Ok(NavAction::ShowDetailPage {
            selection: parse_selection(&fields)?,
            page: parse_page(fields[3])?,
        }),
    }
}

/// Decodes a token that must address a result page.
pub fn decode_query_state(token: &str) -> Result<QueryState, TokenError> {
    decode(token)?
        .query_state()
        .ok_or_else(|| TokenError::NotAPage(token.to_string()))
}

fn parse_kind(code: &str) -> Result<ContractKind, TokenError> {
    ContractKind::from_code(code).ok_or_else(|| TokenError::UnknownKind(code.to_string()))
}

fn parse_status(code: &str) -> Result<StatusMode, TokenError> {
    StatusMode::from_code(code).ok_or_else(|| TokenError::UnknownStatus(code.to_string()))
}

fn parse_selection(fields: &[&str]) -> Result<Selection, TokenError> {
    Ok(Selection::new(
        parse_kind(fields[0])?,
        parse_status(fields[1])?,
        Scope::from_code(fields[2])?,
    ))
}

fn parse_page(raw: &str) -> Result<i64, TokenError> {
    // `+3` would decode but never re-encode identically.
    if raw.starts_with('+') {
        return Err(TokenError::InvalidPage(raw.to_string()));
    }
    raw.parse::<i64>()
        .map_err(|_| TokenError::InvalidPage(raw.to_string()))
}

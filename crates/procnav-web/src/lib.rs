//! Thin axum transport over the navigation engine.
//!
//! Chat transports deliver either a typed message (answered with a new message) or
//! a button press (answered by editing the pressed message). Both shapes implement
//! [`Replyable`]; the engine never sees which one it is serving.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use procnav_core::NavAction;
use procnav_engine::{NavError, NoticeEngine, Screen};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "procnav-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NoticeEngine>,
}

impl AppState {
    pub fn new(engine: Arc<NoticeEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ReplyTarget {
    SendMessage {
        chat_id: i64,
    },
    EditMessage {
        chat_id: i64,
        message_id: i64,
        callback_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    #[serde(flatten)]
    pub target: ReplyTarget,
    #[serde(flatten)]
    pub screen: Screen,
}

/// An inbound event that carries a navigation token and knows how to be answered.
pub trait Replyable {
    fn token(&self) -> String;
    fn reply(&self, screen: Screen) -> Reply;
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub text: String,
}

impl Replyable for InboundMessage {
    fn token(&self) -> String {
        match self.text.trim() {
            "/start" | "/menu" => NavAction::ShowRoot.encode(),
            "/reset" => NavAction::Reset.encode(),
            other => other.to_string(),
        }
    }

    fn reply(&self, screen: Screen) -> Reply {
        Reply {
            target: ReplyTarget::SendMessage {
                chat_id: self.chat_id,
            },
            screen,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundCallback {
    pub chat_id: i64,
    pub message_id: i64,
    pub callback_id: String,
    pub data: String,
}

impl Replyable for InboundCallback {
    fn token(&self) -> String {
        self.data.clone()
    }

    fn reply(&self, screen: Screen) -> Reply {
        Reply {
            target: ReplyTarget::EditMessage {
                chat_id: self.chat_id,
                message_id: self.message_id,
                callback_id: self.callback_id.clone(),
            },
            screen,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/message", post(message_handler))
        .route("/api/callback", post(callback_handler))
        .route("/api/navigate/{token}", get(navigate_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PROCNAV_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn message_handler(
    State(state): State<Arc<AppState>>,
    Json(inbound): Json<InboundMessage>,
) -> Response {
    answer(&state, &inbound).await
}

async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Json(inbound): Json<InboundCallback>,
) -> Response {
    answer(&state, &inbound).await
}

async fn navigate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(token): AxumPath<String>,
) -> Response {
    match state.engine.navigate(&token).await {
        Ok(screen) => Json(screen).into_response(),
        Err(err) => nav_error(err),
    }
}

async fn answer<R: Replyable>(state: &AppState, inbound: &R) -> Response {
    match state.engine.navigate(&inbound.token()).await {
        Ok(screen) => Json(inbound.reply(screen)).into_response(),
        Err(err) => nav_error(err),
    }
}

fn nav_error(err: NavError) -> Response {
    let (status, kind, retry_token) = match &err {
        NavError::Token(_) => (StatusCode::BAD_REQUEST, "invalid_token", None),
        NavError::CacheExpired { retry_token, .. } => {
            (StatusCode::CONFLICT, "cache_expired", Some(retry_token.clone()))
        }
        NavError::UnknownRegion(_) => (StatusCode::NOT_FOUND, "unknown_region", None),
        NavError::Fetch(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable", None),
    };
    if status.is_server_error() {
        warn!(error = %err, "navigation failed");
    }
    (
        status,
        Json(json!({
            "error": kind,
            "message": err.to_string(),
            "retry_token": retry_token,
        })),
    )
        .into_response()
}

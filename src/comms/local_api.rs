use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::agent::config::Config;
use crate::agent::snapshot;
use crate::engine::Engine;
use crate::envelope::reply::EMPTY_REPLY;
use crate::envelope::{CallbackQuery, InboundMessage};
use crate::error::{GateError, GateResult};
use crate::pay::Pay;
use crate::security::audit_log::AuditLogger;
use crate::security::token_refresh::spawn_token_prewarm;

type SharedState = Arc<AppState>;

/// Application hook for decoded callback messages.
///
/// The returned string is written back as the response body; build it with
/// [`crate::envelope::reply_text`] or [`InboundMessage::build_reply`] so it
/// is sealed for encrypted channels.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, engine: &Engine, msg: &InboundMessage) -> GateResult<String>;
}

/// Acknowledges every message without replying.
#[derive(Debug, Clone, Default)]
pub struct AckHandler;

#[async_trait]
impl MessageHandler for AckHandler {
    async fn handle(&self, engine: &Engine, msg: &InboundMessage) -> GateResult<String> {
        debug!(
            app_id = %engine.app_id(),
            msg_type = msg.msg_type().unwrap_or_default(),
            "message acknowledged"
        );
        Ok(EMPTY_REPLY.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engines: HashMap<String, Engine>,
    pub pay: Option<Pay>,
    pub handler: Arc<dyn MessageHandler>,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(engines: Vec<Engine>, pay: Option<Pay>) -> Self {
        Self {
            engines: engines
                .into_iter()
                .map(|e| (e.app_id().to_string(), e))
                .collect(),
            pay,
            handler: Arc::new(AckHandler),
            audit: AuditLogger::new(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn engine(&self, app_id: &str) -> Option<&Engine> {
        self.engines.get(app_id)
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct JsTicketQuery {
    #[serde(default)]
    pub url: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn status_for(err: &GateError) -> StatusCode {
    match err {
        GateError::Authentication(_) => StatusCode::UNAUTHORIZED,
        GateError::MalformedInput(_) | GateError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        GateError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Log a rejected callback on the audit target and turn it into a response.
fn reject(state: &AppState, app_id: &str, channel: &str, err: GateError) -> Response {
    match &err {
        GateError::Authentication(_) => state.audit.signature_invalid(app_id, channel),
        GateError::InvalidKey(reason) => state.audit.decrypt_failed(app_id, reason),
        GateError::MalformedInput(reason) => state.audit.decrypt_failed(app_id, reason),
        _ => {}
    }
    error_response(status_for(&err), err.to_string())
}

fn unknown_app(app_id: &str) -> Response {
    warn!(app_id = %app_id, "callback for unknown app id");
    error_response(StatusCode::NOT_FOUND, format!("unknown app id {app_id}"))
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], body).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// URL verification handshake.
async fn callback_verify(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(engine) = state.engine(&app_id) else {
        return unknown_app(&app_id);
    };
    match engine.receive(query, Vec::new()).validate() {
        Ok(echo) => echo.into_response(),
        Err(err) => reject(&state, &app_id, "callback", err),
    }
}

async fn callback_message(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    let Some(engine) = state.engine(&app_id) else {
        return unknown_app(&app_id);
    };
    let msg = match engine.receive(query, body.to_vec()).parse() {
        Ok(msg) => msg,
        Err(err) => return reject(&state, &app_id, "callback", err),
    };
    match state.handler.handle(engine, &msg).await {
        Ok(reply) => xml_response(reply),
        Err(err) => {
            error!(app_id = %app_id, error = %err, "message handler failed");
            // The platform retries on anything but a 2xx.
            EMPTY_REPLY.into_response()
        }
    }
}

async fn component_ticket(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    let Some(engine) = state.engine(&app_id) else {
        return unknown_app(&app_id);
    };
    let stored = engine
        .receive(query, body.to_vec())
        .parse()
        .and_then(|msg| engine.accept_component_ticket(&msg));
    match stored {
        Ok(_) => EMPTY_REPLY.into_response(),
        Err(err) => reject(&state, &app_id, "component_ticket", err),
    }
}

async fn pay_notify(State(state): State<SharedState>, body: Bytes) -> Response {
    let Some(pay) = &state.pay else {
        return error_response(StatusCode::NOT_FOUND, "payment is not configured");
    };
    let result = pay.notify(&body).await;
    if let Some(err) = &result.error {
        debug!(kind = ?result.kind, error = %err, "payment notification rejected");
    }
    xml_response(result.response)
}

async fn js_ticket(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
    Query(query): Query<JsTicketQuery>,
) -> Response {
    let Some(engine) = state.engine(&app_id) else {
        return unknown_app(&app_id);
    };
    if query.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required");
    }
    match engine.js_sign(&query.url).await {
        Ok(sign) => Json(sign).into_response(),
        Err(err) => {
            error!(app_id = %app_id, error = %err, "js signature failed");
            error_response(status_for(&err), err.to_string())
        }
    }
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/callback/{app_id}",
            get(callback_verify).post(callback_message),
        )
        .route("/open/{app_id}/ticket", post(component_ticket))
        .route("/pay/notify", post(pay_notify))
        .route("/js_ticket/{app_id}", get(js_ticket))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
}

/// Run the callback server until Ctrl-C.
///
/// The credential snapshot named by the config is restored before listening
/// and written back on shutdown.
pub async fn serve(config: Config, port: u16) -> Result<()> {
    let engines = config.build_engines()?;
    let pay = config.build_pay()?;
    let cache_file = FsPath::new(&config.cache_file);

    if cache_file.exists() {
        if let Err(err) = snapshot::load(cache_file, &engines) {
            warn!(error = %err, "ignoring unreadable credential snapshot");
        }
    }

    let prewarm = config
        .prewarm_interval_secs
        .map(|secs| spawn_token_prewarm(engines.clone(), Duration::from_secs(secs)));

    let state = Arc::new(AppState::new(engines.clone(), pay));
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(accounts = engines.len(), "callback server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future()
        .await?;

    if let Some(handle) = prewarm {
        handle.abort();
    }
    snapshot::save(cache_file, &engines)?;
    Ok(())
}

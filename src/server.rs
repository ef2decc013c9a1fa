use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::RelayError;
use crate::relay::{ChatInput, Relay};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub prompt: Option<String>,
    pub last_code: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    pub chat_text: String,
    pub conversation_id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

/// `x-api-key` wins; otherwise `Authorization`, with or without a (case-insensitive) `Bearer` scheme.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(key) = header("x-api-key") {
        return Some(key.to_string());
    }
    let auth = header("authorization")?;
    let key = match auth.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        // header values arrive trimmed, so a bare scheme means no key
        None if auth.eq_ignore_ascii_case("bearer") => "",
        _ => auth,
    };
    (!key.is_empty()).then(|| key.to_string())
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatResponse>, RelayError> {
    let Json(body) = body.map_err(|e| RelayError::Validation(e.body_text()))?;
    let reply = state
        .relay
        .handle_chat_request(ChatInput {
            session_id: body.conversation_id,
            prompt: body.prompt.unwrap_or_default(),
            prior_code: body.last_code,
            credential: credential_from_headers(&headers),
        })
        .await?;
    Ok(Json(ChatResponse {
        content: reply.code_fragment,
        chat_text: reply.explanation_text,
        conversation_id: reply.session_id,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.relay.store().session_count().await;
    Json(HealthResponse { status: "ok", sessions })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/health", get(health))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

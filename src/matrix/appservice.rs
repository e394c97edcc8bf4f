use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bridge::Bridge;

#[derive(Clone)]
pub struct AppserviceState {
    pub bridge: Arc<Bridge>,
    pub token_hs: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    access_token: Option<String>,
}

/// A single event out of a pushed transaction. Shape varies by `type`; only
/// the fields the dispatcher needs are modeled, the rest pass through in
/// `content` untouched (spec.md §4.6).
#[derive(Debug, Deserialize)]
pub struct MatrixEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl MatrixEvent {
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref().or(self.user_id.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    events: Vec<MatrixEvent>,
}

pub fn router(state: AppserviceState) -> Router {
    Router::new()
        .route("/transactions/{txid}", put(handle_transaction))
        .route("/users/{mxid}", get(handle_user_query))
        .with_state(state)
}

fn check_token(state: &AppserviceState, query: &AuthQuery) -> Result<(), Response> {
    match &query.access_token {
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"errcode": "M_MISSING_TOKEN"})),
        )
            .into_response()),
        Some(t) if t != &state.token_hs => Err((
            StatusCode::FORBIDDEN,
            Json(json!({"errcode": "M_FORBIDDEN"})),
        )
            .into_response()),
        Some(_) => Ok(()),
    }
}

async fn handle_transaction(
    State(state): State<AppserviceState>,
    Path(_txid): Path<String>,
    Query(query): Query<AuthQuery>,
    Json(body): Json<TransactionBody>,
) -> Response {
    if let Err(resp) = check_token(&state, &query) {
        return resp;
    }
    info!(count = body.events.len(), "received transaction");
    for event in body.events {
        state.bridge.dispatch_event(event).await;
    }
    (StatusCode::OK, Json(json!({}))).into_response()
}

async fn handle_user_query(
    State(state): State<AppserviceState>,
    Path(mxid): Path<String>,
    Query(query): Query<AuthQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &query) {
        return resp;
    }
    let local_part = mxid
        .strip_prefix('@')
        .and_then(|rest| rest.split(':').next())
        .unwrap_or("");
    if local_part.starts_with("gitter") {
        if let Err(e) = state.bridge.matrix().register(local_part).await {
            warn!(error = %e, user = %mxid, "best-effort register on /users query failed");
        }
        (StatusCode::OK, Json(json!({}))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"errcode": "twisted.no_such_user"})),
        )
            .into_response()
    }
}

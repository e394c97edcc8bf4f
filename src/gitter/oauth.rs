use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::oauth_state::verify_state;

const AUTHORIZE_URL: &str = "https://gitter.im/login/oauth/authorize";
const TOKEN_URL: &str = "https://gitter.im/login/oauth/token";

type GitterOauthClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[derive(Clone)]
pub struct OauthState {
    pub bridge: Arc<Bridge>,
    pub secret_key: String,
    pub oauth_client: GitterOauthClient,
}

impl OauthState {
    pub fn new(
        bridge: Arc<Bridge>,
        secret_key: String,
        public_url: String,
        oauth_key: String,
        oauth_secret: String,
    ) -> anyhow::Result<Self> {
        let oauth_client = BasicClient::new(ClientId::new(oauth_key))
            .set_client_secret(ClientSecret::new(oauth_secret))
            .set_auth_uri(AuthUrl::new(AUTHORIZE_URL.to_string())?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_string())?)
            .set_redirect_uri(RedirectUrl::new(format!("{public_url}callback"))?);
        Ok(OauthState {
            bridge,
            secret_key,
            oauth_client,
        })
    }
}

pub fn router(state: OauthState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/auth_gitter/{state}", get(auth_gitter))
        .route("/callback", get(callback))
        .with_state(state)
}

async fn index(State(state): State<OauthState>) -> Html<String> {
    Html(format!(
        "<html><body>Chat with {} on Matrix to get started.</body></html>",
        state.bridge.bot_fullname()
    ))
}

async fn auth_gitter(State(state): State<OauthState>, Path(path_state): Path<String>) -> Response {
    let Some(matrix_username) = verify_state(&state.secret_key, &path_state) else {
        return (StatusCode::NOT_FOUND, "unknown state").into_response();
    };
    info!(user = %matrix_username, "starting Gitter authorization");
    // Carry our own HMAC-signed state through verbatim, rather than the
    // crate's generated CSRF token, so the callback can re-verify it
    // against `unique_secret_key` (spec.md §4.3).
    let state_token = path_state.clone();
    let (auth_url, _) = state
        .oauth_client
        .authorize_url(move || CsrfToken::new(state_token.clone()))
        .url();
    Redirect::to(auth_url.as_str()).into_response()
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: String,
    code: Option<String>,
}

async fn callback(State(state): State<OauthState>, Query(q): Query<CallbackQuery>) -> Response {
    let Some(matrix_username) = verify_state(&state.secret_key, &q.state) else {
        return (StatusCode::NOT_FOUND, "invalid state").into_response();
    };
    let Some(code) = q.code else {
        return (StatusCode::BAD_REQUEST, "missing code").into_response();
    };
    info!(user = %matrix_username, "Gitter authorization callback");

    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("reqwest client builds with default TLS config");

    let token_result = state
        .oauth_client
        .exchange_code(AuthorizationCode::new(code))
        .request_async(&http_client)
        .await;

    let token = match token_result {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, user = %matrix_username, "Gitter token exchange failed");
            return (StatusCode::BAD_GATEWAY, "token exchange failed").into_response();
        }
    };

    let access_token = token.access_token().secret().clone();
    if let Err(e) = state.bridge.complete_gitter_login(&matrix_username, &access_token).await {
        warn!(error = %e, user = %matrix_username, "failed to complete Gitter login");
        return (StatusCode::INTERNAL_SERVER_ERROR, "login failed").into_response();
    }

    Html("<html><body>You are now connected. Return to Matrix.</body></html>".to_string()).into_response()
}

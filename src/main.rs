use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use gitrix_bridge::bridge::Bridge;
use gitrix_bridge::config::Config;
use gitrix_bridge::gitter::{self, GitterClient, OauthState};
use gitrix_bridge::matrix::{self, AppserviceState, MatrixClient};
use gitrix_bridge::rate_limiter::RateLimiter;
use gitrix_bridge::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gitrix_bridge=info")),
        )
        .with_target(true)
        .init();

    let config = Config::from_env()?;

    let store = Store::new(&config.database_url)?;
    let matrix = MatrixClient::new(
        config.matrix_homeserver_url.clone(),
        config.matrix_appservice_token.clone(),
    );
    let gitter = GitterClient::new();

    // Process-wide limiter capping Gitter stream reconnect pressure across
    // every RoomLink (spec.md §5, §9).
    let stream_limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(30 * 60), 1.8, 0.8);

    let bridge = Bridge::new(config.clone(), store, matrix.clone(), gitter.clone(), stream_limiter);
    bridge.startup().await?;

    let appservice_state = AppserviceState {
        bridge: bridge.clone(),
        token_hs: config.matrix_homeserver_token.clone(),
    };
    let appservice_router = matrix::appservice::router(appservice_state);
    let appservice_addr = format!("0.0.0.0:{}", config.matrix_appservice_port);
    let appservice_listener = tokio::net::TcpListener::bind(&appservice_addr).await?;
    tracing::info!(addr = %appservice_addr, "Matrix appservice listener bound");

    let oauth_state = OauthState::new(
        bridge.clone(),
        config.unique_secret_key.clone(),
        config.gitter_login_url.clone(),
        config.gitter_oauth_key.clone(),
        config.gitter_oauth_secret.clone(),
    )?;
    let oauth_router = gitter::oauth::router(oauth_state);
    let oauth_addr = format!("0.0.0.0:{}", config.gitter_login_port);
    let oauth_listener = tokio::net::TcpListener::bind(&oauth_addr).await?;
    tracing::info!(addr = %oauth_addr, "Gitter OAuth listener bound");

    let appservice_server = axum::serve(appservice_listener, appservice_router.into_make_service());
    let oauth_server = axum::serve(oauth_listener, oauth_router.into_make_service());

    tokio::try_join!(
        async { appservice_server.await.map_err(anyhow::Error::from) },
        async { oauth_server.await.map_err(anyhow::Error::from) },
    )?;

    Ok(())
}

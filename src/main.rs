use anyhow::Context;

use crate::{
    auth::cache::{backend_from_config, AdvisoryCache},
    cli::Action,
    config::CacheConfig,
};

mod app;
mod auth;
mod cli;
mod config;
mod db;
mod error;
mod routes;
mod state;
#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "authgate=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli::handler(&cli::new().get_matches())? {
        Action::Serve => {
            let state = state::AppState::init().await?;
            app::serve(app::build_app(state)).await
        }
        Action::ClearSessions => {
            clear_sessions().await?;
            Ok(())
        }
        Action::ClearAuthData => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL")?;
            let pool = db::connect(&url).await?;
            let users = db::clear_auth_data(&pool).await?;
            tracing::info!(users, "auth tables cleared");
            clear_sessions().await?;
            Ok(())
        }
    }
}

async fn clear_sessions() -> anyhow::Result<u64> {
    let cfg = CacheConfig::from_env();
    let cache = AdvisoryCache::new(backend_from_config(&cfg)?, cfg.timeout());
    cache.purge_sessions().await
}

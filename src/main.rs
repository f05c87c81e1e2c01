mod cache;
mod config;
mod error;
mod evaluation;
mod rollout;
mod routes;
mod service;
mod state;
mod static_flags;
mod store;

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cache::{Clock, FlagCache, SystemClock};
use crate::store::{FlagStore, InMemoryFlagStore, PgFlagStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn FlagStore> = match config.database_url.as_deref() {
        Some(url) => {
            let db = PgPool::connect(url).await?;
            sqlx::migrate!("./migrations").run(&db).await?;
            tracing::info!("connected to postgres, migrations applied");
            Arc::new(PgFlagStore::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store with sample data");
            Arc::new(InMemoryFlagStore::with_sample_data(clock.clone()))
        }
    };

    let shutdown = CancellationToken::new();
    let cache = FlagCache::new(config.cache_ttl, clock);
    let sweeper = cache.spawn_sweeper(config.cache_sweep_interval, shutdown.child_token());

    let service = service::RolloutService::new(
        store,
        cache,
        config.analytics_enabled,
        config.default_environment.clone(),
    );
    let state = state::AppState {
        scheduler: rollout::RolloutScheduler::new(service.clone(), shutdown.clone()),
        service,
        static_flags: Arc::new(static_flags::StaticFlags::from_env()),
    };

    let app = routes::routes(state);

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;

    tracing::info!(
        addr = %config.addr(),
        environment = %config.default_environment,
        analytics = config.analytics_enabled,
        "rollout service listening"
    );

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

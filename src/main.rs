use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use cadence::{
    config::AppConfig,
    db,
    gmail::GmailProvider,
    ratelimit::{CounterStore, InMemoryCounterStore, RedisCounterStore},
    routes,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        env = %config.app_env,
        database_url = %config.redacted_database_url(),
        demo_mode = config.demo_mode,
        redis_enabled = config.redis_host.is_some(),
        "loaded cadence configuration"
    );

    let pool = db::build_pool(&config.database_url, config.database_max_pool_size)?;
    let counters = build_counter_store(&config).await?;
    let mailboxes = Arc::new(GmailProvider::new(pool.clone(), Arc::new(config.clone())));

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config, counters, mailboxes);
    let router = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn build_counter_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.redis_url() {
        Some(url) => Ok(Arc::new(RedisCounterStore::connect(&url).await?)),
        None => {
            tracing::warn!("REDIS_HOST not set, using in-process rate counters");
            Ok(Arc::new(InMemoryCounterStore::new()))
        }
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("server received shutdown signal");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

use std::{sync::Arc, time::Duration};

use tokio::signal;
use tracing_subscriber::EnvFilter;

use cadence::{
    config::AppConfig,
    core_handlers, db,
    gmail::GmailProvider,
    ratelimit::{CounterStore, InMemoryCounterStore, RedisCounterStore},
    state::AppState,
    Dispatcher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = 2,
        redis_enabled = config.redis_host.is_some(),
        "loaded cadence configuration"
    );
    let pool = db::build_pool(&config.database_url, 2)?;
    let counters: Arc<dyn CounterStore> = match config.redis_url() {
        Some(url) => Arc::new(RedisCounterStore::connect(&url).await?),
        None => {
            tracing::warn!("REDIS_HOST not set, using in-process rate counters");
            Arc::new(InMemoryCounterStore::new())
        }
    };
    let mailboxes = Arc::new(GmailProvider::new(pool.clone(), Arc::new(config.clone())));

    let state = Arc::new(AppState::new(pool, config, counters, mailboxes));
    let dispatcher = Dispatcher::new(state, core_handlers(), Duration::from_secs(2));

    tokio::select! {
        _ = dispatcher.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

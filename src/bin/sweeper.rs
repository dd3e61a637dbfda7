use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use cadence::{
    config::AppConfig,
    db,
    gmail::GmailProvider,
    ratelimit::{CounterStore, InMemoryCounterStore, RedisCounterStore},
    state::AppState,
    sweeper::{Sweeper, CHECK_INTERVAL},
};

/// The sweeper runs as a single instance per deployment; the row-level
/// compare-and-set keeps an accidental second copy harmless.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "sweeper",
        database_url = %config.redacted_database_url(),
        interval_secs = CHECK_INTERVAL.as_secs(),
        "loaded cadence configuration"
    );
    let pool = db::build_pool(&config.database_url, 1)?;
    let counters: Arc<dyn CounterStore> = match config.redis_url() {
        Some(url) => Arc::new(RedisCounterStore::connect(&url).await?),
        None => {
            tracing::warn!("REDIS_HOST not set, using in-process rate counters");
            Arc::new(InMemoryCounterStore::new())
        }
    };
    let mailboxes = Arc::new(GmailProvider::new(pool.clone(), Arc::new(config.clone())));

    let state = Arc::new(AppState::new(pool, config, counters, mailboxes));
    let sweeper = Sweeper::new(state, CHECK_INTERVAL);

    tokio::select! {
        _ = sweeper.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("sweeper received shutdown signal");
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

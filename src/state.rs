use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    gmail::MailboxProvider,
    inbound::PushVerifier,
    ratelimit::{CounterStore, RateLimiter, RateLimits},
    schedule::ScheduleGenerator,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub limiter: Arc<RateLimiter>,
    pub scheduler: Arc<ScheduleGenerator>,
    pub mailboxes: Arc<dyn MailboxProvider>,
    pub push_verifier: PushVerifier,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        counters: Arc<dyn CounterStore>,
        mailboxes: Arc<dyn MailboxProvider>,
    ) -> Self {
        let config = Arc::new(config);
        let limiter = Arc::new(RateLimiter::new(
            counters,
            config.queue_prefix.clone(),
            RateLimits::default(),
        ));
        let scheduler = Arc::new(ScheduleGenerator::new(
            config.demo_mode,
            config.bypass_business_hours,
        ));
        let push_verifier = PushVerifier::new(
            &config.pubsub_verification_secret,
            config.pubsub_audience.clone(),
        );
        Self {
            pool,
            config,
            limiter,
            scheduler,
            mailboxes,
            push_verifier,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}

use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Sized for the HTTP server; dispatchers and the sweeper pass their
/// own smaller sizes from their binaries.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 4;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Pool over the sequence store. One warm connection is kept around so
/// a sweeper tick after a quiet stretch does not pay the connect cost.
pub fn build_pool(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size.max(1))
        .min_idle(Some(1))
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connection_timeout(CHECKOUT_TIMEOUT)
        .build(manager)?;
    Ok(pool)
}

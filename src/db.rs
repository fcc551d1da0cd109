use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};

/// Cloneable handle to the connection pool, threaded explicitly into every
/// component that needs storage (spec §9: "own it explicitly at process
/// init and thread it as a dependency", applied here to the DB pool rather
/// than a pub/sub client since the transport layer owns that instead).
pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn build_pool(config: &Config) -> anyhow::Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
    Pool::builder()
        .max_size(config.pool_size)
        .build(manager)
        .map_err(anyhow::Error::from)
}

pub fn get_conn(pool: &DbPool) -> ServiceResult<DbConn> {
    pool.get().map_err(ServiceError::from)
}

/// Applies every pending migration under `migrations/`. Run once at process
/// start, before the pool starts serving requests.
pub fn run_pending_migrations(config: &Config) -> anyhow::Result<()> {
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("failed to run pending migrations: {e}"))?;
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use diesel::Connection;

    /// Opens a direct (non-pooled) connection for tests, the way the
    /// reference codebase's test helpers bypass the request-scoped fairing
    /// pool. Tests that need a live database set `TEST_DATABASE_URL`; tests
    /// that don't touch storage never call this.
    pub fn test_connection() -> PgConnection {
        let url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must be set to run database-backed tests");
        PgConnection::establish(&url)
            .unwrap_or_else(|e| panic!("failed to connect to {url}: {e}"))
    }
}

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::sqlite::SqliteConnection;
use diesel::migration::MigrationSource;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub const DEFAULT_MAX_POOL_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; \
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub fn init_pool(database_url: &str) -> Result<SqlitePool> {
    init_pool_with_size(database_url, DEFAULT_MAX_POOL_SIZE)
}

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> Result<SqlitePool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size.max(1))
        .connection_timeout(Duration::from_secs(10))
        .connection_customizer(Box::new(ConnectionPragmas))
        .build(manager)?;
    Ok(pool)
}

/// Applies pending migrations forward. A store that already carries a
/// migration this binary does not know about is a downgrade and aborts.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    let known: HashSet<String> = MigrationSource::<diesel::sqlite::Sqlite>::migrations(&MIGRATIONS)
        .map_err(|err| anyhow!("failed to enumerate embedded migrations: {err}"))?
        .iter()
        .map(|migration| migration.name().version().to_string())
        .collect();

    let applied = conn
        .applied_migrations()
        .map_err(|err| anyhow!("failed to read applied migrations: {err}"))?;
    for version in &applied {
        if !known.contains(&version.to_string()) {
            bail!("store schema {version} is newer than this binary; refusing to downgrade");
        }
    }

    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
    Ok(())
}

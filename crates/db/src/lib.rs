//! PostgreSQL persistence for callers and quota usage.
//!
//! Repositories are stateless structs whose associated functions take a
//! `&PgPool`. [`PgUsageLedger`] and [`PgCallerDirectory`] adapt them to the
//! collaborator traits defined in `folio-core`.

use sqlx::postgres::PgPoolOptions;

pub mod directory;
pub mod ledger;
pub mod models;
pub mod repositories;

pub use directory::PgCallerDirectory;
pub use ledger::PgUsageLedger;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}

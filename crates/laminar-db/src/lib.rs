//! Persistence layer for the Laminar scheduling core.
//!
//! Provides the `BuildStore` trait and its PostgreSQL implementation.

pub mod error;
pub mod pg;
pub mod store;

pub use error::{DbError, DbResult};
pub use pg::PgBuildStore;
pub use store::{ArtifactRow, BuildRow, BuildStore, CompletedBuild, QueuedBuild};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the schema: builds, artifacts, and the six aggregate views.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

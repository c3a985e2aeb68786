use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a database connection pool.
///
/// The pool is kept at a fixed size (min == max) with ten-minute idle
/// and lifetime caps, so a crawl never competes with itself for
/// connections mid-window.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(max_connections)
        .max_connections(max_connections)
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(600))
        .connect(database_url)
        .await
}

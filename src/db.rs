use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

pub async fn connect_pg(
    database_url: &str,
    max_connections: u32,
    acquire_timeout_secs: u64,
) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Connected to Postgres");
    Ok(pool)
}

/// Apply `migrations/`. Already-applied versions are skipped.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Migrations applied");
    Ok(())
}

use crate::config::ServerConfig;
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

pub async fn run(cfg: &ServerConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect job db")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate job db")?;

    tracing::info!(event = "conveyor.migrate.complete", "migrations complete");
    Ok(())
}

use std::sync::Arc;

use anyhow::Result;
use rq_config::{DatabaseConfig, OutboxBackend};
use rq_outbox::{OutboxRepository, PostgresOutboxRepository, SqliteOutboxRepository};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool};
use tracing::info;

/// The relational store holding business tables and the outbox.
#[derive(Clone, Debug)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Database {
    pub async fn connect(backend: OutboxBackend, config: &DatabaseConfig) -> Result<Self> {
        let database = match backend {
            OutboxBackend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.url)
                    .await?;
                info!("Connected to PostgreSQL");
                Database::Postgres(pool)
            }
            OutboxBackend::Sqlite => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.url)
                    .await?;
                info!(url = %config.url, "Connected to SQLite");
                Database::Sqlite(pool)
            }
        };
        Ok(database)
    }

    /// Create the outbox and example tables if missing.
    pub async fn migrate(&self) -> Result<()> {
        match self {
            Database::Postgres(pool) => rq_outbox::postgres::init_schema(pool).await?,
            Database::Sqlite(pool) => rq_outbox::sqlite::init_schema(pool).await?,
        }
        crate::example::init_schema(self).await?;
        info!("Database schema ready");
        Ok(())
    }

    pub fn outbox_repository(&self) -> Arc<dyn OutboxRepository> {
        match self {
            Database::Postgres(pool) => Arc::new(PostgresOutboxRepository::new(pool.clone())),
            Database::Sqlite(pool) => Arc::new(SqliteOutboxRepository::new(pool.clone())),
        }
    }

    pub async fn close(&self) {
        match self {
            Database::Postgres(pool) => pool.close().await,
            Database::Sqlite(pool) => pool.close().await,
        }
    }
}

//! PostgreSQL quote repository.

use std::path::Path;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use super::{Quote, QuoteSource};
use crate::error::GateError;

pub struct PgQuotes {
    pool: PgPool,
}

impl PgQuotes {
    /// Connects, then applies pending migrations from `migration_path`.
    pub async fn connect(dsn: &str, migration_path: &str) -> Result<Self, GateError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(dsn)
            .await
            .map_err(GateError::internal)?;

        let migrator = sqlx::migrate::Migrator::new(Path::new(migration_path))
            .await
            .map_err(GateError::internal)?;
        migrator.run(&pool).await.map_err(GateError::internal)?;
        info!(path = migration_path, "database migrations applied");

        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuoteSource for PgQuotes {
    async fn random(&self) -> Result<Quote, GateError> {
        let (text, author): (String, String) = sqlx::query_as(
            "SELECT text, author FROM quotes ORDER BY RANDOM() LIMIT 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(GateError::internal)?;

        Ok(Quote { text, author })
    }
}

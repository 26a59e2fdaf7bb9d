pub mod metadata;
pub mod models;
pub mod queries;
pub mod schema;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::SentinelError;

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Database { pool })
    }

    /// A private in-memory store. A single connection that is never
    /// recycled, since every new SQLite memory connection is a fresh
    /// database.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(schema::INITIAL_SCHEMA)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// True once the bootstrap procedure has stored a chain secret.
    pub async fn is_initialized(&self) -> Result<bool, SentinelError> {
        let mut conn = self.pool.acquire().await?;
        Ok(metadata::get(&mut conn, metadata::SECRET).await?.is_some())
    }
}

//! Key/value chain state.
//!
//! Every function takes a bare connection so callers can run it inside
//! the transaction that also covers the log append.

use sqlx::{Row, SqliteConnection};

use crate::crypto::{ChainSecret, Challenge};
use crate::error::SentinelError;

pub const SECRET: &str = "secret";
pub const SERIAL: &str = "serial";
pub const CHALLENGE: &str = "challenge";
pub const LAST_ALERT: &str = "last_alert";
/// "1" from initialization until the first catch-up with the changelog.
pub const INITIAL_SYNC: &str = "initial_sync";

/// Serial stored before any entry has been signed.
pub const INITIAL_SERIAL: i64 = -1;

pub async fn get(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>, SentinelError> {
    let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

pub async fn set(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), SentinelError> {
    sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Overwrite an existing key, returning the number of rows touched.
pub async fn update(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<u64, SentinelError> {
    let result = sqlx::query("UPDATE metadata SET value = ? WHERE key = ?")
        .bind(value)
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn read_serial(conn: &mut SqliteConnection) -> Result<i64, SentinelError> {
    let raw = get(conn, SERIAL).await?.ok_or(SentinelError::NotInitialized)?;
    raw.parse()
        .map_err(|_| SentinelError::DatabaseError(format!("stored serial {:?} is not an integer", raw)))
}

pub async fn read_secret(conn: &mut SqliteConnection) -> Result<ChainSecret, SentinelError> {
    let raw = get(conn, SECRET).await?.ok_or(SentinelError::NotInitialized)?;
    ChainSecret::from_base64(&raw)
}

pub async fn read_initial_sync(conn: &mut SqliteConnection) -> Result<bool, SentinelError> {
    Ok(get(conn, INITIAL_SYNC).await?.as_deref() == Some("1"))
}

pub async fn read_challenge(conn: &mut SqliteConnection) -> Result<Challenge, SentinelError> {
    let raw = get(conn, CHALLENGE).await?.ok_or(SentinelError::NotInitialized)?;
    Challenge::from_base64(&raw)
}

/// Seed a fresh chain. Callers run this inside a transaction.
pub async fn store_initial(
    conn: &mut SqliteConnection,
    challenge: &Challenge,
    secret: &ChainSecret,
) -> Result<(), SentinelError> {
    set(conn, CHALLENGE, &challenge.to_base64()).await?;
    set(conn, SECRET, &secret.to_base64()).await?;
    set(conn, SERIAL, &INITIAL_SERIAL.to_string()).await?;
    set(conn, INITIAL_SYNC, "1").await?;
    Ok(())
}

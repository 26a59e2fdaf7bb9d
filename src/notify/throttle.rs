use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::database::metadata;
use crate::error::SentinelError;

/// At most one operator alert per window, tracked in the metadata store so
/// the limit survives restarts.
pub struct AlertThrottle {
    pool: SqlitePool,
    window: Duration,
}

impl AlertThrottle {
    pub fn new(pool: SqlitePool, window_secs: u64) -> Self {
        Self {
            pool,
            window: Duration::seconds(window_secs as i64),
        }
    }

    /// Claim the alert slot at `now`. Returns false while the previous
    /// alert is still inside the window.
    pub async fn try_acquire(&self, now: DateTime<Utc>) -> Result<bool, SentinelError> {
        let mut conn = self.pool.acquire().await?;
        let last = metadata::get(&mut conn, metadata::LAST_ALERT)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc));

        if let Some(last) = last {
            if now - last < self.window {
                debug!("Alert throttled; last sent at {}", last);
                return Ok(false);
            }
        }

        metadata::set(&mut conn, metadata::LAST_ALERT, &now.to_rfc3339()).await?;
        Ok(true)
    }
}

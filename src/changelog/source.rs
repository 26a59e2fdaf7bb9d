//! Changelog Source
//!
//! The directory changelog is consumed through a single query: all records
//! with `changenumber >= min`, ascending, at most `limit` of them. Records
//! arrive as raw attribute lists; shape checks happen in validation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ChangelogConfig;
use crate::error::SentinelError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAttribute {
    #[serde(rename = "type")]
    pub name: String,
    pub vals: Vec<String>,
}

/// One changelog record exactly as the directory returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChangeRecord {
    pub dn: String,
    pub attributes: Vec<RawAttribute>,
}

impl RawChangeRecord {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.push(RawAttribute {
            name: name.to_string(),
            vals: vec![value.into()],
        });
        self
    }

    /// The sequence number, if the record carries exactly one parseable one.
    pub fn changenumber(&self) -> Option<i64> {
        let mut found = self
            .attributes
            .iter()
            .filter(|a| a.name.eq_ignore_ascii_case("changenumber"));
        let attr = found.next()?;
        if found.next().is_some() {
            return None;
        }
        match attr.vals.as_slice() {
            [only] => only.trim().parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ChangelogSource: Send + Sync {
    async fn query(&self, min_serial: i64, limit: usize) -> Result<Vec<RawChangeRecord>, SentinelError>;
}

/// Changelog exposed over HTTP as `GET {url}/changelog?min=N&limit=M`
/// returning a JSON array of records.
pub struct HttpChangelogSource {
    base_url: String,
    http_client: Client,
}

impl HttpChangelogSource {
    pub fn new(config: &ChangelogConfig) -> Result<Self, SentinelError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SentinelError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl ChangelogSource for HttpChangelogSource {
    async fn query(&self, min_serial: i64, limit: usize) -> Result<Vec<RawChangeRecord>, SentinelError> {
        let url = format!("{}/changelog", self.base_url);
        debug!("Querying {} from serial {} (limit {})", url, min_serial, limit);

        let records = self
            .http_client
            .get(&url)
            .query(&[("min", min_serial.to_string()), ("limit", limit.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<RawChangeRecord>>()
            .await?;

        Ok(records)
    }
}

/// Changelog held in memory. Used for embedding and replay.
#[derive(Clone, Default)]
pub struct MemoryChangelogSource {
    records: Arc<Mutex<Vec<RawChangeRecord>>>,
}

impl MemoryChangelogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: RawChangeRecord) {
        self.records.lock().await.push(record);
    }

    /// Drop every record older than `serial`, as a compacting producer would.
    pub async fn compact_before(&self, serial: i64) {
        self.records
            .lock()
            .await
            .retain(|r| r.changenumber().map_or(true, |n| n >= serial));
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl ChangelogSource for MemoryChangelogSource {
    async fn query(&self, min_serial: i64, limit: usize) -> Result<Vec<RawChangeRecord>, SentinelError> {
        let mut matching: Vec<RawChangeRecord> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.changenumber().map_or(true, |n| n >= min_serial))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.changenumber().unwrap_or(i64::MIN));
        matching.truncate(limit);
        Ok(matching)
    }
}

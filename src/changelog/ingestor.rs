//! Changelog Ingestor
//!
//! Polls the directory changelog and feeds new records, one at a time and
//! in increasing serial order, through validation, the chain signer and
//! the projection. At most one check and one update pass run at a time;
//! a tick that finds a pass in flight does nothing.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::audit::signer::ChainSigner;
use crate::changelog::source::{ChangelogSource, RawChangeRecord};
use crate::changelog::validation::validate;
use crate::config::ChangelogConfig;
use crate::database::metadata::INITIAL_SERIAL;
use crate::error::SentinelError;
use crate::notify::AlertThrottle;
use crate::projection::DomainProjection;

/// Serials logged while catching up on history.
const INITIAL_SYNC_LOG_EVERY: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another check was in flight.
    Skipped,
    UpToDate { serial: i64 },
    Behind { serial: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub skipped: bool,
    pub fetched: usize,
    pub committed: usize,
    pub duplicates: usize,
    pub projection_failures: usize,
    pub last_serial: Option<i64>,
}

/// Clears its flag when dropped.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ChangelogIngestor {
    source: Arc<dyn ChangelogSource>,
    signer: Arc<ChainSigner>,
    projection: Arc<DomainProjection>,
    throttle: AlertThrottle,
    poll_interval: Duration,
    check_window: usize,
    batch_limit: usize,
    in_check: AtomicBool,
    update_pending: AtomicBool,
}

impl ChangelogIngestor {
    pub fn new(
        source: Arc<dyn ChangelogSource>,
        signer: Arc<ChainSigner>,
        projection: Arc<DomainProjection>,
        throttle: AlertThrottle,
        config: &ChangelogConfig,
    ) -> Self {
        Self {
            source,
            signer,
            projection,
            throttle,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            check_window: config.check_window,
            batch_limit: config.batch_limit,
            in_check: AtomicBool::new(false),
            update_pending: AtomicBool::new(false),
        }
    }

    pub fn signer(&self) -> &Arc<ChainSigner> {
        &self.signer
    }

    /// Is the committed serial still in the feed, and is there anything
    /// after it?
    pub async fn check(&self) -> Result<CheckOutcome, SentinelError> {
        let _guard = match PassGuard::acquire(&self.in_check) {
            Some(guard) => guard,
            None => return Ok(CheckOutcome::Skipped),
        };

        let serial = self.signer.current_serial().await?;
        let records = self.source.query(serial, self.check_window).await?;

        let mut got_base = false;
        let mut has_new = false;
        for record in &records {
            match record.changenumber() {
                Some(n) if n > serial => has_new = true,
                Some(n) if n == serial => got_base = true,
                Some(_) => {}
                None => {
                    return Err(SentinelError::malformed(format!(
                        "{}: no usable changenumber",
                        record.dn
                    )))
                }
            }
        }

        // Before the first entry there is no base to find; an empty feed
        // is simply idle.
        if !got_base && serial != INITIAL_SERIAL {
            return Err(SentinelError::LogContinuity { serial });
        }

        if has_new {
            debug!(serial, "Changelog has entries past the committed serial");
            return Ok(CheckOutcome::Behind { serial });
        }

        if self.projection.dispatcher().finish_initial_sync() {
            info!(serial, "Initial sync-up complete, notifications enabled");
        }
        if self.signer.initial_sync_pending().await? {
            self.signer.finish_initial_sync().await?;
        }
        Ok(CheckOutcome::UpToDate { serial })
    }

    /// Fetch and ingest one batch starting at `from`.
    pub async fn update(&self, from: i64) -> Result<UpdateSummary, SentinelError> {
        let _guard = match PassGuard::acquire(&self.update_pending) {
            Some(guard) => guard,
            None => {
                return Ok(UpdateSummary {
                    skipped: true,
                    ..UpdateSummary::default()
                })
            }
        };

        info!("Updating serial from {}", from);
        let records = self.source.query(from, self.batch_limit).await?;
        self.ingest_batch(records).await
    }

    /// Sign and project `records` in serial order. Stops at the first
    /// record that fails validation or signing; everything before it stays
    /// committed.
    pub async fn ingest_batch(&self, records: Vec<RawChangeRecord>) -> Result<UpdateSummary, SentinelError> {
        let mut summary = UpdateSummary {
            fetched: records.len(),
            ..UpdateSummary::default()
        };

        let mut ordered = BTreeMap::new();
        for record in records {
            let serial = record.changenumber().ok_or_else(|| {
                SentinelError::malformed(format!("{}: no usable changenumber", record.dn))
            })?;
            if ordered.insert(serial, record).is_some() {
                summary.duplicates += 1;
            }
        }

        let mut committed = self.signer.current_serial().await?;
        let quiet = self.projection.dispatcher().in_initial_sync();

        for (serial, record) in ordered {
            if serial <= committed {
                summary.duplicates += 1;
                continue;
            }

            let entry = match validate(&record) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(serial, "Rejecting changelog record after {} committed: {}", summary.committed, e);
                    return Err(e);
                }
            };

            match self.signer.sign_and_append(&entry).await {
                Ok(_) => {}
                Err(SentinelError::StaleEntry { .. }) => {
                    summary.duplicates += 1;
                    continue;
                }
                Err(e) => {
                    error!(serial, "Failed to sign changelog entry after {} committed: {}", summary.committed, e);
                    return Err(e);
                }
            }
            committed = serial;
            summary.committed += 1;
            summary.last_serial = Some(serial);

            // The entry is in the log; a projection failure cannot undo it.
            if let Err(e) = self.projection.apply(&entry).await {
                error!(serial, "Failed to update projection for {}: {}", entry.summary(), e);
                summary.projection_failures += 1;
            }

            if !quiet || serial % INITIAL_SYNC_LOG_EVERY == 0 {
                debug!(serial, "Processed changelog entry");
            }
        }

        Ok(summary)
    }

    /// One poll tick. Returns the spawned update, if any.
    pub async fn poll(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        match self.check().await {
            Ok(CheckOutcome::Behind { serial }) => {
                if self.update_pending.load(Ordering::SeqCst) {
                    return None;
                }
                let this = Arc::clone(self);
                Some(tokio::spawn(async move {
                    match this.update(serial).await {
                        Ok(summary) if summary.committed > 0 => info!(
                            "Committed {} entries up to serial {:?}",
                            summary.committed, summary.last_serial
                        ),
                        Ok(_) => {}
                        Err(e) => this.report_failure("update", e).await,
                    }
                }))
            }
            Ok(_) => None,
            Err(e) => {
                self.report_failure("check", e).await;
                None
            }
        }
    }

    /// Poll on the configured interval until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Polling changelog every {:?}", self.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down changelog ingestor");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
    }

    async fn report_failure(&self, pass: &str, err: SentinelError) {
        let subject = if err.needs_operator() {
            error!("Changelog {} failed, operator action required: {}", pass, err);
            "Audit chain halted"
        } else if err.is_batch_fatal() {
            error!("Changelog {} failed, retrying at next poll: {}", pass, err);
            "Changelog ingestion failed"
        } else {
            warn!("Changelog {} failed: {}", pass, err);
            return;
        };

        match self.throttle.try_acquire(Utc::now()).await {
            Ok(true) => {
                self.projection
                    .dispatcher()
                    .alert(subject, &format!("Changelog {} failed: {}", pass, err))
                    .await
            }
            Ok(false) => {}
            Err(e) => error!("Failed to read alert throttle: {}", e),
        }
    }
}

//! Chain Signer
//!
//! Tags each entry with the current chain secret, appends it to the log
//! and rotates the secret. Tag, rotation, append and the serial update
//! form one unit: a single SQLite transaction that is rolled back if the
//! append fails, so the stored secret always matches the number of tagged
//! lines in the file.

use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::entry::{ChangeEntry, TaggedLine};
use crate::audit::log_file::AuditLogFile;
use crate::database::metadata;
use crate::error::SentinelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEntry {
    pub serial: i64,
    pub tag: String,
}

pub struct ChainSigner {
    pool: SqlitePool,
    log: AuditLogFile,
    // Serialises sign/recover so two callers never tag with the same secret.
    lock: Mutex<()>,
    // Set when a line reached the log but its serial was never committed.
    unsettled: AtomicBool,
}

impl ChainSigner {
    pub fn new(pool: SqlitePool, log: AuditLogFile) -> Self {
        Self {
            pool,
            log,
            lock: Mutex::new(()),
            unsettled: AtomicBool::new(false),
        }
    }

    pub fn log(&self) -> &AuditLogFile {
        &self.log
    }

    pub async fn current_serial(&self) -> Result<i64, SentinelError> {
        let mut conn = self.pool.acquire().await?;
        metadata::read_serial(&mut conn).await
    }

    /// Set at initialization and cleared once the chain has caught up with
    /// the changelog for the first time.
    pub async fn initial_sync_pending(&self) -> Result<bool, SentinelError> {
        let mut conn = self.pool.acquire().await?;
        metadata::read_initial_sync(&mut conn).await
    }

    pub async fn finish_initial_sync(&self) -> Result<(), SentinelError> {
        let mut conn = self.pool.acquire().await?;
        metadata::set(&mut conn, metadata::INITIAL_SYNC, "0").await
    }

    /// Sign `entry`, append it, and advance secret and serial.
    ///
    /// Returns `StaleEntry` without side effects if the entry is not newer
    /// than the committed serial. A line left behind by an earlier failed
    /// commit is adopted first: retrying that same entry returns the line
    /// already in the log instead of tagging it a second time.
    pub async fn sign_and_append(&self, entry: &ChangeEntry) -> Result<SignedEntry, SentinelError> {
        let _guard = self.lock.lock().await;
        if self.unsettled.load(Ordering::SeqCst) {
            let adopted = self.adopt_last_line().await?;
            self.unsettled.store(false, Ordering::SeqCst);
            if let Some((signed, canonical)) = adopted {
                if signed.serial == entry.changenumber && canonical == entry.canonical_bytes()? {
                    return Ok(signed);
                }
            }
        }

        let mut tx = self.pool.begin().await?;

        let secret = metadata::read_secret(&mut tx).await?;
        let current = metadata::read_serial(&mut tx).await?;
        if entry.changenumber <= current {
            return Err(SentinelError::StaleEntry {
                serial: entry.changenumber,
                current,
            });
        }

        let tag = secret.tag(&entry.canonical_bytes()?);
        let line = entry.signed_line(&tag)?;

        let rotated = metadata::update(&mut tx, metadata::SECRET, &secret.next().to_base64())
            .await
            .map_err(|e| SentinelError::SignCommit(format!("rotating secret: {}", e)))?;
        if rotated != 1 {
            return Err(SentinelError::SignCommit(format!(
                "expected to rotate one secret row, touched {}",
                rotated
            )));
        }

        if let Err(e) = self.log.append_line(&line) {
            tx.rollback().await?;
            return Err(SentinelError::SignCommit(format!(
                "appending serial {} to {:?}: {}",
                entry.changenumber,
                self.log.path(),
                e
            )));
        }

        // From here the line is on disk; a failure leaves it to be adopted.
        let committed = match metadata::update(&mut tx, metadata::SERIAL, &entry.changenumber.to_string()).await {
            Ok(_) => tx
                .commit()
                .await
                .map_err(|e| SentinelError::SignCommit(format!("commit: {}", e))),
            Err(e) => Err(SentinelError::SignCommit(format!("recording serial: {}", e))),
        };
        if let Err(e) = committed {
            self.unsettled.store(true, Ordering::SeqCst);
            return Err(e);
        }

        debug!(serial = entry.changenumber, "Signed {}", entry.summary());
        Ok(SignedEntry {
            serial: entry.changenumber,
            tag,
        })
    }

    /// Reconcile the store with a log that is one line ahead of it, as left
    /// by a crash between append and commit. Returns the adopted serial.
    pub async fn recover(&self) -> Result<Option<i64>, SentinelError> {
        let _guard = self.lock.lock().await;
        let adopted = self.adopt_last_line().await?;
        self.unsettled.store(false, Ordering::SeqCst);
        Ok(adopted.map(|(signed, _)| signed.serial))
    }

    /// Adopt the last log line if it is ahead of the store and verifies
    /// under the stored secret. Callers hold `lock`.
    async fn adopt_last_line(&self) -> Result<Option<(SignedEntry, Vec<u8>)>, SentinelError> {
        let (lineno, text) = match self.log.last_entry()? {
            Some(last) => last,
            None => return Ok(None),
        };
        let last = TaggedLine::parse(&text, lineno)?;
        let changenumber = last.changenumber.ok_or_else(|| SentinelError::MalformedLogLine {
            line: lineno,
            reason: "missing changenumber".to_string(),
        })?;

        let mut tx = self.pool.begin().await?;
        let current = metadata::read_serial(&mut tx).await?;
        if changenumber <= current {
            return Ok(None);
        }

        warn!(
            "Log line {} holds serial {} but the store is at {}; recovering",
            lineno, changenumber, current
        );
        let secret = metadata::read_secret(&mut tx).await?;
        let computed = secret.tag(&last.canonical);
        if computed != last.tag {
            return Err(SentinelError::SignCommit(format!(
                "line {} (serial {}) does not verify under the stored secret; the log and the store have diverged",
                lineno, changenumber
            )));
        }

        metadata::update(&mut tx, metadata::SECRET, &secret.next().to_base64()).await?;
        metadata::update(&mut tx, metadata::SERIAL, &changenumber.to_string()).await?;
        tx.commit().await?;

        info!(serial = changenumber, "Recovered uncommitted log line {}", lineno);
        Ok(Some((
            SignedEntry {
                serial: changenumber,
                tag: last.tag,
            },
            last.canonical,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::ChangeType;
    use crate::crypto::{Challenge, RootSecret};
    use crate::database::Database;
    use serde_json::json;

    fn entry(n: i64) -> ChangeEntry {
        ChangeEntry {
            changenumber: n,
            changetime: "2016-03-01T10:00:00.000Z".to_string(),
            changetype: ChangeType::Add,
            targetdn: format!("uuid=u{}, ou=users, o=smartdc", n),
            changes: json!({"objectclass": ["sdcperson"]}),
            entry: None,
        }
    }

    async fn setup(dir: &tempfile::TempDir) -> (Database, ChainSigner, RootSecret, Challenge) {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let root = RootSecret::generate();
        let challenge = Challenge::generate();

        let log = AuditLogFile::new(dir.path().join("audit.jsonl"));
        log.create(&challenge).unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        metadata::store_initial(&mut conn, &challenge, &root.derive_initial(&challenge))
            .await
            .unwrap();
        drop(conn);

        let signer = ChainSigner::new(db.pool().clone(), log);
        (db, signer, root, challenge)
    }

    #[tokio::test]
    async fn test_sign_rotates_secret_and_serial() {
        let dir = tempfile::tempdir().unwrap();
        let (db, signer, root, challenge) = setup(&dir).await;
        let secret_0 = root.derive_initial(&challenge);

        let signed = signer.sign_and_append(&entry(1)).await.unwrap();
        assert_eq!(signed.tag, secret_0.tag(&entry(1).canonical_bytes().unwrap()));
        assert_eq!(signer.current_serial().await.unwrap(), 1);

        let mut conn = db.pool().acquire().await.unwrap();
        let stored = metadata::read_secret(&mut conn).await.unwrap();
        assert_eq!(stored, secret_0.next());
    }

    #[tokio::test]
    async fn test_stale_entry_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, signer, _root, _challenge) = setup(&dir).await;

        signer.sign_and_append(&entry(5)).await.unwrap();
        let before = std::fs::read_to_string(signer.log().path()).unwrap();

        let err = signer.sign_and_append(&entry(5)).await.unwrap_err();
        assert!(matches!(err, SentinelError::StaleEntry { serial: 5, current: 5 }));
        assert!(signer.sign_and_append(&entry(3)).await.is_err());

        assert_eq!(std::fs::read_to_string(signer.log().path()).unwrap(), before);
        assert_eq!(signer.current_serial().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_recover_adopts_uncommitted_line() {
        let dir = tempfile::tempdir().unwrap();
        let (db, signer, root, challenge) = setup(&dir).await;

        // Simulate a crash after the append: the line is on disk but the
        // store still holds secret_0 and serial -1.
        let secret_0 = root.derive_initial(&challenge);
        let e = entry(7);
        let line = e.signed_line(&secret_0.tag(&e.canonical_bytes().unwrap())).unwrap();
        signer.log().append_line(&line).unwrap();

        assert_eq!(signer.recover().await.unwrap(), Some(7));
        assert_eq!(signer.current_serial().await.unwrap(), 7);
        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(metadata::read_secret(&mut conn).await.unwrap(), secret_0.next());
        drop(conn);

        assert_eq!(signer.recover().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recover_rejects_foreign_line() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, signer, _root, _challenge) = setup(&dir).await;

        signer.log().append_line(r#"{"changenumber":3,"tag":"Zm9yZ2Vk"}"#).unwrap();
        assert!(matches!(signer.recover().await, Err(SentinelError::SignCommit(_))));
        assert_eq!(signer.current_serial().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_failed_serial_commit_is_adopted_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (db, signer, _root, _challenge) = setup(&dir).await;
        signer.sign_and_append(&entry(1)).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER fail_serial BEFORE UPDATE ON metadata WHEN NEW.key = 'serial' \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let err = signer.sign_and_append(&entry(2)).await.unwrap_err();
        assert!(matches!(err, SentinelError::SignCommit(_)));
        assert_eq!(signer.current_serial().await.unwrap(), 1);

        sqlx::query("DROP TRIGGER fail_serial")
            .execute(db.pool())
            .await
            .unwrap();

        let retry = signer.sign_and_append(&entry(2)).await.unwrap();
        assert_eq!(retry.serial, 2);
        assert_eq!(signer.current_serial().await.unwrap(), 2);
        assert!(matches!(
            signer.sign_and_append(&entry(2)).await,
            Err(SentinelError::StaleEntry { serial: 2, current: 2 })
        ));
        signer.sign_and_append(&entry(3)).await.unwrap();

        let text = std::fs::read_to_string(signer.log().path()).unwrap();
        let tagged: Vec<_> = text.lines().skip(1).collect();
        assert_eq!(tagged.len(), 3);
        assert_eq!(signer.current_serial().await.unwrap(), 3);
    }
}

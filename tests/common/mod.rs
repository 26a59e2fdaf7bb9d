#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;

use changelog_sentinel::audit::{AuditLogFile, ChainSigner, ChangeEntry, ChangeType};
use changelog_sentinel::bootstrap::{bootstrap, BootstrapOptions};
use changelog_sentinel::changelog::dn::parse_base;
use changelog_sentinel::changelog::{
    ChangelogIngestor, ChangelogSource, MemoryChangelogSource, RawChangeRecord,
};
use changelog_sentinel::config::{ChangelogConfig, NotifyConfig};
use changelog_sentinel::crypto::{combine, parse_shares, ChainSecret, Challenge, RootSecret};
use changelog_sentinel::database::Database;
use changelog_sentinel::error::SentinelError;
use changelog_sentinel::notify::{AlertThrottle, Message, NotificationDispatcher, Notifier, Recipient};
use changelog_sentinel::projection::DomainProjection;

pub const CHANGETIME: &str = "2016-03-01T10:00:00.000Z";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    let db = Database::new_in_memory().await.expect("Failed to create test database");
    db.run_migrations().await.expect("Failed to run migrations");
    db
}

/// Collects every delivered message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<Message>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    pub fn to_operators(&self) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|m| m.to == Recipient::Operators)
            .collect()
    }

    pub fn to_users(&self) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|m| matches!(m.to, Recipient::Users(_)))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, message: &Message) -> Result<(), SentinelError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Holds every query until the test releases it.
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

struct GatedSource {
    inner: MemoryChangelogSource,
    gate: Gate,
}

#[async_trait]
impl ChangelogSource for GatedSource {
    async fn query(&self, min_serial: i64, limit: usize) -> Result<Vec<RawChangeRecord>, SentinelError> {
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        self.inner.query(min_serial, limit).await
    }
}

/// A bootstrapped chain with the whole ingestion pipeline wired to an
/// in-memory changelog.
pub struct Harness {
    pub dir: TempDir,
    pub db: Database,
    pub root: RootSecret,
    pub challenge: Challenge,
    pub signer: Arc<ChainSigner>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub notifier: Arc<RecordingNotifier>,
    pub source: MemoryChangelogSource,
    pub ingestor: Arc<ChangelogIngestor>,
}

impl Harness {
    pub async fn new(initial_sync: bool) -> Self {
        let source = MemoryChangelogSource::new();
        Self::build(initial_sync, source.clone(), Arc::new(source)).await
    }

    /// A harness whose changelog queries wait on the returned gate.
    pub async fn gated() -> (Self, Gate) {
        let gate = Gate::default();
        let source = MemoryChangelogSource::new();
        let gated = GatedSource {
            inner: source.clone(),
            gate: gate.clone(),
        };
        (Self::build(false, source, Arc::new(gated)).await, gate)
    }

    async fn build(
        initial_sync: bool,
        source: MemoryChangelogSource,
        feed: Arc<dyn ChangelogSource>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = setup_test_db().await;
        let log = AuditLogFile::new(dir.path().join("audit.jsonl"));

        let outcome = bootstrap(&db, &log, &BootstrapOptions::default(), None, None)
            .await
            .expect("bootstrap failed");
        let shares: Vec<String> = outcome.shares.iter().map(|s| s.text.clone()).collect();
        let root = RootSecret::from_bytes(&combine(&parse_shares(&shares.join(",")).unwrap()).unwrap()).unwrap();

        let signer = Arc::new(ChainSigner::new(db.pool().clone(), log));
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            notifier.clone(),
            NotifyConfig::default(),
            initial_sync,
        ));
        let projection = Arc::new(DomainProjection::new(
            db.pool().clone(),
            parse_base("o=smartdc").unwrap(),
            Arc::clone(&dispatcher),
        ));
        let throttle = AlertThrottle::new(db.pool().clone(), 3600);

        let ingestor = Arc::new(ChangelogIngestor::new(
            feed,
            Arc::clone(&signer),
            projection,
            throttle,
            &ChangelogConfig::default(),
        ));

        Self {
            dir,
            db,
            root,
            challenge: outcome.challenge,
            signer,
            dispatcher,
            notifier,
            source,
            ingestor,
        }
    }

    pub fn secret_0(&self) -> ChainSecret {
        self.root.derive_initial(&self.challenge)
    }

    pub fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.signer.log().path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Serials of the tagged lines, in file order.
    pub fn logged_serials(&self) -> Vec<i64> {
        self.log_lines()
            .iter()
            .skip(1)
            .map(|line| {
                let value: Value = serde_json::from_str(line).unwrap();
                value["changenumber"].as_i64().unwrap()
            })
            .collect()
    }
}

pub fn change_record(
    n: i64,
    targetdn: &str,
    changetype: &str,
    changes: Value,
    entry: Option<Value>,
) -> RawChangeRecord {
    let record = RawChangeRecord::new(format!("changenumber={}, cn=changelog", n))
        .with("targetdn", targetdn)
        .with("changetype", changetype)
        .with("objectclass", "changeLogEntry")
        .with("changetime", CHANGETIME)
        .with("changenumber", n.to_string())
        .with("changes", changes.to_string());
    match entry {
        Some(entry) => record.with("entry", entry.to_string()),
        None => record,
    }
}

pub fn user_dn(uuid: &str) -> String {
    format!("uuid={}, ou=users, o=smartdc", uuid)
}

pub fn user_add(n: i64, uuid: &str, login: &str, email: &str) -> RawChangeRecord {
    change_record(
        n,
        &user_dn(uuid),
        "add",
        json!({
            "objectclass": ["sdcperson"],
            "uuid": [uuid],
            "login": [login],
            "email": [email],
            "userpassword": ["initial"]
        }),
        None,
    )
}

pub fn user_modify(n: i64, uuid: &str, operation: &str, attr: &str, value: &str) -> RawChangeRecord {
    change_record(
        n,
        &user_dn(uuid),
        "modify",
        json!([{"operation": operation, "modification": {"type": attr, "vals": [value]}}]),
        Some(json!({"objectclass": ["sdcperson"], "uuid": [uuid]})),
    )
}

pub fn user_delete(n: i64, uuid: &str) -> RawChangeRecord {
    change_record(
        n,
        &user_dn(uuid),
        "delete",
        json!({"objectclass": ["sdcperson"], "uuid": [uuid]}),
        None,
    )
}

pub fn key_add(n: i64, uuid: &str, fingerprint: &str, name: &str) -> RawChangeRecord {
    change_record(
        n,
        &format!("fingerprint={}, uuid={}, ou=users, o=smartdc", fingerprint, uuid),
        "add",
        json!({
            "objectclass": ["sdckey"],
            "fingerprint": [fingerprint],
            "name": [name],
            "openssh": [format!("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 {}@laptop", name)]
        }),
        None,
    )
}

pub fn group_modify(n: i64, group: &str, operation: &str, member_uuid: &str) -> RawChangeRecord {
    change_record(
        n,
        &format!("cn={}, ou=groups, o=smartdc", group),
        "modify",
        json!([{
            "operation": operation,
            "modification": {"type": "uniquemember", "vals": [user_dn(member_uuid)]}
        }]),
        Some(json!({"objectclass": ["groupofuniquenames"]})),
    )
}

pub fn entry(n: i64) -> ChangeEntry {
    ChangeEntry {
        changenumber: n,
        changetime: CHANGETIME.to_string(),
        changetype: ChangeType::Add,
        targetdn: user_dn(&format!("u{}", n)),
        changes: json!({"objectclass": ["sdcperson"], "login": [format!("login-{}", n)]}),
        entry: None,
    }
}

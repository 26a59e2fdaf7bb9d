//! Domain Projection
//!
//! Current users, their SSH keys and privilege-group membership, rebuilt
//! from signed changelog entries. An entry is applied only after it is in
//! the log; the projection never feeds back into the chain.

pub mod keys;
pub mod operators;
pub mod users;

use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use crate::audit::entry::ChangeEntry;
use crate::changelog::dn::{DirectoryTarget, DistinguishedName, Rdn};
use crate::error::SentinelError;
use crate::notify::NotificationDispatcher;

pub struct DomainProjection {
    pool: SqlitePool,
    base: Rdn,
    dispatcher: Arc<NotificationDispatcher>,
}

impl DomainProjection {
    pub fn new(pool: SqlitePool, base: Rdn, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            pool,
            base,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Apply one entry in its own transaction, then send the notifications
    /// it produced.
    pub async fn apply(&self, entry: &ChangeEntry) -> Result<(), SentinelError> {
        let dn = DistinguishedName::parse(&entry.targetdn)?;
        let target = DirectoryTarget::classify(&dn, &self.base)?;

        let mut tx = self.pool.begin().await?;
        let notifications = match &target {
            DirectoryTarget::User { uuid } => users::apply(&mut tx, uuid, entry).await?,
            DirectoryTarget::SshKey { uuid, fingerprint } => {
                keys::apply(&mut tx, uuid, fingerprint, entry).await?
            }
            DirectoryTarget::PrivilegeGroup(privilege) => {
                operators::apply(&mut tx, *privilege, &self.base, entry).await?
            }
            DirectoryTarget::Other => Vec::new(),
        };
        tx.commit().await?;

        debug!(serial = entry.changenumber, "Projected {:?}", target);
        for notification in &notifications {
            self.dispatcher.notify(notification).await;
        }
        Ok(())
    }
}

/// All string values of `attr` in an attribute-set object.
pub(crate) fn values(changes: &Value, attr: &str) -> Vec<String> {
    let found = changes.as_object().and_then(|obj| {
        obj.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v)
    });
    match found {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub(crate) fn first_value(changes: &Value, attr: &str) -> Option<String> {
    values(changes, attr).into_iter().next()
}

/// One `{operation, modification: {type, vals}}` element of a modify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Modification {
    pub operation: String,
    pub attr: String,
    pub vals: Vec<String>,
}

pub(crate) fn modifications(entry: &ChangeEntry) -> Result<Vec<Modification>, SentinelError> {
    let items = entry.changes.as_array().ok_or_else(|| {
        SentinelError::projection(format!("serial {}: modify changes are not a list", entry.changenumber))
    })?;

    items
        .iter()
        .map(|item| {
            let operation = item
                .get("operation")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    SentinelError::projection(format!("serial {}: modification without operation", entry.changenumber))
                })?;
            let modification = item
                .get("modification")
                .filter(|m| m.is_object())
                .ok_or_else(|| {
                    SentinelError::projection(format!("serial {}: modification is not an object", entry.changenumber))
                })?;
            let attr = modification
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(Modification {
                operation: operation.to_ascii_lowercase(),
                attr: attr.to_ascii_lowercase(),
                vals: values(modification, "vals"),
            })
        })
        .collect()
}

use sqlx::SqliteConnection;
use tracing::warn;

use crate::audit::entry::{ChangeEntry, ChangeType};
use crate::database::models::KeyRow;
use crate::database::queries::Queries;
use crate::error::SentinelError;
use crate::notify::Notification;
use crate::projection::first_value;

pub async fn apply(
    conn: &mut SqliteConnection,
    uuid: &str,
    fingerprint: &str,
    entry: &ChangeEntry,
) -> Result<Vec<Notification>, SentinelError> {
    if entry.changetype == ChangeType::Modify {
        return Err(SentinelError::projection(format!(
            "serial {}: SSH key {} of {} cannot be modified",
            entry.changenumber, fingerprint, uuid
        )));
    }

    let key = KeyRow {
        uuid: uuid.to_string(),
        fingerprint: fingerprint.to_string(),
        name: first_value(&entry.changes, "name"),
        comment: first_value(&entry.changes, "openssh").and_then(|k| openssh_comment(&k)),
    };
    let other_keys: Vec<KeyRow> = Queries::keys_for_user(conn, uuid)
        .await?
        .into_iter()
        .filter(|k| k.fingerprint != fingerprint)
        .collect();
    let user = Queries::get_user(conn, uuid).await?;

    let when = entry.changetime.clone();
    let notification = match entry.changetype {
        ChangeType::Add => {
            Queries::insert_key(conn, &key).await?;
            user.map(|user| Notification::KeyAdded {
                when,
                user,
                key,
                other_keys,
            })
        }
        _ => {
            Queries::delete_key(conn, uuid, fingerprint).await?;
            user.map(|user| Notification::KeyDeleted {
                when,
                user,
                key,
                other_keys,
            })
        }
    };

    if notification.is_none() {
        warn!("SSH key {} changed for user {} who is not in the database", fingerprint, uuid);
    }
    Ok(notification.into_iter().collect())
}

/// Comment field of an OpenSSH public key line (`type base64 comment`).
pub fn openssh_comment(key: &str) -> Option<String> {
    let mut fields = key.split_whitespace();
    fields.next()?;
    fields.next()?;
    let comment: Vec<&str> = fields.collect();
    if comment.is_empty() {
        None
    } else {
        Some(comment.join(" "))
    }
}

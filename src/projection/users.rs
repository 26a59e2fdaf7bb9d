use sqlx::SqliteConnection;

use crate::audit::entry::{ChangeEntry, ChangeType};
use crate::database::models::UserRow;
use crate::database::queries::{Queries, UserField};
use crate::error::SentinelError;
use crate::notify::Notification;
use crate::projection::{first_value, modifications, values};

const PERSON_OBJECTCLASS: &str = "sdcperson";

pub async fn apply(
    conn: &mut SqliteConnection,
    uuid: &str,
    entry: &ChangeEntry,
) -> Result<Vec<Notification>, SentinelError> {
    let existing = Queries::get_user(conn, uuid).await?;

    match (entry.changetype, existing) {
        (ChangeType::Add, existing) => add(conn, uuid, entry, existing).await,
        (ChangeType::Modify, Some(row)) => modify(conn, row, entry).await,
        (ChangeType::Delete, Some(row)) => {
            Queries::delete_user(conn, uuid).await?;
            Ok(vec![Notification::UserDeleted {
                when: entry.changetime.clone(),
                user: row,
            }])
        }
        (changetype, None) => Err(SentinelError::projection(format!(
            "got {} change for user {} which does not exist",
            changetype.as_str(),
            uuid
        ))),
    }
}

async fn add(
    conn: &mut SqliteConnection,
    uuid: &str,
    entry: &ChangeEntry,
    existing: Option<UserRow>,
) -> Result<Vec<Notification>, SentinelError> {
    let classes = values(&entry.changes, "objectclass");
    if !classes.iter().any(|c| c.eq_ignore_ascii_case(PERSON_OBJECTCLASS)) {
        return Err(SentinelError::projection(format!(
            "entry for user {} is missing objectclass {}",
            uuid, PERSON_OBJECTCLASS
        )));
    }
    let login = first_value(&entry.changes, "login")
        .ok_or_else(|| SentinelError::projection(format!("user {} added without a login", uuid)))?;

    // Replaying an add must not drop privileges granted since.
    let (operator, reader) = existing.map_or((false, false), |row| (row.operator, row.reader));
    let row = UserRow {
        uuid: uuid.to_string(),
        login,
        userpassword: first_value(&entry.changes, "userpassword"),
        email: first_value(&entry.changes, "email"),
        operator,
        reader,
    };
    Queries::insert_user(conn, &row).await?;
    Ok(Vec::new())
}

async fn modify(
    conn: &mut SqliteConnection,
    mut row: UserRow,
    entry: &ChangeEntry,
) -> Result<Vec<Notification>, SentinelError> {
    let mut notifications = Vec::new();

    for m in modifications(entry)? {
        if m.operation != "add" && m.operation != "replace" {
            continue;
        }
        let field = match UserField::from_attribute(&m.attr) {
            Some(field) => field,
            None => continue,
        };
        let value = match m.vals.as_slice() {
            [only] => only.clone(),
            vals => {
                return Err(SentinelError::projection(format!(
                    "serial {}: {} of {} carries {} values",
                    entry.changenumber,
                    m.operation,
                    m.attr,
                    vals.len()
                )))
            }
        };

        let when = entry.changetime.clone();
        match field {
            UserField::Login => {
                if row.login == value {
                    continue;
                }
                notifications.push(Notification::LoginChanged {
                    when,
                    user: row.clone(),
                    new_login: value.clone(),
                });
                row.login = value.clone();
            }
            UserField::UserPassword => {
                if row.userpassword.as_deref() == Some(value.as_str()) {
                    continue;
                }
                notifications.push(Notification::PasswordChanged {
                    when,
                    user: row.clone(),
                });
                row.userpassword = Some(value.clone());
            }
            UserField::Email => {
                if row.email.as_deref() == Some(value.as_str()) {
                    continue;
                }
                notifications.push(Notification::EmailChanged {
                    when,
                    user: row.clone(),
                    new_email: value.clone(),
                });
                row.email = Some(value.clone());
            }
        }
        Queries::update_user_field(conn, &row.uuid, field, Some(&value)).await?;
    }

    Ok(notifications)
}

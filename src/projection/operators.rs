use sqlx::SqliteConnection;

use crate::audit::entry::{ChangeEntry, ChangeType};
use crate::changelog::dn::{DirectoryTarget, Privilege, Rdn};
use crate::database::queries::Queries;
use crate::error::SentinelError;
use crate::notify::Notification;
use crate::projection::{modifications, values};

const MEMBER_ATTR: &str = "uniquemember";

/// Membership changes on the operators or readers group.
pub async fn apply(
    conn: &mut SqliteConnection,
    privilege: Privilege,
    base: &Rdn,
    entry: &ChangeEntry,
) -> Result<Vec<Notification>, SentinelError> {
    // (granted, member dn)
    let changes: Vec<(bool, String)> = match entry.changetype {
        ChangeType::Add => values(&entry.changes, MEMBER_ATTR)
            .into_iter()
            .map(|dn| (true, dn))
            .collect(),
        ChangeType::Modify => modifications(entry)?
            .into_iter()
            .filter(|m| m.attr == MEMBER_ATTR)
            .filter_map(|m| match m.operation.as_str() {
                "add" => Some((true, m.vals)),
                "delete" => Some((false, m.vals)),
                _ => None,
            })
            .flat_map(|(granted, vals)| vals.into_iter().map(move |dn| (granted, dn)))
            .collect(),
        ChangeType::Delete => return Ok(Vec::new()),
    };

    let mut notifications = Vec::new();
    for (granted, member) in changes {
        let uuid = DirectoryTarget::member_uuid(&member, base)?;
        let user = Queries::get_user(conn, &uuid).await?.ok_or_else(|| {
            SentinelError::projection(format!(
                "tried to {} unknown user {} {} {}",
                if granted { "add" } else { "remove" },
                uuid,
                if granted { "to" } else { "from" },
                privilege.group_name()
            ))
        })?;

        let current = match privilege {
            Privilege::Operator => user.operator,
            Privilege::Reader => user.reader,
        };
        if current == granted {
            continue;
        }

        Queries::set_privilege(conn, &uuid, privilege, granted).await?;
        let when = entry.changetime.clone();
        notifications.push(if granted {
            Notification::PrivilegeGranted { when, user, privilege }
        } else {
            Notification::PrivilegeRevoked { when, user, privilege }
        });
    }
    Ok(notifications)
}

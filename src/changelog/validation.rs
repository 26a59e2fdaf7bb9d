//! Shape checks turning a raw changelog record into a [`ChangeEntry`].
//!
//! A record that fails here halts ingestion at that serial: it is never
//! signed, never skipped.

use serde_json::Value;

use crate::audit::entry::{ChangeEntry, ChangeType};
use crate::changelog::source::RawChangeRecord;
use crate::error::SentinelError;

const REQUIRED: [&str; 6] = [
    "targetdn",
    "changetype",
    "objectclass",
    "changetime",
    "changenumber",
    "changes",
];
const OPTIONAL: [&str; 1] = ["entry"];
const CHANGELOG_OBJECTCLASS: &str = "changeLogEntry";

pub fn validate(record: &RawChangeRecord) -> Result<ChangeEntry, SentinelError> {
    let mut fields: [Option<&str>; 7] = [None; 7];

    for attr in &record.attributes {
        let slot = REQUIRED
            .iter()
            .chain(OPTIONAL.iter())
            .position(|name| attr.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                SentinelError::malformed(format!("{}: unexpected attribute {:?}", record.dn, attr.name))
            })?;
        if fields[slot].is_some() {
            return Err(SentinelError::malformed(format!(
                "{}: attribute {} appears more than once",
                record.dn, attr.name
            )));
        }
        let value = match attr.vals.as_slice() {
            [only] => only.as_str(),
            vals => {
                return Err(SentinelError::malformed(format!(
                    "{}: attribute {} has {} values, expected 1",
                    record.dn,
                    attr.name,
                    vals.len()
                )))
            }
        };
        fields[slot] = Some(value);
    }

    let required = |i: usize| {
        fields[i].ok_or_else(|| {
            SentinelError::malformed(format!("{}: missing attribute {}", record.dn, REQUIRED[i]))
        })
    };
    let targetdn = required(0)?;
    let changetype = required(1)?;
    let objectclass = required(2)?;
    let changetime = required(3)?;
    let changenumber = required(4)?;
    let changes = required(5)?;

    if objectclass != CHANGELOG_OBJECTCLASS {
        return Err(SentinelError::malformed(format!(
            "{}: objectclass {:?} is not {}",
            record.dn, objectclass, CHANGELOG_OBJECTCLASS
        )));
    }

    let changenumber: i64 = changenumber.trim().parse().map_err(|_| {
        SentinelError::malformed(format!("{}: changenumber {:?} is not an integer", record.dn, changenumber))
    })?;

    let changes: Value = serde_json::from_str(changes)
        .map_err(|e| SentinelError::malformed(format!("{}: changes is not JSON: {}", record.dn, e)))?;
    let entry: Option<Value> = fields[6]
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|e| SentinelError::malformed(format!("{}: entry is not JSON: {}", record.dn, e)))?;

    let changetype = match changetype {
        "add" => ChangeType::Add,
        "modify" => ChangeType::Modify,
        "delete" => ChangeType::Delete,
        other => {
            return Err(SentinelError::malformed(format!(
                "{}: unknown changetype {:?}",
                record.dn, other
            )))
        }
    };

    match (changetype, &entry) {
        (ChangeType::Add | ChangeType::Delete, Some(_)) => {
            return Err(SentinelError::malformed(format!(
                "{}: {} must not carry an entry",
                record.dn,
                changetype.as_str()
            )));
        }
        (ChangeType::Add | ChangeType::Delete, None) if !changes.is_object() => {
            return Err(SentinelError::malformed(format!(
                "{}: {} changes must be an object",
                record.dn,
                changetype.as_str()
            )));
        }
        (ChangeType::Modify, Some(pre)) => {
            if !pre.is_object() {
                return Err(SentinelError::malformed(format!(
                    "{}: modify entry must be an object",
                    record.dn
                )));
            }
            let all_objects = changes
                .as_array()
                .map_or(false, |mods| mods.iter().all(Value::is_object));
            if !all_objects {
                return Err(SentinelError::malformed(format!(
                    "{}: modify changes must be an array of objects",
                    record.dn
                )));
            }
        }
        (ChangeType::Modify, None) => {
            return Err(SentinelError::malformed(format!(
                "{}: modify requires an entry",
                record.dn
            )));
        }
        _ => {}
    }

    Ok(ChangeEntry {
        changenumber,
        changetime: changetime.to_string(),
        changetype,
        targetdn: targetdn.to_string(),
        changes,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::source::RawAttribute;

    fn add_record(n: i64) -> RawChangeRecord {
        RawChangeRecord::new(format!("changenumber={}, cn=changelog", n))
            .with("targetdn", "uuid=u1, ou=users, o=smartdc")
            .with("changetype", "add")
            .with("objectclass", "changeLogEntry")
            .with("changetime", "2016-03-01T10:00:00.000Z")
            .with("changenumber", n.to_string())
            .with("changes", r#"{"objectclass":["sdcperson"],"login":["alice"]}"#)
    }

    #[test]
    fn test_valid_add() {
        let entry = validate(&add_record(9)).unwrap();
        assert_eq!(entry.changenumber, 9);
        assert_eq!(entry.changetype, ChangeType::Add);
        assert!(entry.entry.is_none());
        assert_eq!(entry.changes["login"][0], "alice");
    }

    #[test]
    fn test_valid_modify() {
        let record = RawChangeRecord::new("changenumber=3, cn=changelog")
            .with("targetdn", "uuid=u1, ou=users, o=smartdc")
            .with("changetype", "modify")
            .with("objectclass", "changeLogEntry")
            .with("changetime", "2016-03-01T10:00:00.000Z")
            .with("changenumber", "3")
            .with("changes", r#"[{"operation":"replace","modification":{"type":"email","vals":["x@y"]}}]"#)
            .with("entry", r#"{"email":["a@b"]}"#);
        let entry = validate(&record).unwrap();
        assert_eq!(entry.changetype, ChangeType::Modify);
        assert!(entry.entry.is_some());
    }

    #[test]
    fn test_missing_and_duplicate_attributes() {
        let mut missing = add_record(1);
        missing.attributes.retain(|a| a.name != "changetime");
        assert!(matches!(validate(&missing), Err(SentinelError::MalformedEntry(_))));

        let dup = add_record(1).with("changetype", "add");
        assert!(validate(&dup).is_err());

        let mut multi = add_record(1);
        multi.attributes.push(RawAttribute {
            name: "entry".to_string(),
            vals: vec!["{}".to_string(), "{}".to_string()],
        });
        assert!(validate(&multi).is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut wrong_class = add_record(1);
        wrong_class.attributes[2].vals = vec!["person".to_string()];
        assert!(validate(&wrong_class).is_err());

        let mut bad_number = add_record(1);
        bad_number.attributes[4].vals = vec!["one".to_string()];
        assert!(validate(&bad_number).is_err());

        let mut bad_json = add_record(1);
        bad_json.attributes[5].vals = vec!["{not json".to_string()];
        assert!(validate(&bad_json).is_err());

        let mut rename = add_record(1);
        rename.attributes[1].vals = vec!["modrdn".to_string()];
        assert!(validate(&rename).is_err());
    }

    #[test]
    fn test_shape_per_changetype() {
        let add_with_entry = add_record(1).with("entry", "{}");
        assert!(validate(&add_with_entry).is_err());

        let mut delete_array = add_record(1);
        delete_array.attributes[1].vals = vec!["delete".to_string()];
        delete_array.attributes[5].vals = vec!["[]".to_string()];
        assert!(validate(&delete_array).is_err());

        let mut modify_no_entry = add_record(1);
        modify_no_entry.attributes[1].vals = vec!["modify".to_string()];
        modify_no_entry.attributes[5].vals = vec!["[{}]".to_string()];
        assert!(validate(&modify_no_entry).is_err());

        let modify_scalars = RawChangeRecord::new("changenumber=3, cn=changelog")
            .with("targetdn", "uuid=u1, ou=users, o=smartdc")
            .with("changetype", "modify")
            .with("objectclass", "changeLogEntry")
            .with("changetime", "2016-03-01T10:00:00.000Z")
            .with("changenumber", "3")
            .with("changes", "[1, 2]")
            .with("entry", "{}");
        assert!(validate(&modify_scalars).is_err());
    }
}

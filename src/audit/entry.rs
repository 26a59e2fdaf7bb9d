//! Audit Log Entry
//!
//! Defines the records of the signed changelog and the canonical byte
//! encoding their tags are computed over.
//!
//! The canonical encoding is a contract between the signer and every
//! verifier that will ever read the log: compact JSON, object keys in
//! byte-wise sorted order at every depth, the top-level `tag` key removed,
//! strings escaped by serde_json, numbers in serde_json's shortest form.
//! It is produced by [`canonical_bytes`] alone and does not depend on how
//! `serde_json::Map` orders its keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::Challenge;
use crate::error::SentinelError;

/// Name of the field holding an entry's authentication tag.
pub const TAG_FIELD: &str = "tag";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Add => "add",
            ChangeType::Modify => "modify",
            ChangeType::Delete => "delete",
        }
    }
}

/// One validated directory change, as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub changenumber: i64,
    pub changetime: String,
    pub changetype: ChangeType,
    pub targetdn: String,
    /// Full attribute set for add/delete, list of modifications for modify.
    pub changes: Value,
    /// Pre-image of the record, present only for modify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Value>,
}

impl ChangeEntry {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, SentinelError> {
        canonical_bytes(&serde_json::to_value(self)?)
    }

    /// The full log line (without newline) carrying `tag`.
    pub fn signed_line(&self, tag: &str) -> Result<String, SentinelError> {
        let mut value = serde_json::to_value(self)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| SentinelError::malformed("entry did not serialize to an object"))?;
        object.insert(TAG_FIELD.to_string(), Value::String(tag.to_string()));

        let bytes = canonical_json(&value)?;
        String::from_utf8(bytes).map_err(|e| SentinelError::malformed(format!("non UTF-8 entry: {}", e)))
    }

    pub fn summary(&self) -> String {
        format!(
            "#{} {} {}",
            self.changenumber,
            self.changetype.as_str(),
            self.targetdn
        )
    }
}

/// First line of every log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderLine {
    pub challenge: String,
}

impl HeaderLine {
    pub fn new(challenge: &Challenge) -> Self {
        Self {
            challenge: challenge.to_hex(),
        }
    }

    pub fn parse(line: &str) -> Result<Challenge, SentinelError> {
        let header: HeaderLine = serde_json::from_str(line).map_err(|e| SentinelError::MalformedLogLine {
            line: 1,
            reason: format!("expected challenge header: {}", e),
        })?;
        Challenge::from_hex(&header.challenge).map_err(|e| SentinelError::MalformedLogLine {
            line: 1,
            reason: e.to_string(),
        })
    }

    pub fn to_line(&self) -> Result<String, SentinelError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A tagged log line as read back from disk.
#[derive(Debug, Clone)]
pub struct TaggedLine {
    pub tag: String,
    pub changenumber: Option<i64>,
    pub canonical: Vec<u8>,
}

impl TaggedLine {
    pub fn parse(text: &str, line: usize) -> Result<Self, SentinelError> {
        let value: Value = serde_json::from_str(text).map_err(|e| SentinelError::MalformedLogLine {
            line,
            reason: e.to_string(),
        })?;
        let object = value.as_object().ok_or_else(|| SentinelError::MalformedLogLine {
            line,
            reason: "not a JSON object".to_string(),
        })?;
        let tag = object
            .get(TAG_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| SentinelError::MalformedLogLine {
                line,
                reason: "missing tag".to_string(),
            })?
            .to_string();
        let changenumber = object.get("changenumber").and_then(Value::as_i64);

        Ok(Self {
            tag,
            changenumber,
            canonical: canonical_bytes(&value)?,
        })
    }
}

/// Canonical bytes of a JSON object with its top-level tag removed.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, SentinelError> {
    let object = value
        .as_object()
        .ok_or_else(|| SentinelError::malformed("only JSON objects can be tagged"))?;
    let stripped: Map<String, Value> = object
        .iter()
        .filter(|(k, _)| k.as_str() != TAG_FIELD)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    canonical_json(&Value::Object(stripped))
}

fn canonical_json(value: &Value) -> Result<Vec<u8>, SentinelError> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), SentinelError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => {
            serde_json::to_writer(&mut *out, scalar)?;
        }
    }
    Ok(())
}

//! Distinguished names
//!
//! A DN is parsed into its ordered relative components and routed by
//! matching the component list from the root downwards. Anything that
//! does not parse, or does not sit under the configured base, is an error
//! rather than an ignored change.

use std::fmt;

use crate::error::SentinelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    pub attr: String,
    pub value: String,
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr, escape(&self.value))
    }
}

/// Components in written order, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName(Vec<Rdn>);

impl DistinguishedName {
    pub fn parse(text: &str) -> Result<Self, SentinelError> {
        let mut components = Vec::new();
        for raw in split_unescaped(text, ',')? {
            components.push(parse_rdn(&raw, text)?);
        }
        if components.is_empty() {
            return Err(SentinelError::DirectoryName("empty DN".to_string()));
        }
        Ok(Self(components))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn components(&self) -> &[Rdn] {
        &self.0
    }

    /// `(attr, value)` pairs starting at the root.
    fn path_from_root(&self) -> Vec<(&str, &str)> {
        self.0
            .iter()
            .rev()
            .map(|r| (r.attr.as_str(), r.value.as_str()))
            .collect()
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Operator,
    Reader,
}

impl Privilege {
    pub fn column(&self) -> &'static str {
        match self {
            Privilege::Operator => "operator",
            Privilege::Reader => "reader",
        }
    }

    pub fn group_name(&self) -> &'static str {
        match self {
            Privilege::Operator => "operators",
            Privilege::Reader => "readers",
        }
    }
}

/// What a changelog entry's target DN refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryTarget {
    User { uuid: String },
    SshKey { uuid: String, fingerprint: String },
    PrivilegeGroup(Privilege),
    /// Under the base but not tracked.
    Other,
}

impl DirectoryTarget {
    pub fn classify(dn: &DistinguishedName, base: &Rdn) -> Result<Self, SentinelError> {
        let path = dn.path_from_root();
        let (root, rest) = match path.split_first() {
            Some(split) => split,
            None => return Err(SentinelError::DirectoryName("empty DN".to_string())),
        };
        if *root != (base.attr.as_str(), base.value.as_str()) {
            return Err(SentinelError::DirectoryName(format!(
                "{} is not under {}",
                dn, base
            )));
        }

        let target = match rest {
            [("ou", "users"), ("uuid", uuid)] => DirectoryTarget::User {
                uuid: uuid.to_string(),
            },
            [("ou", "users"), ("uuid", uuid), ("fingerprint", fp)] => DirectoryTarget::SshKey {
                uuid: uuid.to_string(),
                fingerprint: fp.to_string(),
            },
            [("ou", "groups"), ("cn", "operators")] => {
                DirectoryTarget::PrivilegeGroup(Privilege::Operator)
            }
            [("ou", "groups"), ("cn", "readers")] => {
                DirectoryTarget::PrivilegeGroup(Privilege::Reader)
            }
            _ => DirectoryTarget::Other,
        };
        Ok(target)
    }

    /// Resolve a group member DN, which must name a user.
    pub fn member_uuid(text: &str, base: &Rdn) -> Result<String, SentinelError> {
        let dn = DistinguishedName::parse(text)?;
        match Self::classify(&dn, base)? {
            DirectoryTarget::User { uuid } => Ok(uuid),
            other => Err(SentinelError::DirectoryName(format!(
                "group member {} is not a user ({:?})",
                text, other
            ))),
        }
    }
}

/// Parse the configured base, which must be a single component.
pub fn parse_base(text: &str) -> Result<Rdn, SentinelError> {
    let dn = DistinguishedName::parse(text)?;
    match dn.0.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(SentinelError::DirectoryName(format!(
            "base {:?} must have exactly one component",
            text
        ))),
    }
}

fn parse_rdn(raw: &str, whole: &str) -> Result<Rdn, SentinelError> {
    let pieces = split_unescaped(raw, '=')?;
    let (attr, value) = match pieces.as_slice() {
        [attr, value] => (attr.trim(), value.trim()),
        _ => {
            return Err(SentinelError::DirectoryName(format!(
                "component {:?} of {:?} is not attr=value",
                raw.trim(),
                whole
            )))
        }
    };
    if attr.is_empty() || !attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(SentinelError::DirectoryName(format!(
            "bad attribute name {:?} in {:?}",
            attr, whole
        )));
    }
    if split_unescaped(value, '+')?.len() > 1 {
        return Err(SentinelError::DirectoryName(format!(
            "multi-valued component {:?} in {:?}",
            raw.trim(),
            whole
        )));
    }

    Ok(Rdn {
        attr: attr.to_ascii_lowercase(),
        value: unescape(value)?,
    })
}

/// Split on `sep` where it is not preceded by a backslash escape. Escapes
/// are preserved in the pieces.
fn split_unescaped(text: &str, sep: char) -> Result<Vec<String>, SentinelError> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let next = chars.next().ok_or_else(|| {
                SentinelError::DirectoryName(format!("trailing escape in {:?}", text))
            })?;
            current.push(c);
            current.push(next);
        } else if c == sep {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    pieces.push(current);

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(pieces)
}

fn unescape(value: &str) -> Result<String, SentinelError> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let first = chars
            .next()
            .ok_or_else(|| SentinelError::DirectoryName(format!("trailing escape in {:?}", value)))?;
        match chars.peek() {
            Some(second) if first.is_ascii_hexdigit() && second.is_ascii_hexdigit() => {
                let pair: String = [first, *second].iter().collect();
                chars.next();
                let byte = u8::from_str_radix(&pair, 16)
                    .map_err(|_| SentinelError::DirectoryName(format!("bad escape in {:?}", value)))?;
                bytes.push(byte);
            }
            _ => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(first.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| SentinelError::DirectoryName(format!("escaped value {:?} is not UTF-8", value)))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | '+' | '\\' | '"' | '<' | '>' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

//! Hash-chain key material
//!
//! The chain is seeded once with `secret_0 = HMAC-SHA1(root, challenge)`,
//! the same function a challenge-response token computes with the root
//! programmed as its key. Every committed entry is tagged with
//! `HMAC-SHA256(secret_i, canonical bytes)` and the secret is then replaced
//! by `SHA1(secret_i)`, so holding `secret_i` never yields `secret_{i-1}`.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::shamir::{combine, parse_shares};
use crate::error::SentinelError;

/// Length of the root secret and of every chain secret.
pub const SECRET_LEN: usize = 20;

/// Length of the bootstrap challenge.
pub const CHALLENGE_LEN: usize = 32;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// The one-time trust anchor. Never persisted by the service.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootSecret([u8; SECRET_LEN]);

impl RootSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SentinelError> {
        let arr: [u8; SECRET_LEN] = bytes.try_into().map_err(|_| {
            SentinelError::InvalidParameters(format!(
                "root secret must be {} bytes, got {}",
                SECRET_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(text: &str) -> Result<Self, SentinelError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| SentinelError::InvalidParameters(format!("invalid hex secret: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Hex root, or one or more comma-separated `t-i-hex` shares. Hex never
    /// contains `-`, so a lone share is still recognised.
    pub fn from_input(text: &str) -> Result<Self, SentinelError> {
        let text = text.trim();
        if text.contains(',') || text.contains('-') {
            return Self::from_bytes(&combine(&parse_shares(text)?)?);
        }
        Self::from_hex(text)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the first chain secret for a log started with `challenge`.
    pub fn derive_initial(&self, challenge: &Challenge) -> ChainSecret {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.0)
            .expect("HMAC accepts keys of any length");
        mac.update(challenge.as_bytes());
        ChainSecret(mac.finalize().into_bytes().into())
    }
}

impl fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootSecret(..)")
    }
}

/// Random nonce written as the first line of a log file.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LEN]);

impl Challenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SentinelError> {
        let arr: [u8; CHALLENGE_LEN] = bytes.try_into().map_err(|_| {
            SentinelError::InvalidParameters(format!(
                "challenge must be {} bytes, got {}",
                CHALLENGE_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(text: &str) -> Result<Self, SentinelError> {
        let bytes = hex::decode(text)
            .map_err(|e| SentinelError::InvalidParameters(format!("invalid challenge hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_base64(text: &str) -> Result<Self, SentinelError> {
        let bytes = BASE64
            .decode(text)
            .map_err(|e| SentinelError::InvalidParameters(format!("invalid challenge base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", self.to_hex())
    }
}

/// The current per-entry authentication key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChainSecret([u8; SECRET_LEN]);

impl ChainSecret {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SentinelError> {
        let arr: [u8; SECRET_LEN] = bytes.try_into().map_err(|_| {
            SentinelError::InvalidParameters(format!(
                "chain secret must be {} bytes, got {}",
                SECRET_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_base64(text: &str) -> Result<Self, SentinelError> {
        let bytes = BASE64
            .decode(text)
            .map_err(|e| SentinelError::InvalidParameters(format!("invalid secret base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// The one-way rotation applied after every committed entry.
    pub fn next(&self) -> ChainSecret {
        let digest = Sha1::digest(self.0);
        ChainSecret(digest.into())
    }

    /// Base64 `HMAC-SHA256(self, message)`.
    pub fn tag(&self, message: &[u8]) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .expect("HMAC accepts keys of any length");
        mac.update(message);
        BASE64.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for ChainSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChainSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rotation_is_deterministic() {
        let root = RootSecret::from_bytes(&[7u8; SECRET_LEN]).unwrap();
        let challenge = Challenge::from_hex(&"ab".repeat(CHALLENGE_LEN)).unwrap();

        let a = root.derive_initial(&challenge);
        let b = root.derive_initial(&challenge);
        assert_eq!(a, b);
        assert_eq!(a.next(), b.next());
        assert_ne!(a, a.next());
    }

    #[test]
    fn test_rotation_has_no_collisions_in_sample() {
        let mut seen = HashSet::new();
        let mut secret = RootSecret::generate().derive_initial(&Challenge::generate());
        for _ in 0..10_000 {
            assert!(seen.insert(secret.to_base64()));
            secret = secret.next();
        }
    }

    #[test]
    fn test_initial_secret_depends_on_challenge() {
        let root = RootSecret::generate();
        let a = root.derive_initial(&Challenge::generate());
        let b = root.derive_initial(&Challenge::generate());
        assert_ne!(a, b);
    }

    #[test]
    fn test_tag_depends_on_secret() {
        let challenge = Challenge::generate();
        let s0 = RootSecret::generate().derive_initial(&challenge);
        let s1 = s0.next();
        assert_eq!(s0.tag(b"entry"), s0.tag(b"entry"));
        assert_ne!(s0.tag(b"entry"), s1.tag(b"entry"));
        assert_eq!(BASE64.decode(s0.tag(b"entry")).unwrap().len(), 32);
    }

    #[test]
    fn test_challenge_encodings() {
        let challenge = Challenge::generate();
        assert_eq!(Challenge::from_hex(&challenge.to_hex()).unwrap(), challenge);
        assert_eq!(Challenge::from_base64(&challenge.to_base64()).unwrap(), challenge);
        assert!(Challenge::from_hex("abcd").is_err());
    }

    #[test]
    fn test_root_secret_hex() {
        let root = RootSecret::generate();
        let parsed = RootSecret::from_hex(&root.to_hex()).unwrap();
        assert_eq!(parsed.as_bytes(), root.as_bytes());
        assert!(RootSecret::from_hex("00ff").is_err());
        assert_eq!(format!("{:?}", root), "RootSecret(..)");
    }

    #[test]
    fn test_root_from_input() {
        let root = RootSecret::generate();
        assert_eq!(RootSecret::from_input(&root.to_hex()).unwrap().to_hex(), root.to_hex());

        let single = crate::crypto::split(root.as_bytes(), 1, 1).unwrap();
        let text = single[0].to_string();
        assert!(!text.contains(','));
        assert_eq!(RootSecret::from_input(&text).unwrap().to_hex(), root.to_hex());

        let shares = crate::crypto::split(root.as_bytes(), 3, 2).unwrap();
        let list = format!("{},{}", shares[0], shares[2]);
        assert_eq!(RootSecret::from_input(&list).unwrap().to_hex(), root.to_hex());

        assert!(RootSecret::from_input(&shares[1].to_string()).is_err());
        assert!(RootSecret::from_input("not hex").is_err());
    }
}

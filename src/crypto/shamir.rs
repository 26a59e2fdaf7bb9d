//! Shamir secret sharing over GF(2^8)
//!
//! Arithmetic uses the Rijndael polynomial (x^8 + x^4 + x^3 + x + 1).
//! Every byte of the secret gets its own random polynomial of degree
//! `threshold - 1`; share `i` holds the evaluations at `x = i`. Fewer than
//! `threshold` shares are consistent with every possible secret.
//!
//! Shares render as `<threshold>-<index>-<hex>`. The embedded threshold is
//! advisory: [`interpolate`] ignores it and will happily produce a wrong
//! secret from too few shares, [`combine`] refuses.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::SentinelError;

/// Largest share count representable with one-byte x coordinates.
pub const MAX_SHARES: usize = 255;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    threshold: u8,
    index: u8,
    data: Vec<u8>,
}

impl Share {
    pub fn threshold(&self) -> usize {
        self.threshold as usize
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.threshold, self.index, hex::encode(&self.data))
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("threshold", &self.threshold)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

impl FromStr for Share {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let (threshold, index, data) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(i), Some(d)) => (t, i, d),
            _ => {
                return Err(SentinelError::InvalidShare(
                    "expected <threshold>-<index>-<hex>".to_string(),
                ))
            }
        };

        let threshold: u8 = threshold
            .parse()
            .map_err(|_| SentinelError::InvalidShare(format!("bad threshold {:?}", threshold)))?;
        let index: u8 = index
            .parse()
            .map_err(|_| SentinelError::InvalidShare(format!("bad index {:?}", index)))?;
        if threshold == 0 || index == 0 {
            return Err(SentinelError::InvalidShare(
                "threshold and index must be non-zero".to_string(),
            ));
        }
        let data = hex::decode(data)
            .map_err(|e| SentinelError::InvalidShare(format!("bad share data: {}", e)))?;
        if data.is_empty() {
            return Err(SentinelError::InvalidShare("empty share data".to_string()));
        }

        Ok(Share {
            threshold,
            index,
            data,
        })
    }
}

/// Parse a comma-separated list of shares.
pub fn parse_shares(list: &str) -> Result<Vec<Share>, SentinelError> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Share::from_str)
        .collect()
}

/// Split `secret` into `n` shares, any `r` of which reconstruct it.
pub fn split(secret: &[u8], n: usize, r: usize) -> Result<Vec<Share>, SentinelError> {
    if r < 1 || r > n {
        return Err(SentinelError::InvalidParameters(format!(
            "threshold {} must be between 1 and the share count {}",
            r, n
        )));
    }
    if n > MAX_SHARES {
        return Err(SentinelError::InvalidParameters(format!(
            "at most {} shares are supported, requested {}",
            MAX_SHARES, n
        )));
    }
    if secret.is_empty() {
        return Err(SentinelError::InvalidParameters("secret is empty".to_string()));
    }

    let mut shares: Vec<Share> = (1..=n)
        .map(|i| Share {
            threshold: r as u8,
            index: i as u8,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coefficients = Zeroizing::new(vec![0u8; r]);
    for &byte in secret {
        coefficients[0] = byte;
        OsRng.fill_bytes(&mut coefficients[1..]);
        for share in shares.iter_mut() {
            let y = evaluate(&coefficients, share.index);
            share.data.push(y);
        }
    }

    Ok(shares)
}

/// Reconstruct the secret, refusing when fewer than the recorded threshold
/// of distinct shares are supplied.
pub fn combine(shares: &[Share]) -> Result<Vec<u8>, SentinelError> {
    let first = shares
        .first()
        .ok_or_else(|| SentinelError::InvalidParameters("no shares supplied".to_string()))?;

    let mut distinct: BTreeMap<u8, &Share> = BTreeMap::new();
    for share in shares {
        if share.threshold != first.threshold {
            return Err(SentinelError::InvalidShare(format!(
                "share {} has threshold {}, expected {}",
                share.index, share.threshold, first.threshold
            )));
        }
        if share.data.len() != first.data.len() {
            return Err(SentinelError::InvalidShare(format!(
                "share {} has length {}, expected {}",
                share.index,
                share.data.len(),
                first.data.len()
            )));
        }
        match distinct.get(&share.index) {
            Some(existing) if existing.data != share.data => {
                return Err(SentinelError::InvalidShare(format!(
                    "conflicting shares with index {}",
                    share.index
                )));
            }
            Some(_) => {}
            None => {
                distinct.insert(share.index, share);
            }
        }
    }

    let required = first.threshold();
    if distinct.len() < required {
        return Err(SentinelError::InsufficientShares {
            required,
            supplied: distinct.len(),
        });
    }

    let chosen: Vec<Share> = distinct.values().take(required).map(|s| (*s).clone()).collect();
    interpolate(&chosen)
}

/// Lagrange interpolation at zero over whatever shares are given. With
/// fewer shares than the threshold the result is wrong, not an error; the
/// caller has to check it against a known fingerprint of the secret.
pub fn interpolate(shares: &[Share]) -> Result<Vec<u8>, SentinelError> {
    let len = shares
        .first()
        .map(|s| s.data.len())
        .ok_or_else(|| SentinelError::InvalidParameters("no shares supplied".to_string()))?;
    if shares.iter().any(|s| s.data.len() != len) {
        return Err(SentinelError::InvalidShare("shares differ in length".to_string()));
    }

    let xs: Vec<u8> = shares.iter().map(|s| s.index).collect();
    let mut weights = Vec::with_capacity(xs.len());
    for (j, &xj) in xs.iter().enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;
        for (m, &xm) in xs.iter().enumerate() {
            if m == j {
                continue;
            }
            if xm == xj {
                return Err(SentinelError::InvalidShare(format!("duplicate share index {}", xj)));
            }
            num = gf_mul(num, xm);
            den = gf_mul(den, xm ^ xj);
        }
        weights.push(gf_mul(num, gf_inv(den)));
    }

    let mut secret = vec![0u8; len];
    for (share, &w) in shares.iter().zip(weights.iter()) {
        for (out, &y) in secret.iter_mut().zip(share.data.iter()) {
            *out ^= gf_mul(w, y);
        }
    }
    Ok(secret)
}

fn evaluate(coefficients: &[u8], x: u8) -> u8 {
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &c| gf_mul(acc, x) ^ c)
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    for _ in 0..8 {
        product ^= a & 0u8.wrapping_sub(b & 1);
        let carry = a >> 7;
        a = (a << 1) ^ (0x1b & 0u8.wrapping_sub(carry));
        b >>= 1;
    }
    product
}

// a^254 == a^-1 for a != 0
fn gf_inv(a: u8) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp > 0 {
        if exp & 1 == 1 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

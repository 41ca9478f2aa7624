//! Idempotency keys: validation of caller keys and derivation of sub-keys.
//!
//! A derived key is `"<tag>:<id>:<key>"`. Keys that would exceed the 64
//! character ledger limit are replaced by `"<tag>:"` followed by a prefix of
//! the hex digest of the full derived string, so retries derive the same key.

use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

pub const MAX_KEY_LEN: usize = 64;

/// Tag for the wallet leg of a wallet-paid order.
pub const ORDER_PAY: &str = "order_pay";
/// Tag for the wallet leg of a refund.
pub const ORDER_REFUND: &str = "order_refund";
/// Tag for the promotional correction row attached to a recharge.
pub const BONUS: &str = "bonus";

/// Prefixes of keys the core derives itself; callers may not use them.
pub const RESERVED_PREFIXES: [&str; 3] = ["order_pay:", "order_refund:", "bonus:"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdemKeyError {
    #[error("idempotency key must not be empty")]
    Empty,
    #[error("idempotency key is longer than {MAX_KEY_LEN} characters")]
    TooLong,
    #[error("idempotency key contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("idempotency key prefix {0:?} is reserved")]
    Reserved(&'static str),
}

/// Check a key against `[A-Za-z0-9_:.-]{1,64}`.
pub fn validate(key: &str) -> Result<(), IdemKeyError> {
    if key.is_empty() {
        return Err(IdemKeyError::Empty);
    }
    if let Some(c) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')))
    {
        return Err(IdemKeyError::InvalidChar(c));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(IdemKeyError::TooLong);
    }
    Ok(())
}

/// Validate a key supplied by a caller. On top of [`validate`], keys in the
/// namespaces the core derives for order payments, refunds and bonus rows
/// are refused so they can never collide with a derived key.
pub fn validate_caller(key: &str) -> Result<(), IdemKeyError> {
    validate(key)?;
    match RESERVED_PREFIXES.iter().find(|p| key.starts_with(*p)) {
        Some(prefix) => Err(IdemKeyError::Reserved(prefix)),
        None => Ok(()),
    }
}

/// Hash used to shorten overlong derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgo {
    fn hex_digest(self, input: &str) -> String {
        match self {
            HashAlgo::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
            HashAlgo::Sha512 => hex::encode(Sha512::digest(input.as_bytes())),
        }
    }
}

/// Derives deterministic sub-keys from caller keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdemDeriver {
    hash: HashAlgo,
}

impl IdemDeriver {
    pub fn new(hash: HashAlgo) -> Self {
        Self { hash }
    }

    pub fn derive(&self, tag: &str, id: i64, key: &str) -> String {
        let full = format!("{tag}:{id}:{key}");
        if full.len() <= MAX_KEY_LEN {
            return full;
        }
        let digest = self.hash.hex_digest(&full);
        let keep = MAX_KEY_LEN.saturating_sub(tag.len() + 1).min(digest.len());
        format!("{tag}:{}", &digest[..keep])
    }
}

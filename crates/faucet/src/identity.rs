//! Claimant identities and address syntax checks

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized claim key derived from a wallet address.
///
/// Addresses are case-folded so that the checksummed and lower-case
/// spellings of the same account share one cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Validate a raw address and normalize it.
    ///
    /// Returns `None` when the address fails [`is_valid_address`].
    pub fn parse(raw: &str) -> Option<Self> {
        if !is_valid_address(raw) {
            return None;
        }
        Some(Self::normalize(raw))
    }

    /// Normalize without validating. Callers must have checked the syntax.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 20 raw address bytes.
    pub fn to_bytes(&self) -> Option<[u8; 20]> {
        let digits = self.0.strip_prefix("0x").unwrap_or(&self.0);
        let decoded = hex::decode(digits).ok()?;
        decoded.try_into().ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ethereum address syntax predicate.
///
/// Accepts `0x` followed by 40 hex digits. All-lower and all-upper spellings
/// pass as-is; mixed case must match the EIP-55 checksum.
pub fn is_valid_address(raw: &str) -> bool {
    let Some(digits) = raw.strip_prefix("0x") else {
        return false;
    };
    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }

    let has_lower = digits.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = digits.bytes().any(|b| b.is_ascii_uppercase());
    if !(has_lower && has_upper) {
        return true;
    }

    digits == to_checksum(digits)
}

/// EIP-55 mixed-case encoding of 40 hex digits (no prefix).
fn to_checksum(digits: &str) -> String {
    let lower = digits.to_ascii_lowercase();
    let hash = keccak_hash::keccak(lower.as_bytes());
    let hash_hex = hex::encode(hash.0);

    lower
        .chars()
        .zip(hash_hex.chars())
        .map(|(c, h)| {
            if c.is_ascii_alphabetic() && h.to_digit(16).unwrap_or(0) >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

/// Render 20 address bytes in EIP-55 form.
pub fn checksum_address(bytes: &[u8; 20]) -> String {
    format!("0x{}", to_checksum(&hex::encode(bytes)))
}

// ABOUTME: Version token type - the 8-byte per-row change marker
// ABOUTME: Byte-wise ordering plus 0x-prefixed hex encoding for the token files

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::SyncError;

/// An 8-byte, database-maintained row version.
///
/// Tokens order byte-wise (big-endian), which is exactly how PostgreSQL
/// compares `bytea` values of equal length. The derived `Ord` on the inner
/// array gives that ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionToken([u8; VersionToken::LEN]);

impl VersionToken {
    pub const LEN: usize = 8;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// Build a token from a database value, rejecting anything not exactly 8 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let array: [u8; Self::LEN] = bytes.try_into().map_err(|_| {
            SyncError::parse(
                format!("{} bytes", bytes.len()),
                "version token must be exactly 8 bytes",
            )
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Encode as `0x` followed by 16 upper-case hex digits.
    pub fn to_hex(&self) -> String {
        format!("0x{:016X}", self.as_u64())
    }

    /// Decode `0xHHHHHHHHHHHHHHHH` (prefix case-insensitive, exactly 16 digits).
    pub fn parse_hex(text: &str) -> Result<Self, SyncError> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| SyncError::parse(trimmed, "version token must start with 0x"))?;

        if digits.len() != Self::LEN * 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SyncError::parse(
                trimmed,
                "version token must be exactly 16 hex digits",
            ));
        }

        let value = u64::from_str_radix(digits, 16)
            .map_err(|e| SyncError::parse(trimmed, e.to_string()))?;
        Ok(Self::from_u64(value))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for VersionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl FromStr for VersionToken {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s)
    }
}

pub fn compare_tokens(a: &VersionToken, b: &VersionToken) -> Ordering {
    a.cmp(b)
}

/// Minimum of two optional tokens; an absent side does not participate.
pub fn min_token(a: Option<VersionToken>, b: Option<VersionToken>) -> Option<VersionToken> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// True when `token` is strictly newer than `since`. A missing `since` means
/// nothing was synced yet, so every row counts as newer.
pub fn is_newer(token: Option<VersionToken>, since: Option<VersionToken>) -> bool {
    match (token, since) {
        (_, None) => true,
        (Some(token), Some(since)) => token > since,
        (None, Some(_)) => false,
    }
}

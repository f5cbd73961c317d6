use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::AppError;

/// Digest length in bytes (SHA-256)
pub const CHECKSUM_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChecksumParseError {
    #[error("checksum is not valid hex: {0}")]
    InvalidHex(String),

    #[error("checksum must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

impl From<ChecksumParseError> for AppError {
    fn from(err: ChecksumParseError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

/// Content digest of an asset's bytes.
///
/// Doubles as the integrity fingerprint and the duplicate-grouping key. On the wire it
/// is the lowercase hex encoding of the raw digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex string. Upper-case input is accepted; output is always lowercase.
    pub fn from_hex(s: &str) -> Result<Self, ChecksumParseError> {
        let raw = hex::decode(s.trim()).map_err(|e| ChecksumParseError::InvalidHex(e.to_string()))?;
        let actual = raw.len();
        let bytes: [u8; CHECKSUM_LEN] =
            raw.try_into()
                .map_err(|_| ChecksumParseError::InvalidLength {
                    expected: CHECKSUM_LEN,
                    actual,
                })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }
}

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn hex_is_lowercase_and_stable() {
        let checksum = Checksum::from_hex(&HELLO_SHA256.to_uppercase()).unwrap();
        assert_eq!(checksum.to_hex(), HELLO_SHA256);
        assert_eq!(checksum.to_string(), HELLO_SHA256);
    }

    #[test]
    fn rejects_invalid_hex() {
        assert!(matches!(
            Checksum::from_hex("not-hex"),
            Err(ChecksumParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            Checksum::from_hex("abc123"),
            Err(ChecksumParseError::InvalidLength {
                expected: CHECKSUM_LEN,
                actual: 3
            })
        );
    }

    #[test]
    fn parse_error_maps_to_invalid_input() {
        let err: AppError = Checksum::from_hex("zz").unwrap_err().into();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn serializes_as_hex_string() {
        let checksum = Checksum::from_hex(HELLO_SHA256).unwrap();
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_SHA256));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);
    }
}

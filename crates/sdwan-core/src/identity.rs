//! Node identity (32-byte public key) and its text encodings
//!
//! The canonical text form is standard base64 (44 characters, padded). The
//! filesystem-safe form replaces `/` with `-` so it can name a directory.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raw identity length in bytes
pub const IDENTITY_LEN: usize = 32;

/// Length of the canonical base64 text form
pub const IDENTITY_TEXT_LEN: usize = 44;

/// Identity parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity text must be {IDENTITY_TEXT_LEN} characters, got {0}")]
    BadLength(usize),
    #[error("invalid base64 identity: {0}")]
    Base64(String),
    #[error("identity decodes to {0} bytes, expected {IDENTITY_LEN}")]
    BadKeySize(usize),
}

/// A node's public-key identity
///
/// Ordering is byte-wise lexicographic on the raw key, which is what the
/// link-local side assignment relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub [u8; IDENTITY_LEN]);

impl Identity {
    /// Wrap raw key bytes
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Canonical base64 text
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Filesystem-safe text (`/` replaced by `-`)
    pub fn to_path(&self) -> String {
        self.to_base64().replace('/', "-")
    }

    /// Parse the filesystem-safe form produced by [`Identity::to_path`]
    pub fn from_path(name: &str) -> Result<Self, IdentityError> {
        name.replace('-', "/").parse()
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        let mut text = self.to_base64();
        text.truncate(8);
        text
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    /// Parses canonical base64. Surrounding whitespace (a trailing newline from
    /// a key file or request body) is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != IDENTITY_TEXT_LEN {
            return Err(IdentityError::BadLength(s.len()));
        }
        let decoded = STANDARD
            .decode(s)
            .map_err(|e| IdentityError::Base64(e.to_string()))?;
        let bytes: [u8; IDENTITY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::BadKeySize(decoded.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_base64())
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let id = Identity([0xfb; 32]);
        let text = id.to_string();
        assert_eq!(text.len(), IDENTITY_TEXT_LEN);
        assert_eq!(text.parse::<Identity>().unwrap(), id);
    }

    #[test]
    fn test_path_form_is_filesystem_safe() {
        // 0xff bytes encode to '/' characters in standard base64
        let id = Identity([0xff; 32]);
        assert!(id.to_base64().contains('/'));

        let path = id.to_path();
        assert!(!path.contains('/'));
        assert_eq!(Identity::from_path(&path).unwrap(), id);
    }

    #[test]
    fn test_trailing_newline_accepted() {
        let id = Identity([7; 32]);
        let text = format!("{}\n", id);
        assert_eq!(text.parse::<Identity>().unwrap(), id);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<Identity>(),
            Err(IdentityError::BadLength(3))
        );
        let bad = "!".repeat(IDENTITY_TEXT_LEN);
        assert!(matches!(
            bad.parse::<Identity>(),
            Err(IdentityError::Base64(_))
        ));
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[31] = 1;
        high[0] = 1;
        assert!(Identity(low) < Identity(high));
    }

    #[test]
    fn test_serde_as_string() {
        let id = Identity([3; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

//! Correlation key type.
//!
//! A [`CorrelationKey`] groups every message that belongs to the same
//! aggregate. The repository stores at most one snapshot per key.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `CorrelationKey` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid correlation key: {0}")]
pub struct ParseCorrelationKeyError(String);

/// Opaque, caller-supplied identifier of an aggregation group.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings (use for external input)
/// - `From::from()` and `new()`: no validation (trusted input)
///
/// # Examples
///
/// ```
/// use recoverable_aggregation_core::key::CorrelationKey;
///
/// let key = CorrelationKey::new("order-12345");
/// assert_eq!(key.as_str(), "order-12345");
///
/// let parsed: CorrelationKey = "order-12345".parse().unwrap();
/// assert_eq!(parsed, key);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Create a new `CorrelationKey` from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the key into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationKey {
    type Err = ParseCorrelationKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseCorrelationKeyError(
                "Correlation key cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for CorrelationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CorrelationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CorrelationKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parse_rejects_empty_key() {
        let result: Result<CorrelationKey, _> = "".parse();
        assert!(result.is_err());
    }

    #[test]
    fn display_matches_inner_string() {
        let key = CorrelationKey::new("batch-7");
        assert_eq!(format!("{key}"), "batch-7");
        assert_eq!(key.into_inner(), "batch-7");
    }

    #[test]
    fn set_lookup_by_str() {
        let mut keys = HashSet::new();
        keys.insert(CorrelationKey::from("a"));
        assert!(keys.contains("a"));
        assert!(!keys.contains("b"));
    }
}

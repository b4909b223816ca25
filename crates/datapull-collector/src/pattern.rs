//! Implicitly anchored regular expressions for relabel rules.

use std::fmt;

use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{CollectorError, Result};

/// A regular expression anchored as `^(?:…)$`, keeping the original text
/// for display and for default-value comparisons.
#[derive(Debug, Clone)]
pub struct AnchoredRegex {
    regex: Regex,
    original: String,
}

impl AnchoredRegex {
    /// Compile `pattern` with implicit anchors.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            CollectorError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            regex,
            original: pattern.to_string(),
        })
    }

    /// The pattern as written in the configuration.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Whether the whole of `text` matches.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Capture groups for the whole of `text`, if it matches.
    #[must_use]
    pub fn captures<'t>(&self, text: &'t str) -> Option<regex::Captures<'t>> {
        self.regex.captures(text)
    }

    /// Expand a `$1`-style replacement against a full match of `text`.
    ///
    /// Returns `None` when the pattern does not match.
    #[must_use]
    pub fn expand(&self, text: &str, replacement: &str) -> Option<String> {
        let caps = self.regex.captures(text)?;
        let mut out = String::new();
        caps.expand(replacement, &mut out);
        Some(out)
    }
}

impl Default for AnchoredRegex {
    fn default() -> Self {
        Self::new("").unwrap_or_else(|_| unreachable!("empty pattern always compiles"))
    }
}

impl PartialEq for AnchoredRegex {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl fmt::Display for AnchoredRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for AnchoredRegex {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        AnchoredRegex::new(&pattern).map_err(de::Error::custom)
    }
}

impl Serialize for AnchoredRegex {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchoring() {
        let re = AnchoredRegex::new("ab.").unwrap();
        assert!(re.is_match("abc"));
        assert!(!re.is_match("xabc"));
        assert!(!re.is_match("abcd"));
    }

    #[test]
    fn test_expand() {
        let re = AnchoredRegex::new("(\\w+);(\\w+)").unwrap();
        assert_eq!(re.expand("a;b", "$2-$1").as_deref(), Some("b-a"));
        assert!(re.expand("a b", "$1").is_none());
    }

    #[test]
    fn test_default_matches_only_empty() {
        let re = AnchoredRegex::default();
        assert!(re.is_match(""));
        assert!(!re.is_match("x"));
    }
}

//! LinkedIn URN handling.
//!
//! A URN looks like `urn:li:fs_miniProfile:XYZ` or, with a multi-part tail,
//! `urn:li:fs_event:(2-abc,12345)`. Only the tail id parts carry identity;
//! the prefix is decorative and ignored for equality and hashing.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Eq)]
pub struct Urn {
    prefix: String,
    id_parts: Vec<String>,
}

impl Urn {
    pub fn new(urn: &str) -> Self {
        let mut parts: Vec<&str> = urn.split(':').collect();
        let tail = parts.pop().unwrap_or_default();
        let prefix = parts.join(":");
        let id_parts = tail
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(str::to_owned)
            .collect();
        Self { prefix, id_parts }
    }

    /// The sole id part. Only valid for single-part URNs.
    pub fn get_id(&self) -> &str {
        debug_assert_eq!(self.id_parts.len(), 1, "get_id on multi-part URN {self}");
        &self.id_parts[0]
    }

    /// All id parts joined with `,` — the canonical identity string.
    pub fn id_str(&self) -> String {
        self.id_parts.join(",")
    }

    pub fn id_parts(&self) -> &[String] {
        &self.id_parts
    }

    /// The last id part. For `urn:li:fs_event:(thread,message)` this is the
    /// message id.
    pub fn last_part(&self) -> &str {
        self.id_parts.last().map(String::as_str).unwrap_or_default()
    }

    /// The first id part. For two-part event URNs this is the thread id.
    pub fn first_part(&self) -> &str {
        self.id_parts.first().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id_parts.len() == 1 {
            write!(f, "{}:{}", self.prefix, self.id_parts[0])
        } else {
            write!(f, "{}:({})", self.prefix, self.id_str())
        }
    }
}

impl PartialEq for Urn {
    fn eq(&self, other: &Self) -> bool {
        self.id_parts == other.id_parts
    }
}

impl Hash for Urn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id_str().hash(state);
    }
}

impl From<&str> for Urn {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Urn {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Urn::new(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_prefix() {
        assert_eq!(Urn::new("urn:123"), Urn::new("123"));
        assert_eq!(Urn::new("urn:(123,456)"), Urn::new("urn:test:(123,456)"));
        assert_ne!(Urn::new("urn:li:member:1"), Urn::new("urn:li:member:2"));
    }

    #[test]
    fn equality_in_tuples() {
        assert_eq!(
            (Urn::new("urn:123"), Urn::new("urn:(123,456)")),
            (Urn::new("123"), Urn::new("urn:test:(123,456)")),
        );
    }

    #[test]
    fn hashing_follows_equality() {
        let mut set = HashSet::new();
        set.insert(Urn::new("urn:li:fs_conversation:2-abc"));
        assert!(set.contains(&Urn::new("2-abc")));
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(Urn::new("urn:li:fs_miniProfile:XYZ").to_string(), "urn:li:fs_miniProfile:XYZ");
        assert_eq!(Urn::new("urn:li:fs_event:(2-abc,123)").to_string(), "urn:li:fs_event:(2-abc,123)");
    }

    #[test]
    fn multi_part_accessors() {
        let urn = Urn::new("urn:li:fs_event:(2-abc,123)");
        assert_eq!(urn.first_part(), "2-abc");
        assert_eq!(urn.last_part(), "123");
        assert_eq!(urn.id_str(), "2-abc,123");
    }

    #[test]
    fn serde_as_plain_string() {
        let urn: Urn = serde_json::from_str("\"urn:li:member:42\"").unwrap();
        assert_eq!(urn, Urn::new("42"));
        assert_eq!(serde_json::to_string(&urn).unwrap(), "\"urn:li:member:42\"");
    }
}

//! Resolved paths into the state tree

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Dotted path of a state below the machine root, e.g. `submit.success`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StatePath(Vec<String>);

impl StatePath {
    /// The machine root
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn child(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, `None` for the root
    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// True when `pattern` names this state or one of its ancestors.
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern: Vec<&str> = pattern.split('.').filter(|s| !s.is_empty()).collect();
        pattern.len() <= self.0.len() && pattern.iter().zip(&self.0).all(|(p, s)| *p == s)
    }

    pub fn starts_with(&self, other: &StatePath) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for StatePath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

impl PartialEq<str> for StatePath {
    fn eq(&self, other: &str) -> bool {
        self.0.iter().map(String::as_str).eq(other.split('.').filter(|s| !s.is_empty()))
    }
}

impl PartialEq<&str> for StatePath {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl Serialize for StatePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StatePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ancestors_only() {
        let path: StatePath = "ready.sendToReview.submitting".parse().unwrap();
        assert!(path.matches("ready"));
        assert!(path.matches("ready.sendToReview"));
        assert!(path.matches("ready.sendToReview.submitting"));
        assert!(!path.matches("ready.publish"));
        assert!(!path.matches("ready.sendToReview.submitting.extra"));
        assert!(!path.matches("sendToReview"));
    }

    #[test]
    fn compares_against_dotted_strings() {
        let path = StatePath::root().child("submit").child("success");
        assert_eq!(path, "submit.success");
        assert_eq!(path.to_string(), "submit.success");
        assert_eq!(path.leaf(), Some("success"));
        assert!(StatePath::root().is_root());
    }

    #[test]
    fn serializes_as_string() {
        let path: StatePath = "keywords.loaded".parse().unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"keywords.loaded\"");
        let back: StatePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}

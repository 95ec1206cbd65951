//! Identifiers shared by the collaboration relay and the compile queue.
//!
//! A [`DocumentKey`] is the wire form `<resourceId>:<path>`. The resource id
//! never contains a `:`, the path may.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Project (resource) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable user identifier (not a connection id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("document key is missing the ':' separator: {0}")]
    MissingSeparator(String),
    #[error("document key has an empty resource id or path: {0}")]
    EmptyComponent(String),
}

/// Index into the document registry: one collaborative file of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub resource_id: ResourceId,
    pub path: String,
}

impl DocumentKey {
    pub fn new(resource_id: ResourceId, path: impl Into<String>) -> Self {
        Self {
            resource_id,
            path: path.into(),
        }
    }

    /// Split on the first `:`.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let (resource, path) = raw
            .split_once(':')
            .ok_or_else(|| KeyError::MissingSeparator(raw.to_string()))?;
        if resource.is_empty() || path.is_empty() {
            return Err(KeyError::EmptyComponent(raw.to_string()));
        }
        Ok(Self::new(ResourceId::new(resource), path))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_id, self.path)
    }
}

impl FromStr for DocumentKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_colon() {
        let key = DocumentKey::parse("proj-1:chapters/intro:draft.tex").unwrap();
        assert_eq!(key.resource_id.as_str(), "proj-1");
        assert_eq!(key.path, "chapters/intro:draft.tex");
    }

    #[test]
    fn test_display_matches_wire_form() {
        let key = DocumentKey::new(ResourceId::from("p"), "main.tex");
        assert_eq!(key.to_string(), "p:main.tex");
        assert_eq!(DocumentKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert_eq!(
            DocumentKey::parse("no-separator"),
            Err(KeyError::MissingSeparator("no-separator".into()))
        );
        assert!(matches!(DocumentKey::parse(":main.tex"), Err(KeyError::EmptyComponent(_))));
        assert!(matches!(DocumentKey::parse("proj:"), Err(KeyError::EmptyComponent(_))));
    }
}

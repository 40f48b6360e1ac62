//! Slash-separated document and collection paths

use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Path to a collection (odd number of segments)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionPath(String);

/// Path to a document (even number of segments)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentPath(String);

fn segment_count(path: &str) -> StoreResult<usize> {
    let mut count = 0;
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(StoreError::InvalidPath(format!(
                "empty segment in '{}'",
                path
            )));
        }
        count += 1;
    }
    Ok(count)
}

impl CollectionPath {
    /// Top-level collection
    pub fn root(name: &str) -> Self {
        Self(name.to_string())
    }

    /// Parse and validate a collection path
    pub fn parse(path: &str) -> StoreResult<Self> {
        let path = Self(path.to_string());
        path.validate()?;
        Ok(path)
    }

    /// Check that every segment is non-empty and the segment count is odd
    pub fn validate(&self) -> StoreResult<()> {
        if segment_count(&self.0)? % 2 == 0 {
            return Err(StoreError::InvalidPath(format!(
                "'{}' names a document, not a collection",
                self.0
            )));
        }
        Ok(())
    }

    /// Document with the given id inside this collection
    pub fn doc(&self, id: &str) -> DocumentPath {
        DocumentPath(format!("{}/{}", self.0, id))
    }

    /// Last segment
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Owning document, `None` for top-level collections
    pub fn parent(&self) -> Option<DocumentPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| DocumentPath(parent.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DocumentPath {
    /// Parse and validate a document path
    pub fn parse(path: &str) -> StoreResult<Self> {
        let path = Self(path.to_string());
        path.validate()?;
        Ok(path)
    }

    /// Check that every segment is non-empty and the segment count is even
    pub fn validate(&self) -> StoreResult<()> {
        if segment_count(&self.0)? % 2 != 0 {
            return Err(StoreError::InvalidPath(format!(
                "'{}' names a collection, not a document",
                self.0
            )));
        }
        Ok(())
    }

    /// Sub-collection of this document
    pub fn collection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, name))
    }

    /// Document id (last segment)
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Collection containing this document
    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    /// True when `self` lives anywhere below `collection`
    pub fn is_descendant_of(&self, collection: &CollectionPath) -> bool {
        self.0.len() > collection.0.len()
            && self.0.starts_with(&collection.0)
            && self.0.as_bytes()[collection.0.len()] == b'/'
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_building() {
        let channel = CollectionPath::root("servers")
            .doc("s1")
            .collection("channels")
            .doc("general");
        assert_eq!(channel.as_str(), "servers/s1/channels/general");
        assert_eq!(channel.id(), "general");
        assert_eq!(channel.parent().as_str(), "servers/s1/channels");
        assert_eq!(channel.parent().name(), "channels");
        assert_eq!(
            channel.parent().parent().map(|p| p.to_string()),
            Some("servers/s1".to_string())
        );
        assert!(channel.validate().is_ok());
    }

    #[test]
    fn test_parse_rejects_wrong_kind() {
        assert!(CollectionPath::parse("servers/s1").is_err());
        assert!(DocumentPath::parse("servers").is_err());
        assert!(DocumentPath::parse("servers//channels/x").is_err());
        assert!(DocumentPath::parse("servers/s1").is_ok());
    }

    #[test]
    fn test_descendant() {
        let connections = CollectionPath::parse("a/b/connections").unwrap();
        let record = connections.doc("r1");
        let candidate = record.collection("offerCandidates").doc("c1");
        assert!(candidate.is_descendant_of(&connections));
        assert!(record.is_descendant_of(&connections));

        let other = CollectionPath::parse("a/b/connectionsX").unwrap().doc("r1");
        assert!(!other.is_descendant_of(&connections));
    }
}

//! Voice channel addressing

use crate::{Error, Result};
use serde::Serialize;
use signaling_store::{CollectionPath, DocumentPath};
use std::fmt;

/// Collection holding one negotiation record per connected pair
pub const CONNECTIONS_COLLECTION: &str = "connections";

/// Presence documents keyed by uid
pub const ROSTER_COLLECTION: &str = "users";

/// Roster array field on the channel document
pub const ROSTER_FIELD: &str = "users";

/// Check that an id can be used as a single path segment
///
/// `+` is reserved as the separator inside negotiation record ids.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentifier(format!("{} must not be empty", kind)));
    }
    if value.contains('/') || value.contains('+') {
        return Err(Error::InvalidIdentifier(format!(
            "{} '{}' must not contain '/' or '+'",
            kind, value
        )));
    }
    Ok(())
}

/// One voice channel inside a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    server_id: String,
    channel_id: String,
    #[serde(skip)]
    path: DocumentPath,
}

impl ChannelRef {
    pub fn new(server_id: &str, channel_id: &str) -> Result<Self> {
        validate_identifier("server id", server_id)?;
        validate_identifier("channel id", channel_id)?;

        let path = CollectionPath::root("servers")
            .doc(server_id)
            .collection("channels")
            .doc(channel_id);

        Ok(Self {
            server_id: server_id.to_string(),
            channel_id: channel_id.to_string(),
            path,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Channel document carrying the roster array
    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    pub fn records_path(&self) -> CollectionPath {
        self.path.collection(CONNECTIONS_COLLECTION)
    }

    pub fn roster_path(&self) -> CollectionPath {
        self.path.collection(ROSTER_COLLECTION)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.channel_id)
    }
}

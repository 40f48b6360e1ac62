//! Channel membership tracking
//!
//! Presence is mirrored twice: one presence document per member under the
//! channel's `users` sub-collection, and an entry in the `users` array on
//! the channel document for atomic add/remove. Departure notifications are
//! driven by the presence documents.

use crate::channel::{validate_identifier, ChannelRef, ROSTER_FIELD};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use signaling_store::{fields, DocumentPath, SignalingStore, StoreError, Subscription};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A member of a voice channel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUser {
    pub uid: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: String,
}

impl VoiceUser {
    pub fn new(uid: &str, display_name: &str) -> Result<Self> {
        validate_identifier("uid", uid)?;
        Ok(Self {
            uid: uid.to_string(),
            display_name: display_name.to_string(),
            avatar_ref: String::new(),
        })
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = avatar_ref.into();
        self
    }

    fn to_value(&self) -> Result<Value> {
        Ok(Value::Object(fields(self)?))
    }
}

/// Roster reads and writes for one channel
pub struct MembershipTracker {
    store: Arc<dyn SignalingStore>,
    channel: ChannelRef,
    retries: u32,
}

impl MembershipTracker {
    /// `retries` is the number of extra attempts for the roster write
    pub fn new(store: Arc<dyn SignalingStore>, channel: ChannelRef, retries: u32) -> Self {
        Self {
            store,
            channel,
            retries,
        }
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    pub fn presence_path(&self, uid: &str) -> DocumentPath {
        self.channel.roster_path().doc(uid)
    }

    /// Join: register `user`, then return everyone else already present
    pub async fn join(&self, user: &VoiceUser) -> Result<Vec<VoiceUser>> {
        self.register(user).await?;
        match self.members_excluding(&user.uid).await {
            Ok(members) => Ok(members),
            Err(e) => {
                self.rollback(user).await;
                Err(e)
            }
        }
    }

    /// Write presence and the roster entry, retrying transient failures
    ///
    /// On final failure any half-written presence is rolled back so the
    /// caller stays fully not-joined.
    pub async fn register(&self, user: &VoiceUser) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.write_presence(user).await {
                Ok(()) => {
                    info!("{} joined roster of {}", user.uid, self.channel);
                    return Ok(());
                }
                Err(e) if attempt < self.retries && e.is_retryable() => {
                    attempt += 1;
                    warn!(
                        "Roster write for {} failed, retrying ({}/{}): {}",
                        user.uid, attempt, self.retries, e
                    );
                }
                Err(e) => {
                    self.rollback(user).await;
                    return Err(e);
                }
            }
        }
    }

    async fn write_presence(&self, user: &VoiceUser) -> Result<()> {
        let entry = user.to_value()?;

        self.store
            .set_document(&self.presence_path(&user.uid), fields(user)?)
            .await
            .map_err(|e| Error::signaling_write("write presence record", e))?;

        match self
            .store
            .array_union(self.channel.path(), ROSTER_FIELD, entry.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(_)) => self.create_channel_roster(entry).await,
            Err(e) => Err(Error::signaling_write("add to channel roster", e)),
        }
    }

    /// First member of a channel whose document does not exist yet
    async fn create_channel_roster(&self, entry: Value) -> Result<()> {
        let doc = fields(json!({ ROSTER_FIELD: [entry.clone()] }))?;
        match self.store.insert_document(self.channel.path(), doc).await {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => self
                .store
                .array_union(self.channel.path(), ROSTER_FIELD, entry)
                .await
                .map_err(|e| Error::signaling_write("add to channel roster", e)),
            Err(e) => Err(Error::signaling_write("create channel roster", e)),
        }
    }

    async fn rollback(&self, user: &VoiceUser) {
        if let Err(e) = self.leave(user).await {
            warn!("Failed to roll back roster entry for {}: {}", user.uid, e);
        }
    }

    /// Every member with a presence document, ordered by uid
    pub async fn members(&self) -> Result<Vec<VoiceUser>> {
        let docs = self
            .store
            .list_documents(&self.channel.roster_path(), None)
            .await
            .map_err(|e| Error::signaling_read("read channel roster", e))?;

        let mut members: Vec<VoiceUser> = docs
            .iter()
            .filter_map(|doc| match doc.decode::<VoiceUser>() {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!("Skipping malformed presence record {}: {}", doc.path, e);
                    None
                }
            })
            .collect();
        members.sort();
        Ok(members)
    }

    pub async fn members_excluding(&self, uid: &str) -> Result<Vec<VoiceUser>> {
        let mut members = self.members().await?;
        members.retain(|member| member.uid != uid);
        Ok(members)
    }

    /// Remove the roster entry and the presence record
    ///
    /// Both removals are attempted; the first failure is returned.
    pub async fn leave(&self, user: &VoiceUser) -> Result<()> {
        let mut first_error = None;

        match user.to_value() {
            Ok(entry) => match self
                .store
                .array_remove(self.channel.path(), ROSTER_FIELD, entry)
                .await
            {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!("Failed to remove {} from roster of {}: {}", user.uid, self.channel, e);
                    first_error = Some(Error::signaling_write("remove from channel roster", e));
                }
            },
            Err(e) => first_error = Some(e),
        }

        if let Err(e) = self.store.delete_document(&self.presence_path(&user.uid)).await {
            warn!("Failed to delete presence record for {}: {}", user.uid, e);
            first_error.get_or_insert(Error::signaling_write("delete presence record", e));
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("{} left roster of {}", user.uid, self.channel);
                Ok(())
            }
        }
    }

    /// Watch presence documents
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.store
            .subscribe_collection(&self.channel.roster_path())
            .await
            .map_err(|e| Error::signaling_read("watch channel roster", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signaling_store::{InMemoryStore, StoreOperation};

    fn tracker(store: &InMemoryStore, retries: u32) -> MembershipTracker {
        let channel = ChannelRef::new("s1", "general").unwrap();
        MembershipTracker::new(Arc::new(store.clone()), channel, retries)
    }

    fn user(uid: &str) -> VoiceUser {
        VoiceUser::new(uid, &uid.to_uppercase()).unwrap()
    }

    async fn roster_array(store: &InMemoryStore, tracker: &MembershipTracker) -> Vec<Value> {
        store
            .get_document(tracker.channel().path())
            .await
            .unwrap()
            .and_then(|doc| doc.get(ROSTER_FIELD).cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    #[test]
    fn test_voice_user_wire_format() {
        let user = VoiceUser::new("alice", "Alice").unwrap().with_avatar("a.png");
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({ "uid": "alice", "displayName": "Alice", "avatarRef": "a.png" })
        );
        assert!(VoiceUser::new("", "Nobody").is_err());
    }

    #[tokio::test]
    async fn test_join_returns_existing_members() {
        let store = InMemoryStore::new();
        let tracker = tracker(&store, 1);

        assert!(tracker.join(&user("carol")).await.unwrap().is_empty());
        assert_eq!(tracker.join(&user("alice")).await.unwrap(), vec![user("carol")]);

        let snapshot = tracker.join(&user("bob")).await.unwrap();
        assert_eq!(snapshot, vec![user("alice"), user("carol")]);
        assert_eq!(roster_array(&store, &tracker).await.len(), 3);
    }

    #[tokio::test]
    async fn test_leave_removes_both_mirrors() {
        let store = InMemoryStore::new();
        let tracker = tracker(&store, 1);
        tracker.join(&user("alice")).await.unwrap();
        tracker.join(&user("bob")).await.unwrap();

        tracker.leave(&user("alice")).await.unwrap();
        assert_eq!(tracker.members().await.unwrap(), vec![user("bob")]);
        assert_eq!(roster_array(&store, &tracker).await, vec![user("bob").to_value().unwrap()]);

        // Leaving twice is harmless
        tracker.leave(&user("alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_roster_write_retried_once() {
        let store = InMemoryStore::new();
        let tracker = tracker(&store, 1);

        store.fail_next(StoreOperation::Set, 1);
        tracker.register(&user("alice")).await.unwrap();
        assert_eq!(tracker.members().await.unwrap(), vec![user("alice")]);
    }

    #[tokio::test]
    async fn test_roster_write_failure_rolls_back() {
        let store = InMemoryStore::new();
        let tracker = tracker(&store, 1);
        tracker.join(&user("bob")).await.unwrap();

        store.fail_next(StoreOperation::ArrayUnion, 2);
        let err = tracker.register(&user("alice")).await.unwrap_err();
        assert!(matches!(err, Error::SignalingWrite { .. }));

        assert_eq!(tracker.members().await.unwrap(), vec![user("bob")]);
        assert_eq!(roster_array(&store, &tracker).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_attempts_every_removal() {
        let store = InMemoryStore::new();
        let tracker = tracker(&store, 0);
        tracker.join(&user("alice")).await.unwrap();

        store.fail_next(StoreOperation::ArrayRemove, 1);
        assert!(tracker.leave(&user("alice")).await.is_err());
        assert!(tracker.members().await.unwrap().is_empty());
    }
}

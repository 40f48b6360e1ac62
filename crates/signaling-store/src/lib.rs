//! Signaling store contract for mesh voice negotiation
//!
//! A shared, multi-reader/multi-writer document store used purely as a
//! rendezvous: peers write negotiation records and ICE candidates into it
//! and watch each other's writes through change subscriptions.
//!
//! # Model
//!
//! ```text
//! servers/{serverId}                     (document)
//! └─ channels                            (collection)
//!    └─ {channelId}                      (document, field `users: [..]`)
//!       ├─ users/{uid}                   (presence documents)
//!       └─ connections/{recordId}        (negotiation records)
//!          ├─ offerCandidates/{id}
//!          └─ answerCandidates/{id}
//! ```
//!
//! Paths alternate collection and document segments. Documents carry a
//! JSON object of fields. Deleting a document never removes its
//! sub-collections.
//!
//! # Example
//!
//! ```
//! use signaling_store::{CollectionPath, InMemoryStore, SignalingStore};
//! use serde_json::json;
//!
//! # async fn example() -> signaling_store::StoreResult<()> {
//! let store = InMemoryStore::new();
//! let channel = CollectionPath::root("servers").doc("s1").collection("channels").doc("general");
//!
//! store.set_document(&channel, signaling_store::fields(json!({ "users": [] }))?).await?;
//! store.array_union(&channel, "users", json!({ "uid": "alice" })).await?;
//!
//! let doc = store.get_document(&channel).await?.unwrap();
//! assert_eq!(doc.get("users").unwrap().as_array().unwrap().len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod memory;
pub mod path;
pub mod store;

pub use document::{fields, ChangeKind, Document, DocumentChange, FieldFilter, Fields};
pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryStore, StoreOperation};
pub use path::{CollectionPath, DocumentPath};
pub use store::{SignalingStore, Subscription};

//! Negotiation records and their candidate sub-collections

use crate::channel::ChannelRef;
use crate::transport::{IceCandidate, SdpType, SessionDescription, SessionRole};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use signaling_store::{
    fields, CollectionPath, Document, DocumentPath, FieldFilter, SignalingStore, StoreError,
    Subscription,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const OFFER_USER_FIELD: &str = "offerUser";
pub const ANSWER_USER_FIELD: &str = "answerUser";
pub const OFFER_CANDIDATES: &str = "offerCandidates";
pub const ANSWER_CANDIDATES: &str = "answerCandidates";

/// Record id for an unordered pair of users
///
/// Both members derive the same id, so a pair can never hold two records.
pub fn record_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}+{}", a, b)
    } else {
        format!("{}+{}", b, a)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordFields {
    offer_user: String,
    answer_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
}

/// Validated snapshot of one negotiation record
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationRecord {
    pub path: DocumentPath,
    pub offer_user: String,
    pub answer_user: String,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
}

impl NegotiationRecord {
    /// Parse and validate a record read from the store
    pub fn from_document(doc: &Document) -> Result<Self> {
        let raw: RecordFields = doc
            .decode()
            .map_err(|e| Error::InvalidRecord(e.to_string()))?;

        if raw.offer_user.is_empty() || raw.answer_user.is_empty() {
            return Err(Error::InvalidRecord(format!(
                "{} is missing a participant",
                doc.path
            )));
        }
        if raw.offer_user == raw.answer_user {
            return Err(Error::InvalidRecord(format!(
                "{} pairs {} with itself",
                doc.path, raw.offer_user
            )));
        }
        if raw.offer.as_ref().is_some_and(|d| d.sdp_type != SdpType::Offer) {
            return Err(Error::InvalidRecord(format!(
                "{} offer field holds an answer",
                doc.path
            )));
        }
        if raw.answer.as_ref().is_some_and(|d| d.sdp_type != SdpType::Answer) {
            return Err(Error::InvalidRecord(format!(
                "{} answer field holds an offer",
                doc.path
            )));
        }

        Ok(Self {
            path: doc.path.clone(),
            offer_user: raw.offer_user,
            answer_user: raw.answer_user,
            offer: raw.offer,
            answer: raw.answer,
        })
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Offer present, no answer yet, and `uid` is the answerer
    pub fn awaiting_answer_from(&self, uid: &str) -> bool {
        self.answer_user == uid && self.offer.is_some() && self.answer.is_none()
    }

    /// The answer, when `uid` is the offerer and it has arrived
    pub fn answered_for(&self, uid: &str) -> Option<&SessionDescription> {
        if self.offer_user == uid {
            self.answer.as_ref()
        } else {
            None
        }
    }

    pub fn involves(&self, uid: &str) -> bool {
        self.offer_user == uid || self.answer_user == uid
    }
}

/// Parse a candidate document
pub fn candidate_from_document(doc: &Document) -> Result<IceCandidate> {
    doc.decode()
        .map_err(|e| Error::InvalidRecord(format!("bad ICE candidate: {}", e)))
}

/// Handle to one negotiation record in the store
#[derive(Clone)]
pub struct NegotiationRecordRef {
    store: Arc<dyn SignalingStore>,
    path: DocumentPath,
}

impl NegotiationRecordRef {
    pub fn new(store: Arc<dyn SignalingStore>, path: DocumentPath) -> Self {
        Self { store, path }
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    /// Create the record if absent
    ///
    /// Returns `false` when another writer already holds it.
    pub async fn claim(&self, offer_user: &str, answer_user: &str) -> Result<bool> {
        let record = fields(json!({
            OFFER_USER_FIELD: offer_user,
            ANSWER_USER_FIELD: answer_user,
        }))?;

        match self.store.insert_document(&self.path, record).await {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(Error::signaling_write("create negotiation record", e)),
        }
    }

    pub async fn read(&self) -> Result<Option<NegotiationRecord>> {
        let doc = self
            .store
            .get_document(&self.path)
            .await
            .map_err(|e| Error::signaling_read("read negotiation record", e))?;
        doc.as_ref().map(NegotiationRecord::from_document).transpose()
    }

    pub async fn write_offer(&self, offer: &SessionDescription) -> Result<()> {
        let update = fields(json!({ "offer": offer }))?;
        self.store
            .update_document(&self.path, update)
            .await
            .map_err(|e| Error::signaling_write("write offer", e))
    }

    pub async fn write_answer(&self, answer: &SessionDescription) -> Result<()> {
        let update = fields(json!({ "answer": answer }))?;
        self.store
            .update_document(&self.path, update)
            .await
            .map_err(|e| Error::signaling_write("write answer", e))
    }

    /// Sub-collection where `role` publishes its own candidates
    pub fn local_candidates(&self, role: SessionRole) -> CollectionPath {
        match role {
            SessionRole::Offerer => self.path.collection(OFFER_CANDIDATES),
            SessionRole::Answerer => self.path.collection(ANSWER_CANDIDATES),
        }
    }

    /// Sub-collection `role` must watch for the other side's candidates
    pub fn remote_candidates(&self, role: SessionRole) -> CollectionPath {
        match role {
            SessionRole::Offerer => self.path.collection(ANSWER_CANDIDATES),
            SessionRole::Answerer => self.path.collection(OFFER_CANDIDATES),
        }
    }

    pub async fn publish_candidate(&self, role: SessionRole, candidate: &IceCandidate) -> Result<()> {
        let doc = fields(candidate)?;
        self.store
            .create_document(&self.local_candidates(role), doc)
            .await
            .map(|_| ())
            .map_err(|e| Error::signaling_write("publish ICE candidate", e))
    }

    pub async fn subscribe_remote_candidates(&self, role: SessionRole) -> Result<Subscription> {
        self.store
            .subscribe_collection(&self.remote_candidates(role))
            .await
            .map_err(|e| Error::signaling_read("watch ICE candidates", e))
    }

    /// Delete both candidate sets, then the record
    ///
    /// Every delete is attempted; the first failure is returned.
    pub async fn purge(&self) -> Result<()> {
        let mut first_error = None;

        for name in [OFFER_CANDIDATES, ANSWER_CANDIDATES] {
            let collection = self.path.collection(name);
            let candidates = match self.store.list_documents(&collection, None).await {
                Ok(docs) => docs,
                Err(e) => {
                    warn!("Failed to list {}: {}", collection, e);
                    first_error.get_or_insert(Error::signaling_read("list ICE candidates", e));
                    continue;
                }
            };
            for doc in candidates {
                if let Err(e) = self.store.delete_document(&doc.path).await {
                    warn!("Failed to delete candidate {}: {}", doc.path, e);
                    first_error.get_or_insert(Error::signaling_write("delete ICE candidate", e));
                }
            }
        }

        if let Err(e) = self.store.delete_document(&self.path).await {
            warn!("Failed to delete negotiation record {}: {}", self.path, e);
            first_error.get_or_insert(Error::signaling_write("delete negotiation record", e));
        } else {
            debug!("Deleted negotiation record {}", self.path);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for NegotiationRecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NegotiationRecordRef").field(&self.path).finish()
    }
}

/// The channel's `connections` collection
#[derive(Clone)]
pub struct RecordCollection {
    store: Arc<dyn SignalingStore>,
    path: CollectionPath,
}

impl RecordCollection {
    pub fn new(store: Arc<dyn SignalingStore>, channel: &ChannelRef) -> Self {
        Self {
            store,
            path: channel.records_path(),
        }
    }

    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    /// Record shared by `a` and `b`
    pub fn record_for(&self, a: &str, b: &str) -> NegotiationRecordRef {
        self.reference(self.path.doc(&record_id(a, b)))
    }

    pub fn reference(&self, path: DocumentPath) -> NegotiationRecordRef {
        NegotiationRecordRef::new(Arc::clone(&self.store), path)
    }

    /// Every record naming `uid` as offerer or answerer
    pub async fn involving(&self, uid: &str) -> Result<Vec<NegotiationRecordRef>> {
        let mut found = BTreeMap::new();
        for field in [OFFER_USER_FIELD, ANSWER_USER_FIELD] {
            let filter = FieldFilter::equals(field, uid);
            let docs = self
                .store
                .list_documents(&self.path, Some(&filter))
                .await
                .map_err(|e| Error::signaling_read("list negotiation records", e))?;
            for doc in docs {
                found.insert(doc.path.clone(), doc.path);
            }
        }
        Ok(found.into_values().map(|path| self.reference(path)).collect())
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        self.store
            .subscribe_collection(&self.path)
            .await
            .map_err(|e| Error::signaling_read("watch negotiation records", e))
    }
}

impl fmt::Debug for RecordCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordCollection").field(&self.path).finish()
    }
}

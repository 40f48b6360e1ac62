//! Offer/answer/candidate exchange over the signaling store
//!
//! Negotiation records live under the channel's `connections` collection,
//! one per connected pair, with each side's ICE candidates in a
//! sub-collection. Watchers turn store changes into [`SignalEvent`]s for
//! the engine; nothing store-specific leaks past this module.

pub mod record;
pub mod watchers;

pub use record::{
    record_id, NegotiationRecord, NegotiationRecordRef, RecordCollection, ANSWER_CANDIDATES,
    OFFER_CANDIDATES,
};
pub use watchers::{CandidateWatch, ChannelWatchers, SignalEvent};

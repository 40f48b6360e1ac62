//! Store subscriptions feeding the engine
//!
//! Each watcher is a forwarder task that turns raw store changes into
//! [`SignalEvent`]s on the engine's event queue. Dropping a watcher aborts
//! its task, which drops the underlying subscription.

use super::record::{candidate_from_document, NegotiationRecord, NegotiationRecordRef, RecordCollection};
use crate::membership::{MembershipTracker, VoiceUser};
use crate::transport::{IceCandidate, SessionDescription, SessionRole};
use crate::Result;
use signaling_store::{ChangeKind, DocumentChange, Subscription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Protocol event observed in the signaling store
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// A record names us as answerer, carries an offer and has no answer
    OfferReceived(NegotiationRecord),
    /// A record we offered on now carries an answer
    AnswerReceived {
        record_id: String,
        answer: SessionDescription,
    },
    /// The other side of a session published a candidate
    CandidateReceived {
        record_id: String,
        candidate: IceCandidate,
    },
    MemberJoined(VoiceUser),
    MemberLeft(String),
}

/// Channel-scoped watchers: new offers, answers and departures
pub struct ChannelWatchers {
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelWatchers {
    pub async fn start(
        records: &RecordCollection,
        membership: &MembershipTracker,
        self_uid: &str,
        events: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<Self> {
        let offers = records.subscribe().await?;
        let answers = records.subscribe().await?;
        let roster = membership.subscribe().await?;

        let tasks = vec![
            tokio::spawn(watch_offers(offers, self_uid.to_string(), events.clone())),
            tokio::spawn(watch_answers(answers, self_uid.to_string(), events.clone())),
            tokio::spawn(watch_roster(roster, self_uid.to_string(), events)),
        ];

        debug!("Watching {} for {}", records.path(), self_uid);
        Ok(Self { tasks })
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChannelWatchers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parse_record(change: &DocumentChange) -> Option<NegotiationRecord> {
    if change.kind == ChangeKind::Removed {
        return None;
    }
    match NegotiationRecord::from_document(&change.doc) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring negotiation record: {}", e);
            None
        }
    }
}

async fn watch_offers(
    mut changes: Subscription,
    self_uid: String,
    events: mpsc::UnboundedSender<SignalEvent>,
) {
    while let Some(change) = changes.next().await {
        let Some(record) = parse_record(&change) else {
            continue;
        };
        if record.awaiting_answer_from(&self_uid) {
            debug!("Offer from {} on {}", record.offer_user, record.id());
            if events.send(SignalEvent::OfferReceived(record)).is_err() {
                break;
            }
        }
    }
}

async fn watch_answers(
    mut changes: Subscription,
    self_uid: String,
    events: mpsc::UnboundedSender<SignalEvent>,
) {
    while let Some(change) = changes.next().await {
        let Some(record) = parse_record(&change) else {
            continue;
        };
        if let Some(answer) = record.answered_for(&self_uid) {
            let event = SignalEvent::AnswerReceived {
                record_id: record.id().to_string(),
                answer: answer.clone(),
            };
            if events.send(event).is_err() {
                break;
            }
        }
    }
}

async fn watch_roster(
    mut changes: Subscription,
    self_uid: String,
    events: mpsc::UnboundedSender<SignalEvent>,
) {
    while let Some(change) = changes.next().await {
        let uid = change.doc.id().to_string();
        if uid == self_uid {
            continue;
        }

        let event = match change.kind {
            ChangeKind::Removed => SignalEvent::MemberLeft(uid),
            ChangeKind::Added | ChangeKind::Modified => match change.doc.decode::<VoiceUser>() {
                Ok(user) => SignalEvent::MemberJoined(user),
                Err(e) => {
                    warn!("Ignoring presence record {}: {}", change.doc.path, e);
                    continue;
                }
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Remote candidate feed for one session
pub struct CandidateWatch {
    record_id: String,
    task: JoinHandle<()>,
}

impl CandidateWatch {
    /// Watch the candidates published by the side opposite `role`
    pub async fn start(
        record: &NegotiationRecordRef,
        role: SessionRole,
        events: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<Self> {
        let mut changes = record.subscribe_remote_candidates(role).await?;
        let record_id = record.id().to_string();

        let task_record = record_id.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                if change.kind != ChangeKind::Added {
                    continue;
                }
                let candidate = match candidate_from_document(&change.doc) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        debug!("Skipping candidate on {}: {}", task_record, e);
                        continue;
                    }
                };
                let event = SignalEvent::CandidateReceived {
                    record_id: task_record.clone(),
                    candidate,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Self { record_id, task })
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }
}

impl Drop for CandidateWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

//! Signaling relay: addressed, durable delivery of negotiation envelopes
//!
//! Envelopes are stored per recipient as relay JSON documents. A
//! subscriber first receives everything already stored for it, then live
//! envelopes, each exactly once per subscription. Nothing is removed on
//! delivery, so a later subscription for the same recipient replays the
//! whole inbox until [`SignalingTransport::discard_inbox`] is called.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::subscription::Subscription;
use crate::models::{ParticipantId, SignalingEnvelope};
use crate::{Error, Result};

/// Default number of stored documents per recipient
pub const DEFAULT_INBOX_LIMIT: usize = 1024;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Store and deliver an envelope to `envelope.to`
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()>;

    /// Receive every envelope addressed to `recipient`
    async fn subscribe(&self, recipient: &ParticipantId)
        -> Result<Subscription<SignalingEnvelope>>;

    /// Forget envelopes stored for `recipient`
    async fn discard_inbox(&self, _recipient: &ParticipantId) -> Result<()> {
        Ok(())
    }
}

type SubscriberId = u64;

#[derive(Default)]
struct Inbox {
    documents: VecDeque<String>,
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<SignalingEnvelope>)>,
}

/// In-process signaling relay
#[derive(Clone)]
pub struct MemoryRelay {
    inboxes: Arc<DashMap<ParticipantId, Inbox>>,
    next_subscriber: Arc<AtomicU64>,
    inbox_limit: usize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::with_inbox_limit(DEFAULT_INBOX_LIMIT)
    }
}

impl MemoryRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_inbox_limit(inbox_limit: usize) -> Self {
        Self {
            inboxes: Arc::new(DashMap::new()),
            next_subscriber: Arc::new(AtomicU64::new(0)),
            inbox_limit: inbox_limit.max(1),
        }
    }

    /// Documents currently stored for `recipient`
    #[must_use]
    pub fn stored(&self, recipient: &ParticipantId) -> usize {
        self.inboxes
            .get(recipient)
            .map_or(0, |inbox| inbox.documents.len())
    }

    fn detach(&self, recipient: &ParticipantId, subscriber_id: SubscriberId) {
        if let Some(mut inbox) = self.inboxes.get_mut(recipient) {
            inbox.subscribers.retain(|(id, _)| *id != subscriber_id);
            debug!(recipient = %recipient, subscriber_id, "Relay subscriber detached");
        }
        self.inboxes.remove_if(recipient, |_, inbox| {
            inbox.documents.is_empty() && inbox.subscribers.is_empty()
        });
    }
}

fn decode(document: &str) -> Option<SignalingEnvelope> {
    match SignalingEnvelope::from_json(document) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable relay document");
            None
        }
    }
}

#[async_trait]
impl SignalingTransport for MemoryRelay {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        let document = envelope
            .to_json()
            .map_err(|e| Error::Delivery(format!("failed to encode envelope: {e}")))?;

        let mut inbox = self.inboxes.entry(envelope.to.clone()).or_default();
        inbox.documents.push_back(document);
        if inbox.documents.len() > self.inbox_limit {
            inbox.documents.pop_front();
            warn!(
                recipient = %envelope.to,
                limit = self.inbox_limit,
                "Relay inbox full, dropped oldest envelope"
            );
        }

        inbox.subscribers.retain(|(subscriber_id, sender)| {
            if sender.send(envelope.clone()).is_ok() {
                true
            } else {
                warn!(
                    recipient = %envelope.to,
                    subscriber_id,
                    "Relay subscriber is gone, removing"
                );
                false
            }
        });

        debug!(
            from = %envelope.from,
            to = %envelope.to,
            kind = %envelope.kind(),
            live = inbox.subscribers.len(),
            "Envelope stored"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        recipient: &ParticipantId,
    ) -> Result<Subscription<SignalingEnvelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            let mut inbox = self.inboxes.entry(recipient.clone()).or_default();
            let mut replayed = 0usize;
            for envelope in inbox.documents.iter().filter_map(|doc| decode(doc)) {
                let _ = tx.send(envelope);
                replayed += 1;
            }
            inbox.subscribers.push((subscriber_id, tx));
            debug!(recipient = %recipient, subscriber_id, replayed, "Relay subscriber attached");
        }

        let relay = self.clone();
        let recipient = recipient.clone();
        Ok(Subscription::new(rx, move || {
            relay.detach(&recipient, subscriber_id);
        }))
    }

    async fn discard_inbox(&self, recipient: &ParticipantId) -> Result<()> {
        if let Some(mut inbox) = self.inboxes.get_mut(recipient) {
            let discarded = inbox.documents.len();
            inbox.documents.clear();
            debug!(recipient = %recipient, discarded, "Relay inbox discarded");
        }
        self.inboxes.remove_if(recipient, |_, inbox| {
            inbox.documents.is_empty() && inbox.subscribers.is_empty()
        });
        Ok(())
    }
}

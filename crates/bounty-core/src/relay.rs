//! Gossip relay contract.
//!
//! Delivery is at-least-once and unordered across reconnects. Subscriptions
//! are exposed as a channel so each inbox has one ordered inbound stream
//! consumed by a single loop.

use crate::error::BountyError;
use crate::identity::{verify_signature, Identity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Report,
    Response,
    TokenTransfer,
}

/// Signed relay event. `content` is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: String,
    pub kind: EventKind,
    pub sender: String,
    pub recipient: String,
    /// Unix seconds.
    pub created_at: i64,
    pub content: String,
    pub sig: String,
}

impl RelayEvent {
    pub fn signed(
        identity: &Identity,
        kind: EventKind,
        recipient: impl Into<String>,
        content: impl Into<String>,
        created_at: i64,
    ) -> Self {
        let recipient = recipient.into();
        let content = content.into();
        let sender = identity.public_key();
        let id = event_id(&sender, &recipient, kind, created_at, &content);
        let sig = identity.sign(id.as_bytes());
        Self {
            id,
            kind,
            sender,
            recipient,
            created_at,
            content,
            sig,
        }
    }

    /// Recompute the id and check the sender's signature over it.
    pub fn verify(&self) -> bool {
        let expected = event_id(
            &self.sender,
            &self.recipient,
            self.kind,
            self.created_at,
            &self.content,
        );
        expected == self.id && verify_signature(&self.sender, self.id.as_bytes(), &self.sig)
    }
}

fn event_id(sender: &str, recipient: &str, kind: EventKind, created_at: i64, content: &str) -> String {
    let material = serde_json::json!([sender, recipient, kind, created_at, content]);
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Subscription / query filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    pub recipient: String,
    /// Unix seconds, inclusive.
    pub since: i64,
}

impl EventFilter {
    pub fn new(recipient: impl Into<String>, kinds: Vec<EventKind>, since: i64) -> Self {
        Self {
            kinds,
            recipient: recipient.into(),
            since,
        }
    }

    pub fn matches(&self, event: &RelayEvent) -> bool {
        event.recipient == self.recipient
            && event.created_at >= self.since
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
    }
}

/// Relay capability consumed by ingestion and settlement.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Publish a signed event, returning its id.
    async fn publish(&self, event: RelayEvent) -> Result<String, BountyError>;

    /// Live subscription, replaying matching events from `filter.since`.
    async fn subscribe(&self, filter: EventFilter) -> Result<mpsc::Receiver<RelayEvent>, BountyError>;

    /// One-shot backfill query.
    async fn query_once(&self, filter: &EventFilter) -> Result<Vec<RelayEvent>, BountyError>;

    fn connected_relays(&self) -> Vec<String>;
}

/// Sign and publish `content` under a bounded timeout.
pub async fn publish_signed(
    relay: &dyn RelayClient,
    identity: &Identity,
    kind: EventKind,
    recipient: &str,
    content: String,
    timeout: Duration,
) -> Result<String, BountyError> {
    let event = RelayEvent::signed(
        identity,
        kind,
        recipient,
        content,
        chrono::Utc::now().timestamp(),
    );
    match tokio::time::timeout(timeout, relay.publish(event)).await {
        Ok(result) => result,
        Err(_) => Err(BountyError::Transport(format!(
            "relay publish timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_event_verifies_and_detects_tampering() {
        let identity = Identity::generate();
        let event = RelayEvent::signed(&identity, EventKind::Report, "inbox", "{}", 100);
        assert!(event.verify());

        let mut tampered = event.clone();
        tampered.content = "{\"x\":1}".to_string();
        assert!(!tampered.verify());
    }

    #[test]
    fn filter_matches_recipient_kind_and_time() {
        let identity = Identity::generate();
        let event = RelayEvent::signed(&identity, EventKind::Response, "inbox", "{}", 100);

        assert!(EventFilter::new("inbox", vec![], 100).matches(&event));
        assert!(!EventFilter::new("inbox", vec![], 101).matches(&event));
        assert!(!EventFilter::new("other", vec![], 0).matches(&event));
        assert!(!EventFilter::new("inbox", vec![EventKind::Report], 0).matches(&event));
    }
}

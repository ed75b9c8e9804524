//! Relay transport layer.
//!
//! Defines the event kinds this crate publishes and the seam between the
//! publisher (or collector) and the relay wire protocol.
//!
//! # Event Kinds
//!
//! | Kind | Name | Description |
//! |------|------|-------------|
//! | 9898 | Telemetry | Canonical event JSON, plaintext or NIP-44 ciphertext |
//! | 1059 | Gift wrap | NIP-17 direct message copy |
//! | 4 | Encrypted DM | Legacy NIP-04 direct message copy |
//!
//! # Transports
//!
//! - [`WebSocketTransport`]: NIP-01 over `tokio-tungstenite`, one connection per attempt
//! - [`MemoryTransport`]: records units in memory; used for dry runs and tests

use futures_util::{SinkExt, StreamExt};
use nostr::{Event as NostrEvent, JsonUtil};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Event kind for telemetry events.
pub const KIND_EVENT: u16 = 9898;

/// Event kind for NIP-59 gift wraps.
pub const KIND_GIFT_WRAP: u16 = 1059;

/// Event kind for NIP-04 encrypted direct messages.
pub const KIND_ENCRYPTED_DM: u16 = 4;

/// Errors from a single relay attempt.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Relay rejected event: {0}")]
    Rejected(String),

    #[error("Relay closed connection before acknowledging")]
    Closed,

    #[error("Relay closed subscription: {0}")]
    SubscriptionClosed(String),
}

/// NIP-01 subscription filter.
///
/// Empty lists and `None` fields are left out of the wire form, which means
/// "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayFilter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    /// Hex public keys of unit signers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Hex public keys named in `p` tags.
    #[serde(rename = "#p", skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RelayFilter {
    /// Whether a relay applying this filter would return `event`.
    /// `limit` is not considered.
    pub fn matches(&self, event: &NostrEvent) -> bool {
        let created_at = event.created_at.as_u64();
        (self.kinds.is_empty() || self.kinds.contains(&event.kind.as_u16()))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey.to_hex()))
            && (self.recipients.is_empty()
                || event.tags.iter().any(|tag| match tag.as_slice() {
                    [key, value, ..] => key == "p" && self.recipients.contains(value),
                    _ => false,
                }))
            && self.since.map_or(true, |since| created_at >= since)
            && self.until.map_or(true, |until| created_at <= until)
    }
}

/// Moves signed events between this crate and one relay.
///
/// Implementations resolve once the relay has answered. Timeouts are applied
/// by the caller.
pub trait RelayTransport: Send + Sync {
    /// Delivers one signed event and waits for the relay's acknowledgement.
    fn send_event(
        &self,
        relay: &str,
        event: &NostrEvent,
    ) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Returns the stored events matching `filter`, up to end of stored events.
    fn fetch_events(
        &self,
        relay: &str,
        filter: &RelayFilter,
    ) -> impl Future<Output = Result<Vec<NostrEvent>, RelayError>> + Send;
}

/// NIP-01 WebSocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Parses a relay `["OK", <id>, <accepted>, <message>]` reply for `event_id`.
fn parse_ok(text: &str, event_id: &str) -> Option<Result<(), RelayError>> {
    let msg: Vec<serde_json::Value> = serde_json::from_str(text).ok()?;
    if msg.len() < 3 || msg[0].as_str() != Some("OK") || msg[1].as_str() != Some(event_id) {
        return None;
    }

    let reason = msg
        .get(3)
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    match msg[2].as_bool() {
        Some(true) => Some(Ok(())),
        _ => Some(Err(RelayError::Rejected(reason))),
    }
}

/// Relay reply within one subscription.
#[derive(Debug)]
enum SubscriptionMessage {
    Event(Box<NostrEvent>),
    Eose,
    Closed(String),
}

/// Parses `["EVENT", <sub>, <event>]`, `["EOSE", <sub>]` and
/// `["CLOSED", <sub>, <message>]` replies for `sub_id`.
fn parse_subscription_message(text: &str, sub_id: &str) -> Option<SubscriptionMessage> {
    let msg: Vec<serde_json::Value> = serde_json::from_str(text).ok()?;
    if msg.get(1)?.as_str()? != sub_id {
        return None;
    }

    match msg[0].as_str()? {
        "EVENT" => serde_json::from_value(msg.get(2)?.clone())
            .ok()
            .map(|event| SubscriptionMessage::Event(Box::new(event))),
        "EOSE" => Some(SubscriptionMessage::Eose),
        "CLOSED" => Some(SubscriptionMessage::Closed(
            msg.get(2)
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
        )),
        _ => None,
    }
}

impl RelayTransport for WebSocketTransport {
    async fn send_event(&self, relay: &str, event: &NostrEvent) -> Result<(), RelayError> {
        let (ws_stream, _) = connect_async(relay)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let event_id = event.id.to_hex();
        let req = format!(r#"["EVENT",{}]"#, event.as_json());
        write.send(Message::Text(req.into())).await?;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(ack) = parse_ok(&text, &event_id) {
                        let _ = write.send(Message::Close(None)).await;
                        return ack;
                    }
                    tracing::trace!(relay, message = %text.as_str(), "ignoring relay message");
                }
                Ok(Message::Close(_)) => return Err(RelayError::Closed),
                Err(e) => return Err(e.into()),
                _ => {}
            }
        }

        Err(RelayError::Closed)
    }

    async fn fetch_events(
        &self,
        relay: &str,
        filter: &RelayFilter,
    ) -> Result<Vec<NostrEvent>, RelayError> {
        let (ws_stream, _) = connect_async(relay)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let sub_id = format!("sentrystr-{}", uuid::Uuid::new_v4().simple());
        let req = serde_json::json!(["REQ", sub_id, filter]).to_string();
        write.send(Message::Text(req.into())).await?;

        let mut events = Vec::new();
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match parse_subscription_message(&text, &sub_id) {
                    Some(SubscriptionMessage::Event(event)) => {
                        if event.verify().is_ok() {
                            events.push(*event);
                        } else {
                            tracing::debug!(relay, event_id = %event.id, "dropping event with bad signature");
                        }
                    }
                    Some(SubscriptionMessage::Eose) => break,
                    Some(SubscriptionMessage::Closed(reason)) => {
                        return Err(RelayError::SubscriptionClosed(reason))
                    }
                    None => {
                        tracing::trace!(relay, message = %text.as_str(), "ignoring relay message")
                    }
                },
                Ok(Message::Close(_)) => break,
                Err(e) => return Err(e.into()),
                _ => {}
            }
        }

        let close = serde_json::json!(["CLOSE", sub_id]).to_string();
        let _ = write.send(Message::Text(close.into())).await;
        let _ = write.send(Message::Close(None)).await;

        Ok(events)
    }
}

/// Per-relay behaviour of a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Behaviour {
    Reject(String),
    Hang,
}

#[derive(Debug, Default)]
struct MemoryState {
    attempts: Vec<(String, NostrEvent)>,
    sent: Vec<(String, NostrEvent)>,
    behaviour: HashMap<String, Behaviour>,
    rejected_kinds: HashMap<u16, String>,
}

/// In-memory transport that records every accepted unit.
///
/// Clones share state, so a clone kept by the caller observes what the
/// client published.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `relay` refuse every event with `reason`.
    pub async fn reject_relay(&self, relay: impl Into<String>, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .behaviour
            .insert(relay.into(), Behaviour::Reject(reason.into()));
    }

    /// Makes every relay refuse events of `kind` with `reason`.
    pub async fn reject_kind(&self, kind: u16, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .rejected_kinds
            .insert(kind, reason.into());
    }

    /// Makes `relay` never answer.
    pub async fn hang_relay(&self, relay: impl Into<String>) {
        self.state
            .lock()
            .await
            .behaviour
            .insert(relay.into(), Behaviour::Hang);
    }

    /// Every `(relay, event)` pair offered to this transport, accepted or not.
    pub async fn attempts(&self) -> Vec<(String, NostrEvent)> {
        self.state.lock().await.attempts.clone()
    }

    /// Every accepted `(relay, event)` pair in arrival order.
    pub async fn sent(&self) -> Vec<(String, NostrEvent)> {
        self.state.lock().await.sent.clone()
    }

    /// Distinct accepted events, in first-arrival order.
    pub async fn units(&self) -> Vec<NostrEvent> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        state
            .sent
            .iter()
            .filter(|(_, event)| seen.insert(event.id))
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Events accepted by one relay.
    pub async fn sent_to(&self, relay: &str) -> Vec<NostrEvent> {
        self.state
            .lock()
            .await
            .sent
            .iter()
            .filter(|(r, _)| r == relay)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl RelayTransport for MemoryTransport {
    async fn send_event(&self, relay: &str, event: &NostrEvent) -> Result<(), RelayError> {
        let behaviour = {
            let mut state = self.state.lock().await;
            state.attempts.push((relay.to_string(), event.clone()));
            state.behaviour.get(relay).cloned().or_else(|| {
                state
                    .rejected_kinds
                    .get(&event.kind.as_u16())
                    .map(|reason| Behaviour::Reject(reason.clone()))
            })
        };

        match behaviour {
            Some(Behaviour::Reject(reason)) => Err(RelayError::Rejected(reason)),
            Some(Behaviour::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RelayError::Closed)
            }
            None => {
                self.state
                    .lock()
                    .await
                    .sent
                    .push((relay.to_string(), event.clone()));
                Ok(())
            }
        }
    }

    /// Serves the events this relay accepted, newest first.
    async fn fetch_events(
        &self,
        relay: &str,
        filter: &RelayFilter,
    ) -> Result<Vec<NostrEvent>, RelayError> {
        let behaviour = self.state.lock().await.behaviour.get(relay).cloned();
        match behaviour {
            Some(Behaviour::Reject(reason)) => Err(RelayError::SubscriptionClosed(reason)),
            Some(Behaviour::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RelayError::Closed)
            }
            None => {
                let mut events = self.sent_to(relay).await;
                events.retain(|event| filter.matches(event));
                events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                if let Some(limit) = filter.limit {
                    events.truncate(limit);
                }
                Ok(events)
            }
        }
    }
}

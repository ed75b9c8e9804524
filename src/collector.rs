//! Reading captured events back from relays.
//!
//! A [`Collector`] asks every relay for stored telemetry units, opens the
//! ones it can, parses the canonical payload and applies an [`EventFilter`].
//!
//! | Unit | Read as |
//! |------|---------|
//! | Public telemetry (9898) | canonical JSON content, signer is the author |
//! | NIP-44 telemetry (9898, `encrypted` tag) | opened with the collector keys |
//! | Gift wrap (1059) / NIP-04 (4) | opened with the collector keys, real author from the envelope |
//!
//! Units that cannot be opened or parsed are skipped and logged at `debug`.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use nostr::{Event as NostrEvent, EventId, Keys, Kind, PublicKey};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use crate::config::{self, Config, ConfigError, DEFAULT_RELAY_TIMEOUT};
use crate::crypto::open_envelope;
use crate::event::Event;
use crate::level::Level;
use crate::payload::from_canonical_json;
use crate::transport::{
    RelayFilter, RelayTransport, WebSocketTransport, KIND_ENCRYPTED_DM, KIND_EVENT,
    KIND_GIFT_WRAP,
};

/// Default number of events returned by [`Collector::events_by_author`].
pub const DEFAULT_AUTHOR_LIMIT: usize = 100;

/// Collection errors.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("No relay answered: {0}")]
    AllRelaysFailed(String),

    #[error("Reading direct messages requires the recipient keys")]
    MissingKeys,
}

/// Which captured events to return.
///
/// Every constraint that is set must hold. Level and author sets match any
/// of their members.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    authors: Option<HashSet<PublicKey>>,
    levels: Option<HashSet<Level>>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    tags: Vec<(String, String)>,
    limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(HashSet::new).insert(author);
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.levels.get_or_insert_with(HashSet::new).insert(level);
        self
    }

    /// Accepts `level` and every more severe level.
    pub fn with_min_level(self, level: Level) -> Self {
        Level::ALL
            .into_iter()
            .filter(|l| *l >= level)
            .fold(self, Self::with_level)
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Requires the event tag `key` to equal `value`.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_service(self, service: impl Into<String>) -> Self {
        self.with_tag("service", service)
    }

    pub fn with_environment(self, environment: impl Into<String>) -> Self {
        self.with_tag("env", environment)
    }

    pub fn with_component(self, component: impl Into<String>) -> Self {
        self.with_tag("component", component)
    }

    pub fn with_severity(self, severity: impl Into<String>) -> Self {
        self.with_tag("severity", severity)
    }

    /// Caps the number of returned events, newest first.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event`, written by `author`, passes every constraint.
    pub fn matches(&self, event: &Event, author: &PublicKey) -> bool {
        self.authors.as_ref().map_or(true, |a| a.contains(author))
            && self.levels.as_ref().map_or(true, |l| l.contains(&event.level))
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp <= until)
            && self
                .tags
                .iter()
                .all(|(key, value)| event.tags.get(key) == Some(value))
    }

    /// Relay-side part of this filter for units of `kind`.
    ///
    /// `until` stays local: units are signed after the event timestamp, so
    /// a relay-side bound could drop matching events.
    fn relay_filter(&self, kind: u16) -> RelayFilter {
        let mut authors: Vec<String> = self
            .authors
            .iter()
            .flatten()
            .map(PublicKey::to_hex)
            .collect();
        authors.sort();

        RelayFilter {
            kinds: vec![kind],
            authors,
            since: self.since.map(|since| since.timestamp().max(0) as u64),
            limit: self.limit,
            ..Default::default()
        }
    }
}

/// One event read back from a relay.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedEvent {
    pub event: Event,
    /// Signer of the payload (the sealed author for gift wraps).
    pub author: PublicKey,
    /// Id of the Nostr unit that carried the event.
    pub unit_id: EventId,
    pub received_at: DateTime<Utc>,
}

/// Reads captured events from relays.
///
/// # Example
///
/// ```no_run
/// use sentrystr::collector::{Collector, EventFilter};
/// use sentrystr::Level;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let collector = Collector::new(vec!["wss://relay.damus.io".into()])?;
/// let filter = EventFilter::new()
///     .with_min_level(Level::Error)
///     .with_service("billing")
///     .with_limit(20);
///
/// for collected in collector.collect_events(&filter).await? {
///     println!("{} {:?}", collected.event.level, collected.event.message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Collector<T = WebSocketTransport> {
    transport: T,
    relays: Vec<String>,
    keys: Option<Keys>,
    event_kind: u16,
    fetch_timeout: Duration,
}

impl Collector<WebSocketTransport> {
    /// Creates a collector that reads public units over WebSockets.
    pub fn new(relays: Vec<String>) -> Result<Self, ConfigError> {
        Self::with_transport(relays, WebSocketTransport::new())
    }
}

impl<T: RelayTransport> Collector<T> {
    pub fn with_transport(relays: Vec<String>, transport: T) -> Result<Self, ConfigError> {
        config::validate_relays(&relays)?;
        Ok(Self {
            transport,
            relays,
            keys: None,
            event_kind: KIND_EVENT,
            fetch_timeout: DEFAULT_RELAY_TIMEOUT,
        })
    }

    /// Creates a collector over the relays, keys, kind and timeout of
    /// `config`. Units addressed to the config's identity can be opened.
    pub fn from_config(config: &Config, transport: T) -> Self {
        Self {
            transport,
            relays: config.relays().to_vec(),
            keys: Some(config.keys().clone()),
            event_kind: config.event_kind(),
            fetch_timeout: config.relay_timeout(),
        }
    }

    /// Keys used to open encrypted units and direct messages.
    pub fn with_keys(mut self, keys: Keys) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_event_kind(mut self, kind: u16) -> Self {
        self.event_kind = kind;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Returns telemetry events matching `filter`, newest first.
    ///
    /// Encrypted units are included when they are addressed to the
    /// collector keys.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::AllRelaysFailed`] when no relay answered.
    /// Failures of some relays are logged and skipped.
    pub async fn collect_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<CollectedEvent>, CollectError> {
        let units = self.fetch(&filter.relay_filter(self.event_kind)).await?;
        Ok(self.read_units(units, filter))
    }

    /// Returns direct-message copies addressed to the collector keys,
    /// newest first.
    ///
    /// Gift wraps hide their author and timestamp, so `filter` is applied
    /// after opening.
    pub async fn collect_direct_messages(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<CollectedEvent>, CollectError> {
        let keys = self.keys.as_ref().ok_or(CollectError::MissingKeys)?;
        let relay_filter = RelayFilter {
            kinds: vec![KIND_GIFT_WRAP, KIND_ENCRYPTED_DM],
            recipients: vec![keys.public_key().to_hex()],
            ..Default::default()
        };
        let units = self.fetch(&relay_filter).await?;
        Ok(self.read_units(units, filter))
    }

    /// Returns up to `limit` (default [`DEFAULT_AUTHOR_LIMIT`]) events
    /// published by `author`.
    pub async fn events_by_author(
        &self,
        author: PublicKey,
        limit: Option<usize>,
    ) -> Result<Vec<CollectedEvent>, CollectError> {
        let filter = EventFilter::new()
            .with_author(author)
            .with_limit(limit.unwrap_or(DEFAULT_AUTHOR_LIMIT));
        self.collect_events(&filter).await
    }

    async fn fetch_from(&self, relay: &str, filter: &RelayFilter) -> Result<Vec<NostrEvent>, String> {
        match tokio::time::timeout(self.fetch_timeout, self.transport.fetch_events(relay, filter))
            .await
        {
            Ok(Ok(units)) => {
                tracing::debug!(relay, count = units.len(), "relay returned units");
                Ok(units)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out".to_string()),
        }
    }

    /// Queries every relay at once and merges the answers, first copy wins.
    async fn fetch(&self, filter: &RelayFilter) -> Result<Vec<NostrEvent>, CollectError> {
        let results = join_all(self.relays.iter().map(|relay| self.fetch_from(relay, filter))).await;

        let mut seen = HashSet::new();
        let mut units = Vec::new();
        let mut failures = Vec::new();
        for (relay, result) in self.relays.iter().zip(results) {
            match result {
                Ok(fetched) => units.extend(fetched.into_iter().filter(|u| seen.insert(u.id))),
                Err(reason) => {
                    tracing::warn!(relay = %relay, %reason, "relay fetch failed");
                    failures.push(format!("{relay}: {reason}"));
                }
            }
        }

        if failures.len() == self.relays.len() {
            return Err(CollectError::AllRelaysFailed(failures.join(", ")));
        }
        Ok(units)
    }

    fn read_units(&self, units: Vec<NostrEvent>, filter: &EventFilter) -> Vec<CollectedEvent> {
        let received_at = Utc::now();
        let mut collected: Vec<CollectedEvent> = units
            .iter()
            .filter_map(|unit| self.read_unit(unit))
            .filter(|(event, author, _)| filter.matches(event, author))
            .map(|(event, author, unit_id)| CollectedEvent {
                event,
                author,
                unit_id,
                received_at,
            })
            .collect();

        collected.sort_by(|a, b| b.event.timestamp.cmp(&a.event.timestamp));
        if let Some(limit) = filter.limit {
            collected.truncate(limit);
        }
        collected
    }

    fn read_unit(&self, unit: &NostrEvent) -> Option<(Event, PublicKey, EventId)> {
        let (plaintext, author) = if is_encrypted(unit) {
            let Some(keys) = &self.keys else {
                tracing::debug!(unit_id = %unit.id, "skipping encrypted unit without keys");
                return None;
            };
            let opened = match open_envelope(keys, unit) {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::debug!(unit_id = %unit.id, error = %e, "skipping unit we cannot open");
                    return None;
                }
            };
            let author = PublicKey::from_hex(&opened.author).ok()?;
            (opened.plaintext, author)
        } else {
            (unit.content.clone(), unit.pubkey)
        };

        match from_canonical_json(&plaintext) {
            Ok(event) => Some((event, author, unit.id)),
            Err(e) => {
                tracing::debug!(unit_id = %unit.id, error = %e, "skipping unit without event payload");
                None
            }
        }
    }
}

fn is_encrypted(unit: &NostrEvent) -> bool {
    unit.kind == Kind::GiftWrap
        || unit.kind == Kind::EncryptedDirectMessage
        || unit
            .tags
            .iter()
            .any(|tag| matches!(tag.as_slice(), [k, v, ..] if k == "encrypted" && v == "nip44"))
}

//! SentryStr - Decentralized error reporting over Nostr relays
//!
//! Turns structured application events into signed Nostr events and
//! publishes them to independent relays, optionally encrypted so only a
//! chosen recipient can read them.
//!
//! # Features
//!
//! - Sentry-style event model (message, level, tags, extras, user, request, exception)
//! - Deterministic canonical JSON payload
//! - Concurrent multi-relay fan-out with a configurable success policy
//! - NIP-44 encryption of every event for one recipient
//! - Level-gated NIP-17 (or NIP-04) direct-message copies
//! - `tracing` layer that captures application log events
//! - [`Collector`] that reads events back from relays with an [`EventFilter`]
//!
//! # Example
//!
//! ```rust,no_run
//! use sentrystr::{Client, Config, Event, Level};
//!
//! #[tokio::main]
//! async fn main() -> sentrystr::Result<()> {
//!     let config = Config::new(&std::env::var("SENTRYSTR_PRIVKEY").unwrap_or_default(), vec![
//!         "wss://relay.damus.io".into(),
//!         "wss://nos.lol".into(),
//!     ])?;
//!
//!     let mut client = Client::new(config);
//!     client.setup_direct_messaging("npub1...", Level::Warning)?;
//!
//!     client.capture_message("service started").await?;
//!
//!     let event = Event::new()
//!         .with_message("Payment declined")
//!         .with_level(Level::Error)
//!         .with_tag("service", "billing")
//!         .with_extra("amount_cents", 1299);
//!     client.capture_event(&event).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod collector;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod layer;
pub mod level;
pub mod payload;
pub mod publisher;
pub mod router;
pub mod transport;

pub use client::{CaptureReport, Client};
pub use collector::{CollectError, CollectedEvent, Collector, EventFilter};
pub use config::{
    Config, ConfigError, DirectMessagePolicy, DirectMessageProtocol, DEFAULT_RELAYS,
    DEFAULT_RELAY_TIMEOUT,
};
pub use crypto::{open_envelope, EncryptionError, OpenedEnvelope, NIP44_MAX_PLAINTEXT};
pub use error::{Result, SentryStrError};
pub use event::{Event, Exception, ExtraValue, FieldMap, Frame, Request, Stacktrace, User};
pub use layer::SentryStrLayer;
pub use level::{Level, LevelError};
pub use payload::{from_canonical_json, to_canonical_json, SerializationError};
pub use publisher::{PublishError, PublishPolicy, PublishReport, RelayOutcome, RelayStatus};
pub use router::MIRRORED_TAG_KEYS;
pub use transport::{
    MemoryTransport, RelayError, RelayFilter, RelayTransport, WebSocketTransport,
    KIND_ENCRYPTED_DM, KIND_EVENT, KIND_GIFT_WRAP,
};

//! Client configuration.
//!
//! A [`Config`] owns the signing key, the relay list, and the two
//! independent encryption settings:
//!
//! - **Config-level encryption** ([`Config::with_encryption`]): every primary
//!   event is NIP-44 encrypted for one recipient.
//! - **Direct-message policy** ([`Config::with_direct_messaging`]): events at
//!   or above a minimum level are additionally sent as a DM.

use nostr::nips::nip19::FromBech32;
use nostr::{Keys, PublicKey, SecretKey};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::crypto;
use crate::level::Level;
use crate::publisher::PublishPolicy;
use crate::transport::KIND_EVENT;

/// Default per-relay publish timeout.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default relays used by the CLI.
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid signing key: {0}")]
    InvalidSigningKey(String),

    #[error("At least one relay is required")]
    NoRelays,

    #[error("Relay address must not be blank")]
    BlankRelay,

    #[error("Invalid recipient key: {0}")]
    InvalidRecipient(String),

    #[error("Direct messaging is not configured")]
    DirectMessagingNotConfigured,
}

/// How direct messages are enveloped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectMessageProtocol {
    /// NIP-17 private message, sealed and gift-wrapped (kind 1059).
    #[default]
    Nip17,
    /// Legacy NIP-04 encrypted DM (kind 4).
    Nip04,
}

/// Recipient and threshold for direct-message copies of events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessagePolicy {
    pub recipient: PublicKey,
    pub min_level: Level,
    pub protocol: DirectMessageProtocol,
}

impl DirectMessagePolicy {
    /// Creates a policy with the default `warning` threshold and NIP-17.
    pub fn new(recipient: PublicKey) -> Self {
        Self {
            recipient,
            min_level: Level::Warning,
            protocol: DirectMessageProtocol::default(),
        }
    }

    /// Sets the lowest level that triggers a DM copy.
    pub fn with_min_level(mut self, min_level: Level) -> Self {
        self.min_level = min_level;
        self
    }

    pub fn with_protocol(mut self, protocol: DirectMessageProtocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Parses a signing key given as `nsec` bech32 or 64-char hex.
pub fn parse_signing_key(input: &str) -> Result<SecretKey, ConfigError> {
    let input = input.trim();
    if input.starts_with("nsec") {
        SecretKey::from_bech32(input).map_err(|e| ConfigError::InvalidSigningKey(e.to_string()))
    } else {
        SecretKey::from_hex(input).map_err(|e| ConfigError::InvalidSigningKey(e.to_string()))
    }
}

/// Checks that `relays` is non-empty and has no blank entries.
pub(crate) fn validate_relays(relays: &[String]) -> Result<(), ConfigError> {
    if relays.is_empty() {
        return Err(ConfigError::NoRelays);
    }
    if relays.iter().any(|r| r.trim().is_empty()) {
        return Err(ConfigError::BlankRelay);
    }
    Ok(())
}

/// Configuration bound to one [`Client`](crate::Client).
///
/// The signing key never leaves the config; only the derived public key is
/// exposed.
pub struct Config {
    keys: Keys,
    relays: Vec<String>,
    encryption: Option<PublicKey>,
    direct_message: Option<DirectMessagePolicy>,
    publish_policy: PublishPolicy,
    relay_timeout: Duration,
    event_kind: u16,
}

impl Config {
    /// Creates a config from a signing key and a non-empty relay list.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidSigningKey`] if the key is not a valid secp256k1 scalar
    /// - [`ConfigError::NoRelays`] if `relays` is empty
    /// - [`ConfigError::BlankRelay`] if any relay address is blank
    ///
    /// # Example
    ///
    /// ```
    /// use sentrystr::Config;
    ///
    /// let key = "1".repeat(64);
    /// let config = Config::new(&key, vec!["wss://relay.damus.io".into()]).unwrap();
    /// assert_eq!(config.relays().len(), 1);
    ///
    /// assert!(Config::new(&key, vec![]).is_err());
    /// ```
    pub fn new(signing_key: &str, relays: Vec<String>) -> Result<Self, ConfigError> {
        let secret = parse_signing_key(signing_key)?;
        validate_relays(&relays)?;

        Ok(Self {
            keys: Keys::new(secret),
            relays,
            encryption: None,
            direct_message: None,
            publish_policy: PublishPolicy::default(),
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            event_kind: KIND_EVENT,
        })
    }

    /// Encrypts every primary event for `recipient` (`npub` or hex).
    pub fn with_encryption(mut self, recipient: &str) -> Result<Self, ConfigError> {
        let recipient = crypto::parse_recipient(recipient)
            .map_err(|e| ConfigError::InvalidRecipient(e.to_string()))?;
        self.encryption = Some(recipient);
        Ok(self)
    }

    /// Sends a DM copy of every event at or above `min_level` to `recipient`.
    ///
    /// Passing `None` keeps the default `warning` threshold.
    pub fn with_direct_messaging(
        self,
        recipient: &str,
        min_level: impl Into<Option<Level>>,
    ) -> Result<Self, ConfigError> {
        let recipient = crypto::parse_recipient(recipient)
            .map_err(|e| ConfigError::InvalidRecipient(e.to_string()))?;
        let mut policy = DirectMessagePolicy::new(recipient);
        if let Some(min_level) = min_level.into() {
            policy = policy.with_min_level(min_level);
        }
        Ok(self.with_direct_message_policy(policy))
    }

    /// Replaces the direct-message policy.
    pub fn with_direct_message_policy(mut self, policy: DirectMessagePolicy) -> Self {
        self.direct_message = Some(policy);
        self
    }

    /// Sets how many relays must accept each unit. Defaults to
    /// [`PublishPolicy::AtLeastOne`].
    pub fn with_publish_policy(mut self, policy: PublishPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Sets the per-relay timeout (default [`DEFAULT_RELAY_TIMEOUT`]).
    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    /// Overrides the telemetry event kind (default 9898).
    pub fn with_event_kind(mut self, kind: u16) -> Self {
        self.event_kind = kind;
        self
    }

    /// Public key of the signing identity.
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Relays every unit is sent to, in configured order.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Recipient of config-level encryption, if enabled.
    pub fn encryption_recipient(&self) -> Option<&PublicKey> {
        self.encryption.as_ref()
    }

    pub fn direct_message_policy(&self) -> Option<&DirectMessagePolicy> {
        self.direct_message.as_ref()
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        self.publish_policy
    }

    /// Per-relay timeout for publishing and collecting.
    pub fn relay_timeout(&self) -> Duration {
        self.relay_timeout
    }

    pub fn event_kind(&self) -> u16 {
        self.event_kind
    }

    pub(crate) fn keys(&self) -> &Keys {
        &self.keys
    }

    pub(crate) fn set_direct_message_policy(&mut self, policy: DirectMessagePolicy) {
        self.direct_message = Some(policy);
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("public_key", &self.keys.public_key().to_hex())
            .field("relays", &self.relays)
            .field("encryption", &self.encryption.as_ref().map(PublicKey::to_hex))
            .field("direct_message", &self.direct_message)
            .field("publish_policy", &self.publish_policy)
            .field("relay_timeout", &self.relay_timeout)
            .field("event_kind", &self.event_kind)
            .finish()
    }
}

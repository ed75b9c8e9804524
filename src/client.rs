//! Client facade.
//!
//! A [`Client`] binds one [`Config`] to a [`Publisher`]. Every capture call is
//! independent: the event is serialized once and checked against the size
//! limits of every envelope it will travel in. Then the primary unit is built
//! and fanned out, and the direct-message copy is sent if the level gate
//! opens.

use nostr::PublicKey;

use crate::config::{Config, ConfigError, DirectMessagePolicy};
use crate::crypto;
use crate::error::{Result, SentryStrError};
use crate::event::{Event, Exception};
use crate::level::Level;
use crate::payload::to_canonical_json;
use crate::publisher::{PublishReport, Publisher};
use crate::router::{self, PrimaryRoute};
use crate::transport::{RelayTransport, WebSocketTransport};

/// Reports for the units published by one capture call.
#[derive(Debug)]
pub struct CaptureReport {
    pub primary: PublishReport,
    /// Present when the direct-message gate opened. A failed DM does not
    /// undo the primary publish, so it is reported here instead of raised.
    pub direct_message: Option<Result<PublishReport>>,
}

impl CaptureReport {
    /// Whether every attempted delivery met the publish policy.
    pub fn is_complete(&self) -> bool {
        !matches!(self.direct_message, Some(Err(_)))
    }
}

/// Telemetry client.
///
/// Capture methods take `&self`, so a client can be shared across tasks
/// behind an `Arc`. Only [`setup_direct_messaging`](Self::setup_direct_messaging)
/// needs exclusive access.
#[derive(Debug)]
pub struct Client<T = WebSocketTransport> {
    config: Config,
    publisher: Publisher<T>,
}

impl Client<WebSocketTransport> {
    /// Creates a client that publishes over WebSockets.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sentrystr::{Client, Config};
    ///
    /// # async fn run() -> sentrystr::Result<()> {
    /// let config = Config::new(&"1".repeat(64), vec!["wss://relay.damus.io".into()])?;
    /// let client = Client::new(config);
    /// client.capture_message("worker started").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: Config) -> Self {
        Self::with_transport(config, WebSocketTransport::new())
    }
}

impl<T: RelayTransport> Client<T> {
    /// Creates a client that publishes through `transport`.
    pub fn with_transport(config: Config, transport: T) -> Self {
        let publisher = Publisher::new(transport, config.publish_policy(), config.relay_timeout());
        Self { config, publisher }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.publisher.transport()
    }

    /// Sends a DM copy of every event at or above `min_level` to `recipient`.
    /// `None` uses the default `warning` threshold.
    ///
    /// Calling this again re-targets the policy; the last call wins.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::InvalidRecipient`](crate::EncryptionError::InvalidRecipient)
    /// if `recipient` is not a valid `npub` or hex public key. The previous
    /// policy, if any, is kept.
    ///
    /// # Example
    ///
    /// ```
    /// use sentrystr::{Client, Config, Level};
    ///
    /// let config = Config::new(&"1".repeat(64), vec!["wss://relay.damus.io".into()]).unwrap();
    /// let mut client = Client::new(config);
    /// let oncall = nostr::Keys::generate().public_key().to_hex();
    ///
    /// client.setup_direct_messaging(&oncall, None).unwrap();
    /// client.setup_direct_messaging(&oncall, Level::Error).unwrap();
    /// ```
    pub fn setup_direct_messaging(
        &mut self,
        recipient: &str,
        min_level: impl Into<Option<Level>>,
    ) -> Result<()> {
        let recipient = crypto::parse_recipient(recipient)?;
        let mut policy = DirectMessagePolicy::new(recipient);
        if let Some(min_level) = min_level.into() {
            policy = policy.with_min_level(min_level);
        }
        self.setup_direct_message_policy(policy);
        Ok(())
    }

    /// Installs a fully specified direct-message policy, replacing any
    /// previous one.
    pub fn setup_direct_message_policy(&mut self, policy: DirectMessagePolicy) {
        tracing::debug!(
            recipient = %policy.recipient,
            min_level = %policy.min_level,
            "direct messaging configured"
        );
        self.config.set_direct_message_policy(policy);
    }

    /// Publishes `event` and, when its level reaches the DM threshold, a
    /// direct-message copy of the same payload.
    ///
    /// The DM copy is attempted even if the primary publish failed. A DM
    /// failure after a successful primary publish is returned inside
    /// [`CaptureReport::direct_message`].
    ///
    /// # Errors
    ///
    /// - [`SentryStrError::Serialization`] before anything is sent, including
    ///   [`PayloadTooLarge`](crate::SerializationError::PayloadTooLarge) when the
    ///   payload does not fit an envelope the capture needs
    /// - [`SentryStrError::Encryption`] if the primary unit could not be built
    /// - [`SentryStrError::Publish`] if the primary unit missed the publish policy
    pub async fn capture_event(&self, event: &Event) -> Result<CaptureReport> {
        let payload = to_canonical_json(event)?;

        let route = router::primary_route(&self.config);
        let direct_message =
            router::direct_message_route(self.config.direct_message_policy(), event.level);

        router::check_primary_size(route, &payload)?;
        if let Some(policy) = direct_message {
            router::check_direct_message_size(policy, &payload)?;
        }
        tracing::debug!(
            event_id = %event.event_id,
            level = %event.level,
            encrypted = matches!(route, PrimaryRoute::Encrypted(_)),
            direct_message = direct_message.is_some(),
            "routing event"
        );

        let primary = self.publish_primary(route, &payload, event).await;
        let direct_message = match direct_message {
            Some(policy) => Some(self.publish_direct_message(policy, &payload).await),
            None => None,
        };

        if let Some(Err(e)) = &direct_message {
            tracing::error!(event_id = %event.event_id, error = %e, "direct message delivery failed");
        }

        Ok(CaptureReport {
            primary: primary?,
            direct_message,
        })
    }

    /// Captures `message` at `info`.
    pub async fn capture_message(&self, message: &str) -> Result<CaptureReport> {
        self.capture_event(&Event::new().with_message(message).with_level(Level::Info))
            .await
    }

    /// Captures `message` at `error`.
    pub async fn capture_error(&self, message: &str) -> Result<CaptureReport> {
        self.capture_event(&Event::new().with_message(message).with_level(Level::Error))
            .await
    }

    /// Captures `exception` at `error` with message `"<type>: <message>"`.
    pub async fn capture_exception(&self, exception: Exception) -> Result<CaptureReport> {
        let message = format!("{}: {}", exception.exception_type, exception.message);
        let event = Event::new()
            .with_message(message)
            .with_level(Level::Error)
            .with_exception(exception);
        self.capture_event(&event).await
    }

    /// Sends `text` verbatim to the direct-message recipient, without level
    /// gating.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DirectMessagingNotConfigured`] if no policy is
    /// set, and [`PayloadTooLarge`](crate::SerializationError::PayloadTooLarge)
    /// if `text` does not fit the policy's envelope.
    pub async fn send_direct_message(&self, text: &str) -> Result<PublishReport> {
        let policy = self
            .config
            .direct_message_policy()
            .ok_or(ConfigError::DirectMessagingNotConfigured)?;
        router::check_direct_message_size(policy, text)?;
        self.publish_direct_message(policy, text).await
    }

    /// Recipient of direct messages, if configured.
    pub fn direct_message_recipient(&self) -> Option<PublicKey> {
        self.config.direct_message_policy().map(|p| p.recipient)
    }

    async fn publish_primary(
        &self,
        route: PrimaryRoute,
        payload: &str,
        event: &Event,
    ) -> Result<PublishReport> {
        let unit = router::build_primary(
            self.config.keys(),
            self.config.event_kind(),
            route,
            payload,
            event,
        )?;
        Ok(self.publisher.publish(self.config.relays(), &unit).await?)
    }

    async fn publish_direct_message(
        &self,
        policy: &DirectMessagePolicy,
        payload: &str,
    ) -> Result<PublishReport> {
        let unit = router::build_direct_message(self.config.keys(), policy, payload).await?;
        self.publisher
            .publish(self.config.relays(), &unit)
            .await
            .map_err(SentryStrError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::open_envelope;
    use crate::event::{Frame, Stacktrace};
    use crate::payload::SerializationError;
    use crate::transport::{MemoryTransport, KIND_EVENT, KIND_GIFT_WRAP};
    use nostr::Keys;

    fn client_with(relays: &[&str]) -> (Client<MemoryTransport>, MemoryTransport) {
        let keys = Keys::generate();
        let config = Config::new(
            &keys.secret_key().to_secret_hex(),
            relays.iter().map(|r| r.to_string()).collect(),
        )
        .unwrap();
        let transport = MemoryTransport::new();
        (Client::with_transport(config, transport.clone()), transport)
    }

    #[tokio::test]
    async fn capture_message_publishes_one_plain_unit() {
        let (client, transport) = client_with(&["relayA"]);

        let report = client.capture_message("ok").await.unwrap();

        assert!(report.direct_message.is_none());
        let units = transport.sent_to("relayA").await;
        assert_eq!(units.len(), 1);
        assert!(units[0].content.starts_with(r#"{"message":"ok","level":"info","#));
        assert_eq!(units[0].pubkey, client.config().public_key());
    }

    #[tokio::test]
    async fn capture_error_sets_error_level() {
        let (client, transport) = client_with(&["relayA"]);

        client.capture_error("boom").await.unwrap();

        let units = transport.units().await;
        assert!(units[0].content.contains(r#""level":"error""#));
    }

    #[tokio::test]
    async fn capture_exception_builds_message_from_type() {
        let (client, transport) = client_with(&["relayA"]);
        let exception = Exception::new("ValueError", "bad input")
            .with_stacktrace(Stacktrace::new().with_frame(Frame::new("main.rs")));

        client.capture_exception(exception).await.unwrap();

        let content = &transport.units().await[0].content;
        assert!(content.starts_with(r#"{"message":"ValueError: bad input","level":"error""#));
        assert!(content.contains(r#""exception":{"type":"ValueError""#));
    }

    #[tokio::test]
    async fn serialization_failure_has_no_side_effects() {
        let (client, transport) = client_with(&["relayA"]);
        let event = Event::new().with_message("x").with_extra("ratio", f64::NAN);

        let err = client.capture_event(&event).await.unwrap_err();

        assert!(matches!(err, SentryStrError::Serialization(_)));
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn setup_direct_messaging_rejects_bad_recipient_and_keeps_policy() {
        let (mut client, _) = client_with(&["relayA"]);
        let target = Keys::generate().public_key();

        client.setup_direct_messaging(&target.to_hex(), Level::Warning).unwrap();
        let err = client
            .setup_direct_messaging("npub1garbage", Level::Debug)
            .unwrap_err();

        assert!(matches!(err, SentryStrError::Encryption(_)));
        assert_eq!(client.direct_message_recipient(), Some(target));
    }

    #[tokio::test]
    async fn send_direct_message_requires_policy() {
        let (client, transport) = client_with(&["relayA"]);

        let err = client.send_direct_message("hi").await.unwrap_err();

        assert!(matches!(
            err,
            SentryStrError::Config(ConfigError::DirectMessagingNotConfigured)
        ));
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn send_direct_message_skips_level_gate() {
        let (mut client, transport) = client_with(&["relayA"]);
        let target = Keys::generate();
        client
            .setup_direct_messaging(&target.public_key().to_hex(), Level::Fatal)
            .unwrap();

        client.send_direct_message("raw text").await.unwrap();

        let units = transport.units().await;
        assert_eq!(units.len(), 1);
        assert_eq!(open_envelope(&target, &units[0]).unwrap().plaintext, "raw text");
    }

    #[tokio::test]
    async fn primary_failure_still_attempts_direct_message() {
        let (mut client, transport) = client_with(&["relayA"]);
        let target = Keys::generate();
        client
            .setup_direct_messaging(&target.public_key().to_hex(), Level::Warning)
            .unwrap();
        transport.reject_relay("relayA", "read-only").await;

        let err = client.capture_error("boom").await.unwrap_err();

        match err {
            SentryStrError::Publish(e) => assert_eq!(e.accepted, 0),
            other => panic!("unexpected error: {other:?}"),
        }
        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].1.kind.as_u16(), KIND_GIFT_WRAP);
    }

    #[tokio::test]
    async fn direct_message_failure_keeps_primary_report() {
        let (mut client, transport) = client_with(&["relayA"]);
        client
            .setup_direct_messaging(&Keys::generate().public_key().to_hex(), Level::Warning)
            .unwrap();
        transport.reject_kind(KIND_GIFT_WRAP, "no DMs").await;

        let report = client.capture_error("boom").await.unwrap();

        assert_eq!(report.primary.accepted(), 1);
        assert!(!report.is_complete());
        match report.direct_message {
            Some(Err(SentryStrError::Publish(e))) => assert_eq!(e.accepted, 0),
            other => panic!("unexpected DM result: {other:?}"),
        }
        let sent = transport.units().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind.as_u16(), KIND_EVENT);
    }

    #[tokio::test]
    async fn delivered_direct_message_completes_report() {
        let (mut client, _) = client_with(&["relayA"]);
        client
            .setup_direct_messaging(&Keys::generate().public_key().to_hex(), None)
            .unwrap();

        let quiet = client.capture_message("fine").await.unwrap();
        let loud = client.capture_error("boom").await.unwrap();

        assert!(quiet.direct_message.is_none());
        assert!(quiet.is_complete());
        assert!(matches!(loud.direct_message, Some(Ok(ref dm)) if dm.accepted() == 1));
        assert!(loud.is_complete());
    }

    #[tokio::test]
    async fn setup_without_level_uses_warning_threshold() {
        let (mut client, _) = client_with(&["relayA"]);
        let target = Keys::generate().public_key();

        client.setup_direct_messaging(&target.to_hex(), None).unwrap();

        let policy = client.config().direct_message_policy().unwrap();
        assert_eq!(policy.recipient, target);
        assert_eq!(policy.min_level, Level::Warning);
    }

    #[tokio::test]
    async fn oversized_encrypted_event_fails_before_sending() {
        let keys = Keys::generate();
        let config = Config::new(&keys.secret_key().to_secret_hex(), vec!["relayA".into()])
            .unwrap()
            .with_encryption(&Keys::generate().public_key().to_hex())
            .unwrap();
        let transport = MemoryTransport::new();
        let client = Client::with_transport(config, transport.clone());
        let event = Event::new()
            .with_message("dump")
            .with_extra("blob", "x".repeat(70 * 1024));

        let err = client.capture_event(&event).await.unwrap_err();

        assert!(matches!(
            err,
            SentryStrError::Serialization(SerializationError::PayloadTooLarge { .. })
        ));
        assert!(transport.attempts().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_direct_message_copy_fails_before_primary() {
        let (mut client, transport) = client_with(&["relayA"]);
        client
            .setup_direct_messaging(&Keys::generate().public_key().to_hex(), Level::Warning)
            .unwrap();
        let event = Event::new()
            .with_message("dump")
            .with_level(Level::Error)
            .with_extra("blob", "x".repeat(50 * 1024));

        let err = client.capture_event(&event).await.unwrap_err();

        assert!(matches!(
            err,
            SentryStrError::Serialization(SerializationError::PayloadTooLarge { ref envelope, .. })
                if *envelope == "NIP-17 gift wrap"
        ));
        assert!(transport.attempts().await.is_empty());

        let err = client.send_direct_message(&"x".repeat(50 * 1024)).await.unwrap_err();
        assert!(matches!(
            err,
            SentryStrError::Serialization(SerializationError::PayloadTooLarge { .. })
        ));
        assert!(transport.attempts().await.is_empty());
    }
}

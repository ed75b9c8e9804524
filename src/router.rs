//! Delivery routing.
//!
//! Two independent decisions are made for every captured event:
//!
//! 1. [`primary_route`]: the primary copy is public, or NIP-44 encrypted when
//!    the config names an encryption recipient.
//! 2. [`direct_message_route`]: a second copy goes to the direct-message
//!    recipient when the event level reaches the policy threshold, whatever
//!    the primary route was.
//!
//! Both copies carry the same canonical payload. Size checks run before
//! either copy is built, so an oversized payload fails before anything is
//! published.

use nostr::{Event as NostrEvent, EventBuilder, Keys, Kind, PublicKey, Tag, TagKind};

use crate::config::{Config, DirectMessagePolicy, DirectMessageProtocol};
use crate::crypto::{self, EncryptionError, NIP44_MAX_PLAINTEXT};
use crate::event::Event;
use crate::level::Level;
use crate::payload::SerializationError;

/// Destination of the primary copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryRoute {
    /// Canonical JSON in the clear.
    Public,
    /// NIP-44 ciphertext for one recipient.
    Encrypted(PublicKey),
}

pub fn primary_route(config: &Config) -> PrimaryRoute {
    match config.encryption_recipient() {
        Some(recipient) => PrimaryRoute::Encrypted(*recipient),
        None => PrimaryRoute::Public,
    }
}

/// Event tag keys mirrored as relay-visible tags on public units.
///
/// These are the keys collectors filter on. Anything else stays inside the
/// payload, so protocol tags such as `expiration` or `nonce` never reach
/// the signed unit.
pub const MIRRORED_TAG_KEYS: [&str; 4] = ["service", "env", "component", "severity"];

/// Fixed JSON around the content of a kind 14 rumor, id included.
const RUMOR_OVERHEAD: usize = 320;
/// Fixed JSON around the content of a signed kind 13 seal.
const SEAL_OVERHEAD: usize = 512;

/// Returns the policy when `level` reaches its threshold.
pub fn direct_message_route(
    policy: Option<&DirectMessagePolicy>,
    level: Level,
) -> Option<&DirectMessagePolicy> {
    policy.filter(|p| level >= p.min_level)
}

fn custom_tag(key: &str, value: &str) -> Tag {
    Tag::custom(TagKind::custom(key.to_string()), [value.to_string()])
}

fn sign(builder: EventBuilder, keys: &Keys) -> Result<NostrEvent, EncryptionError> {
    builder
        .sign_with_keys(keys)
        .map_err(|e| EncryptionError::Envelope(e.to_string()))
}

fn too_large(envelope: &'static str, size: usize, limit: usize) -> SerializationError {
    SerializationError::PayloadTooLarge {
        envelope,
        size,
        limit,
    }
}

/// Fails when `payload` cannot be carried by the primary route.
pub fn check_primary_size(route: PrimaryRoute, payload: &str) -> Result<(), SerializationError> {
    match route {
        PrimaryRoute::Public => Ok(()),
        PrimaryRoute::Encrypted(_) if payload.len() <= NIP44_MAX_PLAINTEXT => Ok(()),
        PrimaryRoute::Encrypted(_) => Err(too_large(
            "NIP-44 encrypted unit",
            payload.len(),
            NIP44_MAX_PLAINTEXT,
        )),
    }
}

fn gift_wrap_fits(rumor_len: usize) -> bool {
    rumor_len <= NIP44_MAX_PLAINTEXT
        && crypto::nip44_encoded_len(rumor_len) + SEAL_OVERHEAD <= NIP44_MAX_PLAINTEXT
}

fn largest_wrappable_rumor() -> usize {
    let (mut low, mut high) = (0, NIP44_MAX_PLAINTEXT);
    while low < high {
        let mid = (low + high + 1) / 2;
        if gift_wrap_fits(mid) {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    low
}

/// Fails when `payload` cannot be carried by the policy's envelope.
///
/// A gift wrap encrypts twice: the rumor into the seal, then the seal into
/// the wrap. Both plaintexts must stay within the NIP-44 limit.
pub fn check_direct_message_size(
    policy: &DirectMessagePolicy,
    payload: &str,
) -> Result<(), SerializationError> {
    match policy.protocol {
        DirectMessageProtocol::Nip04 => Ok(()),
        DirectMessageProtocol::Nip17 => {
            // Rumor content is the JSON-escaped payload.
            let escaped = serde_json::to_string(payload)?.len();
            if gift_wrap_fits(escaped + RUMOR_OVERHEAD) {
                return Ok(());
            }
            let escaping = escaped - payload.len();
            let limit = largest_wrappable_rumor().saturating_sub(RUMOR_OVERHEAD + escaping);
            Err(too_large("NIP-17 gift wrap", payload.len(), limit))
        }
    }
}

/// Builds and signs the primary unit for `event`.
///
/// Public units mirror the level and the [`MIRRORED_TAG_KEYS`] event tags as
/// relay-visible tags. Encrypted units only carry the recipient.
pub fn build_primary(
    keys: &Keys,
    kind: u16,
    route: PrimaryRoute,
    payload: &str,
    event: &Event,
) -> Result<NostrEvent, EncryptionError> {
    let builder = match route {
        PrimaryRoute::Public => {
            let mut tags = vec![custom_tag("level", event.level.as_str())];
            tags.extend(
                event
                    .tags
                    .iter()
                    .filter(|(key, _)| MIRRORED_TAG_KEYS.contains(key))
                    .map(|(key, value)| custom_tag(key, value)),
            );
            EventBuilder::new(Kind::from(kind), payload).tags(tags)
        }
        PrimaryRoute::Encrypted(recipient) => {
            let ciphertext = crypto::encrypt_nip44(keys, &recipient, payload)?;
            EventBuilder::new(Kind::from(kind), ciphertext).tags([
                Tag::public_key(recipient),
                custom_tag("encrypted", "nip44"),
            ])
        }
    };

    sign(builder, keys)
}

/// Builds the direct-message unit carrying `payload` to the policy recipient.
pub async fn build_direct_message(
    keys: &Keys,
    policy: &DirectMessagePolicy,
    payload: &str,
) -> Result<NostrEvent, EncryptionError> {
    match policy.protocol {
        DirectMessageProtocol::Nip17 => {
            let rumor = EventBuilder::new(Kind::PrivateDirectMessage, payload)
                .tag(Tag::public_key(policy.recipient))
                .build(keys.public_key());

            EventBuilder::gift_wrap(keys, &policy.recipient, rumor, std::iter::empty())
                .await
                .map_err(|e| EncryptionError::Envelope(e.to_string()))
        }
        DirectMessageProtocol::Nip04 => {
            let ciphertext = crypto::encrypt_nip04(keys, &policy.recipient, payload)?;
            sign(
                EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
                    .tag(Tag::public_key(policy.recipient)),
                keys,
            )
        }
    }
}

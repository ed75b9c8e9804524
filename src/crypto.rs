//! Payload encryption and envelope opening.
//!
//! | Use | Scheme | Wire kind |
//! |-----|--------|-----------|
//! | Config-level encryption | NIP-44 v2, sender → recipient | telemetry kind (9898) |
//! | Direct message (default) | NIP-17 gift wrap (NIP-59 + NIP-44) | 1059 |
//! | Direct message (legacy) | NIP-04 | 4 |
//!
//! Only the holder of the recipient's secret key can recover the plaintext.
//! The sender's public key stays visible on NIP-44 and NIP-04 units; the gift
//! wrap hides it behind an ephemeral key.

use nostr::nips::{nip04, nip44};
use nostr::nips::nip19::FromBech32;
use nostr::{Event as NostrEvent, Keys, Kind, PublicKey};
use serde::Deserialize;
use thiserror::Error;

/// Encryption errors.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Invalid recipient key: {0}")]
    InvalidRecipient(String),

    #[error("NIP-44 encryption failed: {0}")]
    Nip44(#[from] nip44::Error),

    #[error("NIP-04 encryption failed: {0}")]
    Nip04(#[from] nip04::Error),

    #[error("Failed to build signed envelope: {0}")]
    Envelope(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

/// Largest plaintext NIP-44 v2 accepts.
pub const NIP44_MAX_PLAINTEXT: usize = 65_535;

fn nip44_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

/// Length of the base64 NIP-44 v2 payload produced for `len` plaintext bytes.
pub fn nip44_encoded_len(len: usize) -> usize {
    // version, nonce, length prefix, padded plaintext, mac
    let raw = 1 + 32 + 2 + nip44_padded_len(len) + 32;
    raw.div_ceil(3) * 4
}

/// Parses a recipient public key given as `npub` bech32 or 64-char hex.
pub fn parse_recipient(input: &str) -> Result<PublicKey, EncryptionError> {
    let input = input.trim();
    let parsed = if input.starts_with("npub") {
        PublicKey::from_bech32(input).map_err(|e| e.to_string())
    } else {
        PublicKey::from_hex(input).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| EncryptionError::InvalidRecipient(format!("{input:?}: {e}")))
}

/// Encrypts a payload for `recipient` with NIP-44 v2.
pub fn encrypt_nip44(
    sender: &Keys,
    recipient: &PublicKey,
    plaintext: &str,
) -> Result<String, EncryptionError> {
    Ok(nip44::encrypt(
        sender.secret_key(),
        recipient,
        plaintext,
        nip44::Version::V2,
    )?)
}

/// Encrypts a payload for `recipient` with NIP-04.
pub fn encrypt_nip04(
    sender: &Keys,
    recipient: &PublicKey,
    plaintext: &str,
) -> Result<String, EncryptionError> {
    Ok(nip04::encrypt(sender.secret_key(), recipient, plaintext)?)
}

/// Unsigned inner event of a gift wrap.
#[derive(Debug, Deserialize)]
struct Rumor {
    pubkey: String,
    content: String,
}

/// Plaintext recovered from an encrypted unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEnvelope {
    /// Hex public key of the real author (from the seal for gift wraps).
    pub author: String,
    pub plaintext: String,
}

/// Recovers the plaintext of an encrypted unit addressed to `recipient`.
///
/// Handles gift wraps (kind 1059), NIP-04 messages (kind 4), and treats any
/// other kind as NIP-44 content encrypted by the event's author.
pub fn open_envelope(
    recipient: &Keys,
    event: &NostrEvent,
) -> Result<OpenedEnvelope, EncryptionError> {
    if event.kind == Kind::GiftWrap {
        // Gift wrap -> seal
        let seal_json = nip44::decrypt(recipient.secret_key(), &event.pubkey, &event.content)?;
        let seal: NostrEvent = serde_json::from_str(&seal_json)?;

        // Seal -> rumor (unsigned, so parse as Rumor not Event)
        let rumor_json = nip44::decrypt(recipient.secret_key(), &seal.pubkey, &seal.content)?;
        let rumor: Rumor = serde_json::from_str(&rumor_json)?;

        return Ok(OpenedEnvelope {
            author: rumor.pubkey,
            plaintext: rumor.content,
        });
    }

    let plaintext = if event.kind == Kind::EncryptedDirectMessage {
        nip04::decrypt(recipient.secret_key(), &event.pubkey, &event.content)?
    } else {
        nip44::decrypt(recipient.secret_key(), &event.pubkey, &event.content)?
    };

    Ok(OpenedEnvelope {
        author: event.pubkey.to_hex(),
        plaintext,
    })
}

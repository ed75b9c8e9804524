//! Canonical JSON payload for events.
//!
//! The canonical form is the plaintext of every delivery mode. Encryption
//! wraps these exact bytes.
//!
//! ```text
//! {"message":..,"level":..,"tags":{..},"extras":{..},"user"?,"request"?,
//!  "exception"?:{"type":..,"message":..,"stacktrace":[{filename,function?,lineno?},..]},
//!  "event_id":..,"timestamp":..,"platform":..,...}
//! ```

use thiserror::Error;

use crate::event::Event;

/// Serialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Unsupported value for '{key}': {reason}")]
    UnsupportedValue { key: String, reason: String },

    #[error("JSON serialization failed: {0}")]
    JsonFailed(#[from] serde_json::Error),

    #[error("Payload of {size} bytes does not fit a {envelope} (limit {limit} bytes)")]
    PayloadTooLarge {
        envelope: &'static str,
        size: usize,
        limit: usize,
    },
}

impl SerializationError {
    /// Attaches the extra's key to a value error raised before the key was known.
    pub(crate) fn for_key(self, key: &str) -> Self {
        match self {
            Self::UnsupportedValue { reason, .. } => Self::UnsupportedValue {
                key: key.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Checks that every extra has a faithful JSON representation.
pub fn validate(event: &Event) -> Result<(), SerializationError> {
    for (key, value) in event.extras.iter() {
        value.validate(key)?;
    }
    Ok(())
}

/// Serializes an event to its canonical JSON string.
///
/// # Example
///
/// ```
/// use sentrystr::{payload, Event};
///
/// let json = payload::to_canonical_json(&Event::new().with_message("ok")).unwrap();
/// assert!(json.starts_with(r#"{"message":"ok","level":"info","#));
/// ```
pub fn to_canonical_json(event: &Event) -> Result<String, SerializationError> {
    validate(event)?;
    Ok(serde_json::to_string(event)?)
}

/// Parses a canonical JSON payload back into an event.
pub fn from_canonical_json(json: &str) -> Result<Event, SerializationError> {
    Ok(serde_json::from_str(json)?)
}

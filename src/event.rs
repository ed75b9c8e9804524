//! Telemetry event model.
//!
//! An [`Event`] is built fully in memory with chained `with_*` calls and then
//! handed to a capture operation on the [`Client`](crate::Client). Building
//! never performs I/O.
//!
//! ```
//! use sentrystr::{Event, Exception, Frame, Level, Stacktrace};
//!
//! let stacktrace = Stacktrace::new()
//!     .with_frame(Frame::new("main.rs").with_function("main").with_lineno(12))
//!     .with_frame(Frame::new("db.rs").with_function("query").with_lineno(88));
//!
//! let event = Event::new()
//!     .with_message("Database query failed")
//!     .with_level(Level::Error)
//!     .with_tag("component", "db")
//!     .with_extra("retries", 3)
//!     .with_exception(Exception::new("QueryError", "timeout").with_stacktrace(stacktrace));
//!
//! assert_eq!(event.level, Level::Error);
//! ```

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

use crate::level::Level;
use crate::payload::SerializationError;

/// Platform reported when none is set explicitly.
pub const DEFAULT_PLATFORM: &str = "rust";

/// Insertion-ordered string-keyed map.
///
/// Re-inserting an existing key overwrites the value but keeps the key's
/// original position (last write wins, first position kept).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> FieldMap<V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts a value, returning the previous value for the key if any.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Looks up `key`. Linear in the number of entries, which stays small
    /// for tags and extras.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<V> Default for FieldMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for FieldMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<V: Serialize> Serialize for FieldMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct FieldMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for FieldMapVisitor<V> {
    type Value = FieldMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map with string keys")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = FieldMap::new();
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for FieldMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FieldMapVisitor(PhantomData))
    }
}

/// Value of an event extra.
///
/// Lists hold scalars only; a nested list is rejected when the event is
/// serialized.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub enum ExtraValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ExtraValue>),
}

impl ExtraValue {
    /// Checks that the value has a JSON representation that parses back
    /// to the same variant.
    pub(crate) fn validate(&self, key: &str) -> Result<(), SerializationError> {
        match self {
            Self::Float(f) if !f.is_finite() => Err(SerializationError::UnsupportedValue {
                key: key.to_string(),
                reason: format!("non-finite float {f}"),
            }),
            Self::List(items) => {
                for item in items {
                    if matches!(item, Self::List(_)) {
                        return Err(SerializationError::UnsupportedValue {
                            key: key.to_string(),
                            reason: "nested list".into(),
                        });
                    }
                    item.validate(key)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Serialize for ExtraValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::List(items) => items.serialize(serializer),
        }
    }
}

impl TryFrom<serde_json::Value> for ExtraValue {
    type Error = SerializationError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::String(s) => Ok(Self::String(s)),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Integer(i)),
                None => n.as_f64().map(Self::Float).ok_or_else(|| {
                    SerializationError::UnsupportedValue {
                        key: String::new(),
                        reason: format!("number {n} out of range"),
                    }
                }),
            },
            Value::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Array(_) => Err(SerializationError::UnsupportedValue {
                            key: String::new(),
                            reason: "nested list".into(),
                        }),
                        other => ExtraValue::try_from(other),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::List(items))
            }
            Value::Null => Err(SerializationError::UnsupportedValue {
                key: String::new(),
                reason: "null".into(),
            }),
            Value::Object(_) => Err(SerializationError::UnsupportedValue {
                key: String::new(),
                reason: "object".into(),
            }),
        }
    }
}

impl From<&str> for ExtraValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ExtraValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ExtraValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for ExtraValue {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for ExtraValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ExtraValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<ExtraValue>> From<Vec<T>> for ExtraValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// One stack location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Source file path as reported by the runtime.
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// 1-based line number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
}

impl Frame {
    /// Creates a frame with only a file name; function and line are optional.
    ///
    /// ```
    /// use sentrystr::Frame;
    ///
    /// let frame = Frame::new("src/db.rs").with_function("connect").with_lineno(42);
    /// assert_eq!(frame.lineno, Some(42));
    /// ```
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            function: None,
            lineno: None,
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_lineno(mut self, lineno: u32) -> Self {
        self.lineno = Some(lineno);
        self
    }
}

/// Ordered frames, root call site first and failing frame last.
///
/// Order is kept exactly as supplied.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stacktrace {
    frames: Vec<Frame>,
}

impl Stacktrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps frames already ordered root first.
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Appends a frame below the current deepest frame.
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    /// Frames in the order they were supplied.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

/// An exception with an optional stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(rename = "type")]
    pub exception_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Stacktrace>,
}

impl Exception {
    /// Creates an exception from its type name (e.g. `"ValueError"`) and message.
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: Stacktrace) -> Self {
        self.stacktrace = Some(stacktrace);
        self
    }
}

/// The user affected by an event. Any subset of fields may be set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    /// Application-level user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl User {
    /// Creates a user with no fields set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Stored as given; no address validation happens.
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// HTTP request in flight when the event was captured. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// HTTP method, e.g. `GET`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Raw query string without the leading `?`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,
}

impl Request {
    /// Creates a request with no fields set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_query_string(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = Some(query_string.into());
        self
    }
}

/// A unit of telemetry.
///
/// Field order here is the key order of the canonical JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub level: Level,

    /// String tags, in insertion order.
    #[serde(default)]
    pub tags: FieldMap<String>,

    /// Typed extra data, in insertion order.
    #[serde(default)]
    pub extras: FieldMap<ExtraValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Exception>,

    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

impl Event {
    /// Creates an empty `info` event with a fresh id and the current time.
    pub fn new() -> Self {
        Self {
            message: None,
            level: Level::Info,
            tags: FieldMap::new(),
            extras: FieldMap::new(),
            user: None,
            request: None,
            exception: None,
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            platform: default_platform(),
            logger: None,
            transaction: None,
            server_name: None,
            release: None,
            environment: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets a tag. An existing key keeps its position and takes the new value.
    ///
    /// Tags always travel in the payload. Keys listed in
    /// [`MIRRORED_TAG_KEYS`](crate::MIRRORED_TAG_KEYS) are also visible to
    /// relays on public units.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value.into());
        self
    }

    /// Same as [`with_tag`](Self::with_tag).
    pub fn add_tag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_tag(key, value)
    }

    /// Sets an extra. An existing key keeps its position and takes the new value.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<ExtraValue>) -> Self {
        self.extras.insert(key, value.into());
        self
    }

    /// Same as [`with_extra`](Self::with_extra).
    pub fn add_extra(self, key: impl Into<String>, value: impl Into<ExtraValue>) -> Self {
        self.with_extra(key, value)
    }

    /// Sets an extra from an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::UnsupportedValue`] for `null`, objects,
    /// and nested arrays.
    pub fn try_with_extra(
        self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, SerializationError> {
        let key = key.into();
        let value = ExtraValue::try_from(value).map_err(|e| e.for_key(&key))?;
        Ok(self.with_extra(key, value))
    }

    /// Attaches the affected user, replacing any previous one.
    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    /// Attaches an exception, replacing any previous one.
    pub fn with_exception(mut self, exception: Exception) -> Self {
        self.exception = Some(exception);
        self
    }

    /// Overrides the platform (default [`DEFAULT_PLATFORM`]).
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Name of the logger or tracing target that produced the event.
    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

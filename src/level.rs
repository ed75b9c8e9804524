//! Event severity levels.
//!
//! Levels form a total order used by the direct-message router:
//!
//! ```text
//! debug < info < warning < error < fatal
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unrecognized level name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid level '{0}' (expected one of: debug, info, warning, error, fatal)")]
pub struct LevelError(pub String);

/// Severity of an [`Event`](crate::Event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    /// All levels in ascending order.
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warning,
        Level::Error,
        Level::Fatal,
    ];

    /// Parses a level name. Case-sensitive.
    ///
    /// # Example
    ///
    /// ```
    /// use sentrystr::Level;
    ///
    /// assert_eq!(Level::new("warning").unwrap(), Level::Warning);
    /// assert!(Level::new("WARNING").is_err());
    /// ```
    pub fn new(name: &str) -> Result<Self, LevelError> {
        name.parse()
    }

    /// Returns the wire name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl FromStr for Level {
    type Err = LevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(LevelError(other.to_string())),
        }
    }
}

impl TryFrom<&str> for Level {
    type Error = LevelError;

    fn try_from(value: &str) -> Result<Self, LevelError> {
        value.parse()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a `tracing` level onto the event level scale.
///
/// `tracing` has no fatal level, and TRACE folds into debug.
impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warning,
            _ => Self::Error,
        }
    }
}

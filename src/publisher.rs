//! Concurrent relay fan-out.
//!
//! A signed unit is sent to every configured relay at once, each attempt
//! under its own timeout. The call returns after all attempts have settled,
//! then applies the [`PublishPolicy`].
//!
//! A timed-out attempt is abandoned; nothing already delivered to other
//! relays is retracted.

use futures_util::future::join_all;
use nostr::{Event as NostrEvent, EventId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::transport::{RelayError, RelayTransport};

/// How many relays must accept a unit for the publish to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// At least one relay accepted.
    #[default]
    AtLeastOne,
    /// Every relay accepted.
    All,
}

impl PublishPolicy {
    /// Whether `accepted` out of `attempted` relays meets this policy.
    pub fn is_satisfied(&self, accepted: usize, attempted: usize) -> bool {
        match self {
            Self::AtLeastOne => accepted >= 1,
            Self::All => attempted > 0 && accepted == attempted,
        }
    }
}

/// Result of one relay attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Accepted,
    Rejected(String),
    Failed(String),
    TimedOut,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Rejected(reason) => write!(f, "rejected ({reason})"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Status of one relay for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub relay: String,
    pub status: RelayStatus,
}

/// Per-relay outcomes for one published unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: EventId,
    pub outcomes: Vec<RelayOutcome>,
}

impl PublishReport {
    /// Number of relays that accepted the unit.
    pub fn accepted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == RelayStatus::Accepted)
            .count()
    }

    /// Outcomes other than `Accepted`.
    pub fn failures(&self) -> impl Iterator<Item = &RelayOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status != RelayStatus::Accepted)
    }
}

/// The publish policy was not met.
#[derive(Debug, Error)]
#[error("Event {event_id} accepted by {accepted}/{attempted} relays ({policy:?} required): {summary}")]
pub struct PublishError {
    pub event_id: EventId,
    pub policy: PublishPolicy,
    pub accepted: usize,
    pub attempted: usize,
    pub summary: String,
    pub report: PublishReport,
}

impl PublishError {
    fn new(policy: PublishPolicy, report: PublishReport) -> Self {
        let summary = report
            .failures()
            .map(|o| format!("{}: {}", o.relay, o.status))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            event_id: report.event_id,
            policy,
            accepted: report.accepted(),
            attempted: report.outcomes.len(),
            summary,
            report,
        }
    }
}

/// Fans signed units out to relays.
#[derive(Debug)]
pub struct Publisher<T> {
    transport: T,
    policy: PublishPolicy,
    relay_timeout: Duration,
}

impl<T: RelayTransport> Publisher<T> {
    pub fn new(transport: T, policy: PublishPolicy, relay_timeout: Duration) -> Self {
        Self {
            transport,
            policy,
            relay_timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn attempt(&self, relay: &str, event: &NostrEvent) -> RelayOutcome {
        let status = match tokio::time::timeout(
            self.relay_timeout,
            self.transport.send_event(relay, event),
        )
        .await
        {
            Ok(Ok(())) => RelayStatus::Accepted,
            Ok(Err(RelayError::Rejected(reason))) => RelayStatus::Rejected(reason),
            Ok(Err(e)) => RelayStatus::Failed(e.to_string()),
            Err(_) => RelayStatus::TimedOut,
        };

        tracing::debug!(relay, event_id = %event.id, %status, "relay attempt settled");
        RelayOutcome {
            relay: relay.to_string(),
            status,
        }
    }

    /// Sends `event` to every relay and evaluates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when too few relays accepted. Partial failures
    /// within the policy are logged and reported in the returned
    /// [`PublishReport`].
    pub async fn publish(
        &self,
        relays: &[String],
        event: &NostrEvent,
    ) -> Result<PublishReport, PublishError> {
        let outcomes = join_all(relays.iter().map(|relay| self.attempt(relay, event))).await;
        let report = PublishReport {
            event_id: event.id,
            outcomes,
        };

        let accepted = report.accepted();
        if !self.policy.is_satisfied(accepted, report.outcomes.len()) {
            let err = PublishError::new(self.policy, report);
            tracing::error!(error = %err, "publish failed");
            return Err(err);
        }

        for failure in report.failures() {
            tracing::warn!(
                relay = %failure.relay,
                event_id = %report.event_id,
                status = %failure.status,
                "relay did not accept event"
            );
        }

        Ok(report)
    }
}

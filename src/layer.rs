//! `tracing` integration.
//!
//! [`SentryStrLayer`] turns application tracing events into captured
//! [`Event`]s. Captures run on the ambient Tokio runtime; events emitted
//! outside a runtime are dropped.
//!
//! ```no_run
//! use sentrystr::{Client, Config, SentryStrLayer};
//! use tracing_subscriber::prelude::*;
//!
//! # fn run() -> sentrystr::Result<()> {
//! let config = Config::new(&"1".repeat(64), vec!["wss://relay.damus.io".into()])?;
//! let layer = SentryStrLayer::new(Client::new(config)).with_min_level(tracing::Level::WARN);
//!
//! tracing_subscriber::registry().with(layer).init();
//! tracing::error!(order_id = 42, "payment failed");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Metadata, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::client::Client;
use crate::event::{Event, ExtraValue, FieldMap};
use crate::level::Level;
use crate::transport::{RelayTransport, WebSocketTransport};

/// Events from this crate's own targets are never captured, so the client's
/// logs cannot feed back into it.
const SELF_TARGET: &str = "sentrystr";

fn is_self_target(target: &str) -> bool {
    target
        .strip_prefix(SELF_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Collects tracing fields as extras.
#[derive(Debug, Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: FieldMap<ExtraValue>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: ExtraValue) {
        self.fields.insert(field.name(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = if value.is_finite() {
            ExtraValue::Float(value)
        } else {
            ExtraValue::String(value.to_string())
        };
        self.insert(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, ExtraValue::Integer(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let value = match i64::try_from(value) {
            Ok(v) => ExtraValue::Integer(v),
            Err(_) => ExtraValue::String(value.to_string()),
        };
        self.insert(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, ExtraValue::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, value.into());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.insert(field, value.into());
        }
    }
}

fn metadata_extras(metadata: &Metadata<'_>) -> Vec<(&'static str, ExtraValue)> {
    let mut extras = vec![("meta_target", metadata.target().into())];
    if let Some(module) = metadata.module_path() {
        extras.push(("meta_module_path", module.into()));
    }
    if let Some(file) = metadata.file() {
        extras.push(("meta_file", file.into()));
    }
    if let Some(line) = metadata.line() {
        extras.push(("meta_line", line.into()));
    }
    extras
}

/// A [`Layer`] that captures tracing events through a [`Client`].
///
/// Field values become extras; event metadata becomes `meta_*` extras. Both
/// can be switched off.
pub struct SentryStrLayer<T = WebSocketTransport> {
    client: Arc<Client<T>>,
    min_level: Option<tracing::Level>,
    include_fields: bool,
    include_metadata: bool,
}

impl<T: RelayTransport + 'static> SentryStrLayer<T> {
    /// Creates a layer that owns `client` and captures every level.
    pub fn new(client: Client<T>) -> Self {
        Self::from_shared(Arc::new(client))
    }

    /// Creates a layer over a client that is also used elsewhere.
    pub fn from_shared(client: Arc<Client<T>>) -> Self {
        Self {
            client,
            min_level: None,
            include_fields: true,
            include_metadata: true,
        }
    }

    /// Ignores events less severe than `level`.
    pub fn with_min_level(mut self, level: tracing::Level) -> Self {
        self.min_level = Some(level);
        self
    }

    /// Whether event fields become extras. On by default.
    pub fn with_fields(mut self, include: bool) -> Self {
        self.include_fields = include;
        self
    }

    /// Whether target, module, file and line become `meta_*` extras.
    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    fn accepts(&self, metadata: &Metadata<'_>) -> bool {
        if is_self_target(metadata.target()) {
            return false;
        }
        // tracing orders more verbose levels as greater.
        self.min_level
            .map_or(true, |min| *metadata.level() <= min)
    }

    fn to_event(&self, event: &tracing::Event<'_>) -> Event {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut captured = Event::new()
            .with_message(visitor.message.unwrap_or_default())
            .with_level(Level::from(*metadata.level()))
            .with_logger(metadata.target());

        if self.include_fields {
            for (key, value) in visitor.fields.iter() {
                captured = captured.with_extra(key, value.clone());
            }
        }
        if self.include_metadata {
            for (key, value) in metadata_extras(metadata) {
                captured = captured.with_extra(key, value);
            }
        }
        captured
    }
}

impl<T> Clone for SentryStrLayer<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            min_level: self.min_level,
            include_fields: self.include_fields,
            include_metadata: self.include_metadata,
        }
    }
}

impl<S, T> Layer<S> for SentryStrLayer<T>
where
    S: Subscriber,
    T: RelayTransport + 'static,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if !self.accepts(event.metadata()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let captured = self.to_event(event);
        let client = Arc::clone(&self.client);
        handle.spawn(async move {
            if let Err(e) = client.capture_event(&captured).await {
                tracing::warn!(event_id = %captured.event_id, error = %e, "failed to capture tracing event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::payload::from_canonical_json;
    use crate::transport::MemoryTransport;
    use nostr::Keys;
    use std::time::Duration;
    use tracing_subscriber::prelude::*;

    fn layer() -> (SentryStrLayer<MemoryTransport>, MemoryTransport) {
        let config = Config::new(
            &Keys::generate().secret_key().to_secret_hex(),
            vec!["relayA".into()],
        )
        .unwrap();
        let transport = MemoryTransport::new();
        let client = Client::with_transport(config, transport.clone());
        (SentryStrLayer::new(client), transport)
    }

    async fn wait_for_units(transport: &MemoryTransport, count: usize) -> Vec<Event> {
        for _ in 0..100 {
            let units = transport.units().await;
            if units.len() >= count {
                return units
                    .iter()
                    .map(|u| from_canonical_json(&u.content).unwrap())
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} units");
    }

    #[tokio::test]
    async fn captures_event_with_fields_and_metadata() {
        let (layer, transport) = layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "app::billing", order_id = 42, retry = true, "payment failed");
        });

        let events = wait_for_units(&transport, 1).await;
        let event = &events[0];
        assert_eq!(event.message.as_deref(), Some("payment failed"));
        assert_eq!(event.level, Level::Error);
        assert_eq!(event.logger.as_deref(), Some("app::billing"));
        assert_eq!(event.extras.get("order_id"), Some(&ExtraValue::Integer(42)));
        assert_eq!(event.extras.get("retry"), Some(&ExtraValue::Bool(true)));
        assert_eq!(
            event.extras.get("meta_target"),
            Some(&ExtraValue::String("app::billing".into()))
        );
    }

    #[tokio::test]
    async fn honours_min_level_and_self_target() {
        let (layer, transport) = layer();
        let subscriber = tracing_subscriber::registry()
            .with(layer.with_min_level(tracing::Level::WARN).with_metadata(false));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "app", "too quiet");
            tracing::error!(target: "sentrystr::publisher", "own log");
            tracing::warn!(target: "app", "disk almost full");
        });

        let events = wait_for_units(&transport, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.units().await.len(), 1);
        assert_eq!(events[0].message.as_deref(), Some("disk almost full"));
        assert_eq!(events[0].level, Level::Warning);
        assert!(events[0].extras.get("meta_target").is_none());
    }

    #[test]
    fn only_own_module_paths_count_as_self() {
        assert!(is_self_target("sentrystr"));
        assert!(is_self_target("sentrystr::publisher"));
        assert!(!is_self_target("sentrystr_demo"));
        assert!(!is_self_target("sentrystrd::worker"));
        assert!(!is_self_target("app::sentrystr"));
    }

    #[tokio::test]
    async fn captures_crates_that_share_the_name_prefix() {
        let (layer, transport) = layer();
        let subscriber = tracing_subscriber::registry().with(layer.with_metadata(false));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "sentrystr", "own root log");
            tracing::error!(target: "sentrystr_demo", "demo crashed");
        });

        let events = wait_for_units(&transport, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.units().await.len(), 1);
        assert_eq!(events[0].message.as_deref(), Some("demo crashed"));
        assert_eq!(events[0].logger.as_deref(), Some("sentrystr_demo"));
    }
}

//! End-to-end delivery through `Client` with an in-memory relay transport.

use nostr::nips::nip19::ToBech32;
use nostr::Keys;
use sentrystr::{
    from_canonical_json, open_envelope, to_canonical_json, Client, Collector, Config,
    ConfigError, Event, EventFilter, Exception, Frame, Level, MemoryTransport,
    PublishPolicy, RelayStatus, SentryStrError, SerializationError, Stacktrace, User, KIND_EVENT,
    KIND_GIFT_WRAP,
};
use std::time::Duration;

fn secret_hex(keys: &Keys) -> String {
    keys.secret_key().to_secret_hex()
}

fn relays(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn memory_client(config: Config) -> (Client<MemoryTransport>, MemoryTransport) {
    let transport = MemoryTransport::new();
    (Client::with_transport(config, transport.clone()), transport)
}

#[tokio::test]
async fn plain_message_reaches_relay_as_canonical_json() {
    let keys = Keys::generate();
    let config = Config::new(&secret_hex(&keys), relays(&["relayA"])).unwrap();
    let (client, transport) = memory_client(config);

    client.capture_message("ok").await.unwrap();

    let units = transport.sent_to("relayA").await;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].kind.as_u16(), KIND_EVENT);
    assert!(units[0]
        .content
        .starts_with(r#"{"message":"ok","level":"info","tags":{},"extras":{}"#));

    let event = from_canonical_json(&units[0].content).unwrap();
    assert_eq!(to_canonical_json(&event).unwrap(), units[0].content);
}

#[tokio::test]
async fn same_unit_is_sent_to_every_relay() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["a", "b", "c"])).unwrap();
    let (client, transport) = memory_client(config);

    let report = client.capture_error("boom").await.unwrap();

    assert_eq!(report.primary.accepted(), 3);
    assert_eq!(transport.sent().await.len(), 3);
    assert_eq!(transport.units().await.len(), 1);
}

#[tokio::test]
async fn encrypted_primary_is_readable_only_by_target() {
    let target = Keys::generate();
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"]))
        .unwrap()
        .with_encryption(&target.public_key().to_bech32().unwrap())
        .unwrap();
    let (client, transport) = memory_client(config);
    let event = Event::new()
        .with_message("secret failure")
        .with_level(Level::Error)
        .with_user(User::new().with_email("alice@example.com"));

    client.capture_event(&event).await.unwrap();

    let units = transport.units().await;
    assert_eq!(units.len(), 1);
    assert!(!units[0].content.contains("secret failure"));
    assert!(!units[0].content.contains("alice@example.com"));

    let opened = open_envelope(&target, &units[0]).unwrap();
    assert_eq!(opened.plaintext, to_canonical_json(&event).unwrap());
    assert!(open_envelope(&Keys::generate(), &units[0]).is_err());
}

#[tokio::test]
async fn direct_message_gate_follows_level_threshold() {
    let target = Keys::generate();

    for (level, expected_units) in [
        (Level::Debug, 1),
        (Level::Info, 1),
        (Level::Warning, 2),
        (Level::Error, 2),
        (Level::Fatal, 2),
    ] {
        let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"])).unwrap();
        let (mut client, transport) = memory_client(config);
        client
            .setup_direct_messaging(&target.public_key().to_hex(), Level::Warning)
            .unwrap();

        let event = Event::new().with_message("disk usage").with_level(level);
        let report = client.capture_event(&event).await.unwrap();

        let units = transport.units().await;
        assert_eq!(units.len(), expected_units, "level {level}");
        assert_eq!(report.direct_message.is_some(), expected_units == 2);
        assert!(report.is_complete());

        if expected_units == 2 {
            let primary = &units[0];
            let dm = &units[1];
            assert_eq!(dm.kind.as_u16(), KIND_GIFT_WRAP);
            let opened = open_envelope(&target, dm).unwrap();
            assert_eq!(opened.plaintext, primary.content);
            assert_eq!(opened.author, client.config().public_key().to_hex());
        }
    }
}

#[tokio::test]
async fn encryption_and_direct_message_compose() {
    let archive = Keys::generate();
    let oncall = Keys::generate();
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"]))
        .unwrap()
        .with_encryption(&archive.public_key().to_hex())
        .unwrap()
        .with_direct_messaging(&oncall.public_key().to_hex(), Level::Error)
        .unwrap();
    let (client, transport) = memory_client(config);

    client.capture_error("payment service down").await.unwrap();

    let units = transport.units().await;
    assert_eq!(units.len(), 2);
    let primary = open_envelope(&archive, &units[0]).unwrap().plaintext;
    let dm = open_envelope(&oncall, &units[1]).unwrap().plaintext;
    assert_eq!(primary, dm);
    assert!(open_envelope(&oncall, &units[0]).is_err());
}

#[tokio::test]
async fn last_direct_message_setup_wins() {
    let first = Keys::generate();
    let second = Keys::generate();
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"])).unwrap();
    let (mut client, transport) = memory_client(config);

    client
        .setup_direct_messaging(&first.public_key().to_hex(), Level::Warning)
        .unwrap();
    client
        .setup_direct_messaging(&second.public_key().to_hex(), Level::Fatal)
        .unwrap();

    client.capture_error("not fatal").await.unwrap();
    assert_eq!(transport.units().await.len(), 1);

    client
        .capture_event(&Event::new().with_message("fatal").with_level(Level::Fatal))
        .await
        .unwrap();
    let units = transport.units().await;
    assert_eq!(units.len(), 3);
    assert!(open_envelope(&second, &units[2]).is_ok());
    assert!(open_envelope(&first, &units[2]).is_err());
}

#[tokio::test]
async fn exception_frames_keep_their_order() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"])).unwrap();
    let (client, transport) = memory_client(config);
    let stacktrace = Stacktrace::new()
        .with_frame(Frame::new("main.rs").with_function("main").with_lineno(10))
        .with_frame(Frame::new("service.rs").with_function("service").with_lineno(20))
        .with_frame(Frame::new("db.rs").with_function("db").with_lineno(30));

    client
        .capture_exception(Exception::new("DbError", "timeout").with_stacktrace(stacktrace))
        .await
        .unwrap();

    let content = &transport.units().await[0].content;
    let json: serde_json::Value = serde_json::from_str(content).unwrap();
    let functions: Vec<&str> = json["exception"]["stacktrace"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["function"].as_str().unwrap())
        .collect();
    assert_eq!(functions, ["main", "service", "db"]);
    assert_eq!(json["exception"]["type"], "DbError");
}

#[tokio::test]
async fn partial_relay_failure_is_reported_not_raised() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["good", "bad", "slow"]))
        .unwrap()
        .with_relay_timeout(Duration::from_millis(100));
    let (client, transport) = memory_client(config);
    transport.reject_relay("bad", "blocked").await;
    transport.hang_relay("slow").await;

    let report = client.capture_message("ok").await.unwrap();

    let statuses: Vec<_> = report
        .primary
        .outcomes
        .iter()
        .map(|o| (o.relay.as_str(), o.status.clone()))
        .collect();
    assert_eq!(
        statuses,
        [
            ("good", RelayStatus::Accepted),
            ("bad", RelayStatus::Rejected("blocked".into())),
            ("slow", RelayStatus::TimedOut),
        ]
    );
}

#[tokio::test]
async fn every_relay_failing_is_a_publish_error() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["a", "b"]))
        .unwrap()
        .with_relay_timeout(Duration::from_millis(100));
    let (client, transport) = memory_client(config);
    transport.reject_relay("a", "no").await;
    transport.hang_relay("b").await;

    let err = client.capture_message("lost").await.unwrap_err();

    assert!(matches!(err, SentryStrError::Publish(ref e) if e.accepted == 0 && e.attempted == 2));
}

#[tokio::test]
async fn all_policy_requires_every_relay() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["a", "b"]))
        .unwrap()
        .with_publish_policy(PublishPolicy::All);
    let (client, transport) = memory_client(config);
    transport.reject_relay("b", "full").await;

    assert!(matches!(
        client.capture_message("x").await,
        Err(SentryStrError::Publish(_))
    ));
}

#[tokio::test]
async fn send_direct_message_without_setup_fails() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"])).unwrap();
    let (client, transport) = memory_client(config);

    let err = client.send_direct_message("hello").await.unwrap_err();

    assert!(matches!(
        err,
        SentryStrError::Config(ConfigError::DirectMessagingNotConfigured)
    ));
    assert!(transport.sent().await.is_empty());
}

#[test]
fn config_rejects_bad_key_and_empty_relays() {
    assert!(matches!(
        Config::new("", vec![]),
        Err(ConfigError::InvalidSigningKey(_))
    ));
    assert!(matches!(
        Config::new(&secret_hex(&Keys::generate()), vec![]),
        Err(ConfigError::NoRelays)
    ));
    assert!(Config::new(&"a".repeat(64), relays(&["relayA"])).is_ok());
}

#[tokio::test]
async fn shared_client_handles_concurrent_captures() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA", "relayB"])).unwrap();
    let (client, transport) = memory_client(config);
    let client = std::sync::Arc::new(client);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = std::sync::Arc::clone(&client);
            tokio::spawn(async move { client.capture_message(&format!("event {i}")).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(transport.units().await.len(), 8);
    assert_eq!(transport.sent().await.len(), 16);
}

#[tokio::test]
async fn failed_direct_message_does_not_hide_published_event() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA", "relayB"]))
        .unwrap()
        .with_direct_messaging(&Keys::generate().public_key().to_hex(), None)
        .unwrap();
    let (client, transport) = memory_client(config);
    transport.reject_kind(KIND_GIFT_WRAP, "kind not allowed").await;

    let report = client.capture_error("payment service down").await.unwrap();

    assert_eq!(report.primary.accepted(), 2);
    assert!(matches!(report.direct_message, Some(Err(SentryStrError::Publish(_)))));
    assert_eq!(transport.units().await.len(), 1);
}

#[tokio::test]
async fn only_filterable_tags_are_visible_to_relays() {
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"])).unwrap();
    let (client, transport) = memory_client(config);
    let event = Event::new()
        .with_message("expiring")
        .with_tag("service", "billing")
        .with_tag("expiration", "1")
        .with_tag("customer", "alice@example.com");

    client.capture_event(&event).await.unwrap();

    let unit = &transport.units().await[0];
    let visible: Vec<Vec<String>> = unit.tags.iter().map(|t| t.as_slice().to_vec()).collect();
    assert_eq!(
        visible,
        [
            vec!["level".to_string(), "info".to_string()],
            vec!["service".to_string(), "billing".to_string()],
        ]
    );
    let event = from_canonical_json(&unit.content).unwrap();
    assert_eq!(event.tags.get("expiration").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn oversized_payload_is_refused_up_front() {
    let target = Keys::generate();
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA"]))
        .unwrap()
        .with_direct_messaging(&target.public_key().to_hex(), Level::Error)
        .unwrap();
    let (client, transport) = memory_client(config);
    let event = Event::new()
        .with_message("heap dump attached")
        .with_level(Level::Fatal)
        .with_extra("dump", "0".repeat(60 * 1024));

    let err = client.capture_event(&event).await.unwrap_err();

    assert!(matches!(
        err,
        SentryStrError::Serialization(SerializationError::PayloadTooLarge { .. })
    ));
    assert!(transport.attempts().await.is_empty());

    // Below the direct-message threshold the plain copy is still published.
    let quiet = event.clone().with_level(Level::Info);
    client.capture_event(&quiet).await.unwrap();
    assert_eq!(transport.units().await.len(), 1);
}

#[tokio::test]
async fn published_events_can_be_collected() {
    let archive = Keys::generate();
    let config = Config::new(&secret_hex(&Keys::generate()), relays(&["relayA", "relayB"]))
        .unwrap()
        .with_encryption(&archive.public_key().to_hex())
        .unwrap();
    let (client, transport) = memory_client(config);
    client.capture_message("healthy").await.unwrap();
    client
        .capture_event(
            &Event::new()
                .with_message("db timeout")
                .with_level(Level::Error)
                .with_tag("component", "db"),
        )
        .await
        .unwrap();

    let collector = Collector::with_transport(relays(&["relayA", "relayB"]), transport.clone())
        .unwrap()
        .with_keys(archive);
    let collected = collector
        .collect_events(
            &EventFilter::new()
                .with_author(client.config().public_key())
                .with_min_level(Level::Warning)
                .with_component("db"),
        )
        .await
        .unwrap();

    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].event.message.as_deref(), Some("db timeout"));
    assert_eq!(collected[0].unit_id, transport.units().await[1].id);
}

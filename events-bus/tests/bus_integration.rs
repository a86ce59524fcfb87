use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::sleep;

use events_bus::{
    BusConfig, EventBus, EventBusError, EventEnvelope, EventHandler, EventKind, MemoryTransport,
    StreamNames, StreamTransport, DEFAULT_CONSUMER_GROUP,
};
use phi_redaction::PhiScrubber;

fn test_config() -> BusConfig {
    let mut config = BusConfig::default()
        .with_environment("test")
        .with_stream_prefix("carebus");
    // tight timings keep the suite fast; workers observe shutdown within
    // one block_timeout
    config.block_timeout = Duration::from_millis(50);
    config.read_backoff = Duration::from_millis(20);
    config.claim_min_idle = Duration::from_millis(50);
    config.claim_interval = Duration::from_millis(25);
    config
}

fn memory_bus(config: BusConfig) -> (EventBus, Arc<MemoryTransport>, StreamNames) {
    let names = StreamNames::from_config(&config);
    let transport = Arc::new(MemoryTransport::new());
    let bus = EventBus::with_transport(
        config,
        transport.clone(),
        Arc::new(PhiScrubber::default()),
    );
    (bus, transport, names)
}

async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Clone)]
struct Recording {
    label: &'static str,
    seen: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl Recording {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }

    fn envelopes(&self) -> Vec<EventEnvelope> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl EventHandler for Recording {
    fn name(&self) -> &str {
        self.label
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self.seen.lock().push(envelope.clone());
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    fn name(&self) -> &str {
        "always-failing"
    }

    async fn handle(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("projection store unavailable"))
    }
}

#[tokio::test]
async fn test_operations_require_connection() {
    let bus = EventBus::new(test_config());
    let envelope = EventEnvelope::new(EventKind::ClientCreated, "client", "client-1");

    assert!(matches!(
        bus.publish(envelope, None).await,
        Err(EventBusError::NotConnected)
    ));
    assert!(matches!(
        bus.get_stream_info().await,
        Err(EventBusError::NotConnected)
    ));
    assert!(matches!(
        bus.health_check().await,
        Err(EventBusError::NotConnected)
    ));
    let recorder = Recording::new("nobody");
    assert!(bus
        .subscribe(
            EventKind::ClientCreated,
            Arc::new(recorder),
            DEFAULT_CONSUMER_GROUP
        )
        .await
        .is_err());
}

#[tokio::test]
async fn test_published_entries_are_scrubbed_and_audited() {
    let (bus, transport, names) = memory_bus(test_config());

    let envelope = EventEnvelope::new(EventKind::ClientUpdated, "client", "client-123")
        .with_metadata("note", "patient emailed john@example.com");
    let event_id = envelope.event_id;
    bus.publish(envelope, Some("corr-42")).await.expect("publish");

    let entries = transport.range(&names.main, 10).await.expect("range");
    assert_eq!(entries.len(), 1);
    let metadata = &entries[0].fields["metadata"];
    assert!(metadata.contains("[EMAIL-REDACTED]"));
    assert!(!metadata.contains("john@example.com"));

    let audit = transport.range(&names.audit, 10).await.expect("range");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].fields["operation"], "publish");
    assert_eq!(audit[0].fields["event_id"], event_id.to_string());
    assert_eq!(audit[0].fields["correlation_id"], "corr-42");
    assert!(!audit[0].fields["metadata"].contains("john@example.com"));
}

#[tokio::test]
async fn test_subscriber_receives_scrubbed_envelope() {
    let (bus, _transport, _names) = memory_bus(test_config());
    let recorder = Recording::new("reporting");
    bus.subscribe(
        EventKind::UserUpdated,
        Arc::new(recorder.clone()),
        "reporting",
    )
    .await
    .expect("subscribe");

    let envelope = EventEnvelope::new(EventKind::UserUpdated, "client", "client-123")
        .with_metadata("note", "john@example.com contacted");
    bus.publish(envelope, None).await.expect("publish");

    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 1).await);
    let seen = recorder.envelopes();
    assert_eq!(seen[0].event_type, EventKind::UserUpdated);
    assert_eq!(seen[0].resource_id, "client-123");
    assert_eq!(seen[0].environment, "test");
    assert_eq!(seen[0].metadata["note"], "[EMAIL-REDACTED] contacted");
    assert!(seen[0].correlation_id.is_some());
    assert!(seen[0].published_at.is_some());

    bus.disconnect().await;
}

#[tokio::test]
async fn test_digit_heavy_ids_are_delivered_not_dead_lettered() {
    let (bus, transport, names) = memory_bus(test_config());
    let recorder = Recording::new("reporting");
    bus.subscribe(
        EventKind::LedgerEntryPosted,
        Arc::new(recorder.clone()),
        "reporting",
    )
    .await
    .expect("subscribe");

    // an event id whose segments are all digits must survive scrubbing:
    // a redaction token in its place would fail consumer validation
    let mut envelope = EventEnvelope::new(EventKind::LedgerEntryPosted, "ledger_entry", "le-1");
    envelope.event_id =
        uuid::Uuid::parse_str("12345678-1234-4123-9123-123456789012").expect("uuid");
    let event_id = envelope.event_id;
    bus.publish(envelope, None).await.expect("publish");

    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 1).await);
    assert_eq!(recorder.envelopes()[0].event_id, event_id);

    sleep(Duration::from_millis(100)).await;
    let dlq_info = transport.stream_info(&names.dlq).await.expect("dlq info");
    assert!(!dlq_info.exists);

    bus.disconnect().await;
}

#[tokio::test]
async fn test_independent_groups_each_deliver_every_event_in_order() {
    let (bus, transport, names) = memory_bus(test_config());
    let analytics = Recording::new("analytics");
    let notifications = Recording::new("notifications");
    bus.subscribe(
        EventKind::AppointmentScheduled,
        Arc::new(analytics.clone()),
        "analytics",
    )
    .await
    .expect("subscribe analytics");
    bus.subscribe(
        EventKind::AppointmentScheduled,
        Arc::new(notifications.clone()),
        "notifications",
    )
    .await
    .expect("subscribe notifications");

    let mut published = Vec::new();
    for i in 0..5 {
        let envelope = EventEnvelope::new(
            EventKind::AppointmentScheduled,
            "appointment",
            &format!("appt-{i}"),
        );
        published.push(envelope.event_id.to_string());
        bus.publish(envelope, None).await.expect("publish");
    }

    // the handler list is process-wide; the group only picks the delivery
    // cursor, so both recorders run once per group per event: 5 events
    // times 2 groups = 10 invocations each
    assert!(wait_until(Duration::from_secs(3), || {
        analytics.count() == 10 && notifications.count() == 10
    })
    .await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(analytics.count(), 10);
    assert_eq!(notifications.count(), 10);

    // each group's own delivery cycle follows publish order, visible in
    // the process audit trail
    let audit = transport.range(&names.audit, 100).await.expect("audit range");
    let delivered_to = |group: &str| -> Vec<String> {
        let tag = format!("\"consumer_group\":\"{group}\"");
        audit
            .iter()
            .filter(|entry| entry.fields["operation"] == "process")
            .filter(|entry| entry.fields["metadata"].contains(&tag))
            .map(|entry| entry.fields["event_id"].clone())
            .collect()
    };
    assert_eq!(delivered_to("analytics"), published);
    assert_eq!(delivered_to("notifications"), published);

    bus.disconnect().await;
}

#[tokio::test]
async fn test_competing_workers_share_without_duplicates() {
    let mut config = test_config();
    config.workers_per_group = 2;
    let (bus, _transport, _names) = memory_bus(config);
    let recorder = Recording::new("etl");
    bus.subscribe(EventKind::NoteCreated, Arc::new(recorder.clone()), "etl")
        .await
        .expect("subscribe");

    for i in 0..20 {
        let envelope = EventEnvelope::new(EventKind::NoteCreated, "note", &format!("note-{i}"));
        bus.publish(envelope, None).await.expect("publish");
    }

    assert!(wait_until(Duration::from_secs(3), || recorder.count() == 20).await);
    // give claims and redeliveries a chance to produce duplicates
    sleep(Duration::from_millis(200)).await;
    let unique: HashSet<_> = recorder.envelopes().iter().map(|e| e.event_id).collect();
    assert_eq!(recorder.count(), 20);
    assert_eq!(unique.len(), 20);

    bus.disconnect().await;
}

#[tokio::test]
async fn test_unacked_entries_are_claimed_and_redelivered() {
    let (bus, transport, names) = memory_bus(test_config());

    let envelope = EventEnvelope::new(EventKind::LedgerEntryPosted, "ledger_entry", "le-9");
    let event_id = envelope.event_id;
    bus.publish(envelope, None).await.expect("publish");

    // a consumer that reads and then dies without acking
    transport
        .create_group(&names.main, "etl")
        .await
        .expect("create group");
    let mut ghost = transport
        .open_reader(&names.main, "etl", "ghost")
        .await
        .expect("open ghost reader");
    let delivered = ghost
        .read_new(10, Duration::ZERO)
        .await
        .expect("ghost read");
    assert_eq!(delivered.len(), 1);
    drop(ghost);

    // a healthy worker in the same group claims the stale delivery
    let recorder = Recording::new("etl-survivor");
    bus.subscribe(
        EventKind::LedgerEntryPosted,
        Arc::new(recorder.clone()),
        "etl",
    )
    .await
    .expect("subscribe");

    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 1).await);
    assert_eq!(recorder.envelopes()[0].event_id, event_id);

    bus.disconnect().await;
}

#[tokio::test]
async fn test_unparseable_entries_are_dead_lettered_once() {
    let (bus, transport, names) = memory_bus(test_config());
    let recorder = Recording::new("default");
    bus.subscribe(
        EventKind::ClientCreated,
        Arc::new(recorder.clone()),
        DEFAULT_CONSUMER_GROUP,
    )
    .await
    .expect("subscribe");

    let mut junk = std::collections::HashMap::new();
    junk.insert("junk".to_string(), "data".to_string());
    let junk_id = transport
        .append(&names.main, 100, &junk)
        .await
        .expect("append junk");

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut dlq_len = 0;
    while Instant::now() < deadline {
        dlq_len = transport
            .stream_info(&names.dlq)
            .await
            .expect("dlq info")
            .length;
        if dlq_len == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dlq_len, 1);

    let dead = transport.range(&names.dlq, 10).await.expect("range dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].fields["junk"], "data");
    assert_eq!(dead[0].fields["original_msg_id"], junk_id);
    assert!(dead[0].fields["error"].contains("missing field"));

    // acked after routing: it must not be dead-lettered again, and the
    // main stream keeps the original entry
    sleep(Duration::from_millis(200)).await;
    let dlq_info = transport.stream_info(&names.dlq).await.expect("dlq info");
    assert_eq!(dlq_info.length, 1);
    let main_info = transport.stream_info(&names.main).await.expect("main info");
    assert_eq!(main_info.length, 1);
    assert_eq!(recorder.count(), 0);

    bus.disconnect().await;
}

#[tokio::test]
async fn test_capped_streams_evict_oldest_entries() {
    let mut config = test_config();
    config.main_maxlen = 10;
    let (bus, transport, names) = memory_bus(config);

    let mut entry_ids = Vec::new();
    for i in 0..15 {
        let envelope = EventEnvelope::new(EventKind::NoteCreated, "note", &format!("note-{i}"));
        entry_ids.push(bus.publish(envelope, None).await.expect("publish"));
    }

    let info = transport.stream_info(&names.main).await.expect("info");
    assert_eq!(info.length, 10);
    let entries = transport.range(&names.main, 100).await.expect("range");
    assert_eq!(entries[0].id, entry_ids[5]);
    assert_eq!(entries.last().map(|e| e.id.clone()), entry_ids.last().cloned());
}

#[tokio::test]
async fn test_stream_info_reports_shape() {
    let (bus, _transport, names) = memory_bus(test_config());
    let recorder = Recording::new("reporting");
    bus.subscribe(
        EventKind::ProviderUpdated,
        Arc::new(recorder.clone()),
        "reporting",
    )
    .await
    .expect("subscribe");

    for i in 0..2 {
        let envelope =
            EventEnvelope::new(EventKind::ProviderUpdated, "provider", &format!("prov-{i}"));
        bus.publish(envelope, None).await.expect("publish");
    }
    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 2).await);

    let info = bus.get_stream_info().await.expect("stream info");
    assert_eq!(info.len(), 3);

    let main = &info[&names.main];
    assert!(main.exists);
    assert_eq!(main.length, 2);
    assert_eq!(main.group_count, 1);
    assert!(main.first_entry.is_some());

    assert!(!info[&names.dlq].exists);
    assert_eq!(info[&names.dlq].length, 0);

    // publish and process audits land on the audit stream
    let audit = &info[&names.audit];
    assert!(audit.exists);
    assert!(audit.length >= 2);

    bus.disconnect().await;
}

#[tokio::test]
async fn test_handler_failure_is_contained() {
    let (bus, transport, names) = memory_bus(test_config());
    let recorder = Recording::new("second-in-line");
    bus.subscribe(
        EventKind::NoteSigned,
        Arc::new(Failing),
        DEFAULT_CONSUMER_GROUP,
    )
    .await
    .expect("subscribe failing");
    bus.subscribe(
        EventKind::NoteSigned,
        Arc::new(recorder.clone()),
        DEFAULT_CONSUMER_GROUP,
    )
    .await
    .expect("subscribe recorder");

    let envelope = EventEnvelope::new(EventKind::NoteSigned, "note", "note-1");
    bus.publish(envelope, None).await.expect("publish");

    // the failing handler does not block the next handler in line
    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 1).await);

    // handler failures are not poison: nothing lands on the dead-letter
    // stream and the entry is not redelivered
    sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.count(), 1);
    let dlq_info = transport.stream_info(&names.dlq).await.expect("dlq info");
    assert!(!dlq_info.exists);

    // the processed delivery is still audited for the group
    let audit = transport.range(&names.audit, 50).await.expect("audit range");
    let processed: Vec<_> = audit
        .iter()
        .filter(|entry| entry.fields["operation"] == "process")
        .collect();
    assert_eq!(processed.len(), 1);
    assert!(processed[0].fields["metadata"].contains("\"consumer_group\":\"default\""));

    bus.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_stops_workers_and_rejects_publishes() {
    let (bus, transport, names) = memory_bus(test_config());
    let recorder = Recording::new("reporting");
    bus.subscribe(
        EventKind::ClientArchived,
        Arc::new(recorder.clone()),
        "reporting",
    )
    .await
    .expect("subscribe");

    let envelope = EventEnvelope::new(EventKind::ClientArchived, "client", "client-3");
    bus.publish(envelope, None).await.expect("publish");
    assert!(wait_until(Duration::from_secs(2), || recorder.count() == 1).await);

    bus.disconnect().await;
    assert!(!bus.is_connected().await);

    let envelope = EventEnvelope::new(EventKind::ClientArchived, "client", "client-4");
    assert!(matches!(
        bus.publish(envelope, None).await,
        Err(EventBusError::NotConnected)
    ));

    // append a perfectly valid entry behind the bus's back: with every
    // worker stopped, nobody consumes it
    let mut late = EventEnvelope::new(EventKind::ClientArchived, "client", "client-5");
    late.correlation_id = Some("corr-late".to_string());
    late.environment = "test".to_string();
    late.published_at = Some(Utc::now());
    let fields = late.to_fields().expect("fields");
    transport
        .append(&names.main, 100, &fields)
        .await
        .expect("append");

    sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn test_retried_subscribe_registers_exactly_once() {
    let (bus, _transport, _names) = memory_bus(test_config());
    bus.disconnect().await;

    let recorder = Recording::new("reporting");
    assert!(matches!(
        bus.subscribe(
            EventKind::UserCreated,
            Arc::new(recorder.clone()),
            "reporting",
        )
        .await,
        Err(EventBusError::NotConnected)
    ));

    // the failed attempt left nothing registered; the retry is the one
    // registration that counts
    bus.connect().await.expect("reconnect");
    bus.subscribe(
        EventKind::UserCreated,
        Arc::new(recorder.clone()),
        "reporting",
    )
    .await
    .expect("subscribe after reconnect");

    let envelope = EventEnvelope::new(EventKind::UserCreated, "user", "user-8");
    bus.publish(envelope, None).await.expect("publish");

    assert!(wait_until(Duration::from_secs(2), || recorder.count() >= 1).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.count(), 1);

    bus.disconnect().await;
}

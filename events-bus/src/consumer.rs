use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::audit::{AuditOperation, AuditRecorder};
use crate::broker::BrokerHandle;
use crate::dlq::DeadLetterRouter;
use crate::envelope::EventEnvelope;
use crate::registry::SubscriptionRegistry;
use crate::transport::{GroupReader, StreamEntry};

/// One competing consumer within a group.
///
/// The loop per iteration: observe the shutdown flag, periodically claim
/// entries another consumer left pending too long, then block briefly for
/// new entries and process them. Each entry is either dispatched to every
/// registered handler and acknowledged, or dead-lettered and acknowledged
/// when it cannot be parsed. Acks always happen, so nothing is redelivered
/// forever; handler errors are contained per handler.
pub struct ConsumerWorker {
    broker: Arc<BrokerHandle>,
    registry: Arc<SubscriptionRegistry>,
    dlq: Arc<DeadLetterRouter>,
    audit: Arc<AuditRecorder>,
    group: String,
    consumer_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ConsumerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        broker: Arc<BrokerHandle>,
        registry: Arc<SubscriptionRegistry>,
        dlq: Arc<DeadLetterRouter>,
        audit: Arc<AuditRecorder>,
        group: String,
        consumer_name: String,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let worker = Self {
            broker,
            registry,
            dlq,
            audit,
            group,
            consumer_name,
            shutdown,
        };
        tokio::spawn(async move { worker.run().await })
    }

    async fn run(self) {
        debug!(
            group = %self.group,
            consumer = %self.consumer_name,
            "consumer worker started"
        );

        let Some(mut reader) = self.open_reader().await else {
            debug!(group = %self.group, "consumer worker stopped before opening a reader");
            return;
        };
        let config = self.broker.config().clone();
        let mut last_claim: Option<Instant> = None;

        while !self.shutdown.load(Ordering::SeqCst) {
            let claim_due = last_claim
                .map(|at| at.elapsed() >= config.claim_interval)
                .unwrap_or(true);
            if claim_due {
                last_claim = Some(Instant::now());
                match reader
                    .claim_stale(config.claim_min_idle, config.read_batch_size)
                    .await
                {
                    Ok(entries) => {
                        for entry in entries {
                            debug!(
                                entry_id = %entry.id,
                                group = %self.group,
                                "claimed stale entry for redelivery"
                            );
                            self.process_entry(reader.as_mut(), entry).await;
                        }
                    }
                    Err(e) => {
                        warn!(group = %self.group, error = %e, "stale-entry claim failed");
                    }
                }
            }

            match reader
                .read_new(config.read_batch_size, config.block_timeout)
                .await
            {
                Ok(entries) => {
                    for entry in entries {
                        self.process_entry(reader.as_mut(), entry).await;
                    }
                }
                Err(e) => {
                    counter!("event_bus_read_errors_total").increment(1);
                    warn!(
                        group = %self.group,
                        consumer = %self.consumer_name,
                        error = %e,
                        "stream read failed, backing off"
                    );
                    tokio::time::sleep(config.read_backoff).await;
                }
            }
        }

        debug!(
            group = %self.group,
            consumer = %self.consumer_name,
            "consumer worker stopped"
        );
    }

    async fn open_reader(&self) -> Option<Box<dyn GroupReader>> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            let Ok(transport) = self.broker.transport().await else {
                // connection slot emptied under us; only disconnect does that
                return None;
            };
            match transport
                .open_reader(&self.broker.names().main, &self.group, &self.consumer_name)
                .await
            {
                Ok(reader) => return Some(reader),
                Err(e) => {
                    warn!(group = %self.group, error = %e, "failed to open group reader, retrying");
                    tokio::time::sleep(self.broker.config().read_backoff).await;
                }
            }
        }
    }

    async fn process_entry(&self, reader: &mut dyn GroupReader, entry: StreamEntry) {
        match EventEnvelope::from_fields(&entry.fields) {
            Ok(envelope) => self.dispatch(reader, &entry.id, envelope).await,
            Err(e) => {
                // poison entry: preserve it on the dead-letter stream, then
                // ack so the group never sees it again
                self.dlq.route(&entry.id, &entry.fields, &e.to_string()).await;
                self.ack_entry(reader, &entry.id).await;
            }
        }
    }

    async fn dispatch(&self, reader: &mut dyn GroupReader, entry_id: &str, envelope: EventEnvelope) {
        let handlers = self.registry.handlers_for(envelope.event_type);
        for handler in &handlers {
            if let Err(e) = handler.handle(&envelope).await {
                counter!("event_bus_handler_failures_total").increment(1);
                error!(
                    handler = handler.name(),
                    event_id = %envelope.event_id,
                    event_type = envelope.event_type.as_str(),
                    group = %self.group,
                    error = %e,
                    "event handler failed"
                );
            }
        }

        self.ack_entry(reader, entry_id).await;
        counter!("event_bus_processed_total", "group" => self.group.clone()).increment(1);

        let correlation = envelope.correlation_id.clone().unwrap_or_default();
        let metadata = serde_json::json!({
            "consumer_group": self.group,
            "entry_id": entry_id,
        });
        self.audit
            .record(
                AuditOperation::Process,
                envelope.event_type,
                &envelope.event_id.to_string(),
                &correlation,
                metadata,
            )
            .await;
    }

    async fn ack_entry(&self, reader: &mut dyn GroupReader, entry_id: &str) {
        if let Err(e) = reader.ack(entry_id).await {
            warn!(
                entry_id,
                group = %self.group,
                error = %e,
                "acknowledge failed, entry will be redelivered"
            );
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::broker::BrokerHandle;
use crate::config::BusConfig;
use crate::consumer::ConsumerWorker;
use crate::dlq::DeadLetterRouter;
use crate::envelope::{EventEnvelope, EventKind};
use crate::error::Result;
use crate::publisher::Publisher;
use crate::registry::{EventHandler, SubscriptionRegistry};
use crate::scrub::Scrub;
use crate::status::StatusInspector;
use crate::transport::{StreamInfo, StreamTransport};

/// Consumer group for services that do not need fan-out isolation.
pub const DEFAULT_CONSUMER_GROUP: &str = "default";

/// The bus facade: one instance per process, shared behind an `Arc`.
///
/// Publishing requires [`EventBus::connect`] first. Subscribing registers a
/// handler and lazily starts the consumer workers for the named group; each
/// group receives every event independently, while workers inside one group
/// compete for entries.
pub struct EventBus {
    config: BusConfig,
    broker: Arc<BrokerHandle>,
    registry: Arc<SubscriptionRegistry>,
    publisher: Publisher,
    audit: Arc<AuditRecorder>,
    dlq: Arc<DeadLetterRouter>,
    inspector: StatusInspector,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active_groups: Mutex<HashSet<String>>,
    shutdown: Arc<AtomicBool>,
}

impl EventBus {
    /// Bus over Redis with the default PHI scrubber. Redaction is not
    /// optional; use [`EventBus::with_scrubber`] to change how it is done,
    /// not whether.
    pub fn new(config: BusConfig) -> Self {
        Self::with_scrubber(config, Arc::new(phi_redaction::PhiScrubber::default()))
    }

    /// Bus over Redis with a caller-supplied scrub implementation.
    pub fn with_scrubber(config: BusConfig, scrubber: Arc<dyn Scrub>) -> Self {
        let broker = Arc::new(BrokerHandle::new(config.clone()));
        Self::assemble(config, broker, scrubber)
    }

    /// Bus over a pre-wired transport, already connected. This is how tests
    /// and embedded deployments run against [`MemoryTransport`].
    ///
    /// [`MemoryTransport`]: crate::transport::memory::MemoryTransport
    pub fn with_transport(
        config: BusConfig,
        transport: Arc<dyn StreamTransport>,
        scrubber: Arc<dyn Scrub>,
    ) -> Self {
        let broker = Arc::new(BrokerHandle::with_transport(config.clone(), transport));
        Self::assemble(config, broker, scrubber)
    }

    fn assemble(config: BusConfig, broker: Arc<BrokerHandle>, scrubber: Arc<dyn Scrub>) -> Self {
        let audit = Arc::new(AuditRecorder::new(broker.clone()));
        let dlq = Arc::new(DeadLetterRouter::new(broker.clone()));
        let publisher = Publisher::new(broker.clone(), audit.clone(), scrubber);
        let inspector = StatusInspector::new(broker.clone());
        Self {
            config,
            broker,
            registry: Arc::new(SubscriptionRegistry::new()),
            publisher,
            audit,
            dlq,
            inspector,
            workers: Mutex::new(Vec::new()),
            active_groups: Mutex::new(HashSet::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Establish the broker connection. Idempotent while connected; after a
    /// `disconnect` this reconnects, and groups must be subscribed again.
    pub async fn connect(&self) -> Result<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        self.broker.connect().await
    }

    /// Stop consumption and drop the connection.
    ///
    /// Sets the shutdown flag, waits for every worker to observe it (bounded
    /// by roughly one blocking-read timeout each) and then releases the
    /// transport. Registered handlers survive a disconnect; consumer groups
    /// do not restart until re-subscribed.
    pub async fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let worker_count = handles.len();
        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                warn!(error = %e, "consumer worker ended abnormally");
            }
        }
        self.active_groups.lock().await.clear();
        self.broker.release().await;
        info!(workers = worker_count, "event bus disconnected");
    }

    pub async fn is_connected(&self) -> bool {
        self.broker.is_connected().await
    }

    /// Publish one envelope to the main stream. See [`Publisher::publish`].
    pub async fn publish(
        &self,
        envelope: EventEnvelope,
        correlation_id: Option<&str>,
    ) -> Result<String> {
        self.publisher.publish(envelope, correlation_id).await
    }

    /// Register `handler` for `kind` and make sure `group` is consuming.
    ///
    /// The handler list is process-wide and ordered by registration; the
    /// group only decides which delivery cursor feeds the workers. Every
    /// group receives every event independently, so subscribing two groups
    /// to the same kind runs its handlers once per group per entry. Workers
    /// for a group are started once, on its first subscription; subscribe
    /// before traffic flows, late handlers miss earlier entries.
    ///
    /// The handler is registered only once the group is live, so a
    /// `subscribe` that fails leaves nothing behind and can be retried
    /// without duplicating the registration.
    pub async fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        group: &str,
    ) -> Result<()> {
        self.ensure_group_started(group).await?;
        self.registry.register(kind, handler);
        Ok(())
    }

    async fn ensure_group_started(&self, group: &str) -> Result<()> {
        let mut active = self.active_groups.lock().await;
        if active.contains(group) {
            return Ok(());
        }

        let transport = self.broker.transport().await?;
        transport
            .create_group(&self.broker.names().main, group)
            .await?;

        let worker_count = self.config.workers_per_group.max(1);
        let mut workers = self.workers.lock().await;
        for _ in 0..worker_count {
            let consumer_name = format!("{}-{}", group, Uuid::new_v4());
            workers.push(ConsumerWorker::spawn(
                self.broker.clone(),
                self.registry.clone(),
                self.dlq.clone(),
                self.audit.clone(),
                group.to_string(),
                consumer_name,
                self.shutdown.clone(),
            ));
        }
        active.insert(group.to_string());
        info!(group, workers = worker_count, "consumer group started");
        Ok(())
    }

    /// Shape of the main, dead-letter and audit streams.
    pub async fn get_stream_info(&self) -> Result<HashMap<String, StreamInfo>> {
        self.inspector.get_stream_info().await
    }

    /// Liveness probe against the backend.
    pub async fn health_check(&self) -> Result<()> {
        self.broker.transport().await?.ping().await
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

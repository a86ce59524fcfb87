use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::envelope::{EventEnvelope, EventKind};

/// Consumer-side callback attached to an event kind.
///
/// Handlers must tolerate redelivery: the bus guarantees at-least-once,
/// so the same envelope can arrive again after a crash or a claim. A
/// returned error is logged and counted but never retried by the bus and
/// never blocks the other handlers for the same entry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs when this handler fails.
    fn name(&self) -> &str {
        "unnamed"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Event kind to ordered handler list, shared by every consumer group in
/// the process.
///
/// The consumer group chosen at subscribe time only picks which delivery
/// cursor feeds the workers; it does not scope the handler list. With two
/// active groups on the same stream, each group's workers dispatch the same
/// handlers, so a handler runs once per group per matching entry.
///
/// Registration is expected to finish before workers start pulling
/// traffic. The map itself is safe for concurrent use, but a handler
/// registered after steady-state traffic begins simply misses the entries
/// dispatched before it appeared.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: DashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Append a handler; dispatch follows registration order.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(&kind)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|entry| entry.len()).unwrap_or(0)
    }
}

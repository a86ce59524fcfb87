use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditOperation, AuditRecorder};
use crate::broker::BrokerHandle;
use crate::envelope::EventEnvelope;
use crate::error::{EventBusError, Result};
use crate::scrub::Scrub;

/// Publish path: stamp, flatten, scrub, append, audit.
///
/// Scrubbing sits between flattening and the append so nothing the caller
/// put in the envelope reaches the wire unredacted, including the copy the
/// audit stream keeps. Only the caller-authored fields pass through the
/// scrubber: redaction patterns can fire inside machine-generated values
/// (an all-digit UUID segment parses as a card number), and a mangled
/// `event_id` would poison the entry.
pub struct Publisher {
    broker: Arc<BrokerHandle>,
    audit: Arc<AuditRecorder>,
    scrubber: Arc<dyn Scrub>,
}

impl Publisher {
    pub fn new(
        broker: Arc<BrokerHandle>,
        audit: Arc<AuditRecorder>,
        scrubber: Arc<dyn Scrub>,
    ) -> Self {
        Self {
            broker,
            audit,
            scrubber,
        }
    }

    /// Append one envelope to the main stream, returning the assigned
    /// entry id.
    ///
    /// An explicit `correlation_id` wins over one already on the envelope;
    /// with neither, a fresh one is generated so every entry can be traced.
    /// Failing to reach the stream is an error; failing to audit is not.
    pub async fn publish(
        &self,
        mut envelope: EventEnvelope,
        correlation_id: Option<&str>,
    ) -> Result<String> {
        let transport = self.broker.transport().await?;
        let config = self.broker.config();
        let names = self.broker.names();

        if let Some(correlation) = correlation_id {
            envelope.correlation_id = Some(correlation.to_string());
        }
        if envelope.correlation_id.is_none() {
            envelope.correlation_id = Some(Uuid::new_v4().to_string());
        }
        envelope.environment = config.environment.clone();
        envelope.published_at = Some(Utc::now());

        let mut fields = envelope
            .to_fields()
            .map_err(|e| EventBusError::Publish(e.to_string()))?;
        // stamped ids and timestamps must reach the wire verbatim
        let mut content = HashMap::with_capacity(3);
        for key in ["resource_type", "resource_id", "metadata"] {
            if let Some(value) = fields.remove(key) {
                content.insert(key.to_string(), value);
            }
        }
        fields.extend(self.scrubber.scrub(content));

        let entry_id = transport
            .append(&names.main, config.main_maxlen, &fields)
            .await
            .map_err(|e| EventBusError::Publish(e.to_string()))?;

        counter!("event_bus_published_total").increment(1);
        debug!(
            entry_id = %entry_id,
            event_id = %envelope.event_id,
            event_type = envelope.event_type.as_str(),
            resource_type = %envelope.resource_type,
            "event published"
        );

        // the audit copy of the metadata is the scrubbed wire form
        let metadata = fields
            .get("metadata")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);
        let correlation = envelope.correlation_id.clone().unwrap_or_default();
        self.audit
            .record(
                AuditOperation::Publish,
                envelope.event_type,
                &envelope.event_id.to_string(),
                &correlation,
                metadata,
            )
            .await;

        Ok(entry_id)
    }
}

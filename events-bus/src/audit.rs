use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::BrokerHandle;
use crate::envelope::EventKind;
use crate::error::Result;

/// Bus operations that leave an audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// An envelope was appended to the main stream.
    Publish,
    /// A consumer group finished dispatching an entry and acknowledged it.
    Process,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Process => "process",
        }
    }
}

/// Best-effort writer for the capped audit stream.
///
/// A failed audit write never fails the operation being audited: it is
/// logged, counted, and dropped. Compliance reporting that needs loss-free
/// records belongs in the database write path, not here.
pub struct AuditRecorder {
    broker: Arc<BrokerHandle>,
}

impl AuditRecorder {
    pub fn new(broker: Arc<BrokerHandle>) -> Self {
        Self { broker }
    }

    /// Append one audit record. `metadata` must already be scrubbed; this
    /// writer does not redact.
    pub async fn record(
        &self,
        operation: AuditOperation,
        event_type: EventKind,
        event_id: &str,
        correlation_id: &str,
        metadata: serde_json::Value,
    ) {
        let outcome = self
            .try_record(operation, event_type, event_id, correlation_id, metadata)
            .await;
        if let Err(e) = outcome {
            counter!("event_bus_audit_dropped_total").increment(1);
            warn!(
                operation = operation.as_str(),
                event_id,
                error = %e,
                "audit record dropped"
            );
        }
    }

    async fn try_record(
        &self,
        operation: AuditOperation,
        event_type: EventKind,
        event_id: &str,
        correlation_id: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let transport = self.broker.transport().await?;
        let names = self.broker.names();
        let config = self.broker.config();

        let mut fields = HashMap::with_capacity(7);
        fields.insert("operation".to_string(), operation.as_str().to_string());
        fields.insert("event_type".to_string(), event_type.as_str().to_string());
        fields.insert("event_id".to_string(), event_id.to_string());
        fields.insert("correlation_id".to_string(), correlation_id.to_string());
        fields.insert("environment".to_string(), config.environment.clone());
        fields.insert("timestamp".to_string(), Utc::now().to_rfc3339());
        fields.insert("metadata".to_string(), metadata.to_string());

        transport
            .append(&names.audit, config.audit_maxlen, &fields)
            .await?;
        Ok(())
    }
}

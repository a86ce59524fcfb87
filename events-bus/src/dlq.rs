use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::warn;

use crate::broker::BrokerHandle;
use crate::error::Result;

/// Routes poison entries to the capped dead-letter stream.
///
/// An entry is poison when its field map cannot be rebuilt into a valid
/// envelope. The original fields are preserved verbatim alongside the
/// failure reason and the entry's id on the main stream, so an operator can
/// line the two up. Handler failures are not poison and never land here.
///
/// Writes are best-effort: if the dead-letter append itself fails the
/// entry is still acknowledged, the loss is logged and counted.
pub struct DeadLetterRouter {
    broker: Arc<BrokerHandle>,
}

impl DeadLetterRouter {
    pub fn new(broker: Arc<BrokerHandle>) -> Self {
        Self { broker }
    }

    pub async fn route(
        &self,
        original_msg_id: &str,
        fields: &HashMap<String, String>,
        error: &str,
    ) {
        match self.try_route(original_msg_id, fields, error).await {
            Ok(dlq_id) => {
                counter!("event_bus_dead_lettered_total").increment(1);
                warn!(
                    original_msg_id,
                    dlq_id = %dlq_id,
                    error,
                    "entry routed to dead-letter stream"
                );
            }
            Err(e) => {
                counter!("event_bus_dlq_dropped_total").increment(1);
                warn!(original_msg_id, error = %e, "dead-letter write dropped");
            }
        }
    }

    async fn try_route(
        &self,
        original_msg_id: &str,
        fields: &HashMap<String, String>,
        error: &str,
    ) -> Result<String> {
        let transport = self.broker.transport().await?;
        let names = self.broker.names();
        let config = self.broker.config();

        let mut dead = fields.clone();
        dead.insert("original_msg_id".to_string(), original_msg_id.to_string());
        dead.insert("error".to_string(), error.to_string());
        dead.insert("dlq_timestamp".to_string(), Utc::now().to_rfc3339());

        transport.append(&names.dlq, config.dlq_maxlen, &dead).await
    }
}

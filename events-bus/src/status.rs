use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::BrokerHandle;
use crate::error::Result;
use crate::transport::StreamInfo;

/// Read-only introspection over the bus's three streams, for health
/// endpoints and operator tooling.
pub struct StatusInspector {
    broker: Arc<BrokerHandle>,
}

impl StatusInspector {
    pub fn new(broker: Arc<BrokerHandle>) -> Self {
        Self { broker }
    }

    /// Shape of the main, dead-letter and audit streams, keyed by stream
    /// name. Streams that have never been written report `exists: false`
    /// rather than an error; an unreachable broker is an error.
    pub async fn get_stream_info(&self) -> Result<HashMap<String, StreamInfo>> {
        let transport = self.broker.transport().await?;
        let names = self.broker.names();

        let mut info = HashMap::with_capacity(3);
        for stream in [&names.main, &names.dlq, &names.audit] {
            info.insert(stream.clone(), transport.stream_info(stream).await?);
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::error::EventBusError;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::StreamTransport;

    #[tokio::test]
    async fn test_info_covers_all_three_streams() {
        let transport = Arc::new(MemoryTransport::new());
        let broker = Arc::new(BrokerHandle::with_transport(
            BusConfig::default().with_environment("test"),
            transport.clone(),
        ));
        let mut fields = HashMap::new();
        fields.insert("k".to_string(), "v".to_string());
        transport
            .append(&broker.names().main, 100, &fields)
            .await
            .expect("append");

        let inspector = StatusInspector::new(broker.clone());
        let info = inspector.get_stream_info().await.expect("info");
        assert_eq!(info.len(), 3);
        assert!(info[&broker.names().main].exists);
        assert_eq!(info[&broker.names().main].length, 1);
        assert!(!info[&broker.names().dlq].exists);
        assert!(!info[&broker.names().audit].exists);
    }

    #[tokio::test]
    async fn test_info_requires_connection() {
        let inspector = StatusInspector::new(Arc::new(BrokerHandle::new(BusConfig::default())));
        assert!(matches!(
            inspector.get_stream_info().await,
            Err(EventBusError::NotConnected)
        ));
    }
}

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::BusConfig;
use crate::error::{EventBusError, Result};
use crate::transport::redis::RedisTransport;
use crate::transport::StreamTransport;

/// The three stream names one bus instance works with, derived from the
/// configured prefix and environment so deployments sharing a Redis never
/// cross feeds.
#[derive(Debug, Clone)]
pub struct StreamNames {
    /// Main event stream, e.g. `events:prod`.
    pub main: String,
    /// Dead-letter stream, e.g. `events:dlq:prod`.
    pub dlq: String,
    /// Audit stream, e.g. `events:audit:prod`.
    pub audit: String,
}

impl StreamNames {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            main: format!("{}:{}", config.stream_prefix, config.environment),
            dlq: format!("{}:dlq:{}", config.stream_prefix, config.environment),
            audit: format!("{}:audit:{}", config.stream_prefix, config.environment),
        }
    }
}

/// Owns the transport connection slot. Every other bus component reaches
/// the backend through this handle, so "not connected" surfaces uniformly
/// as [`EventBusError::NotConnected`].
pub struct BrokerHandle {
    config: BusConfig,
    names: StreamNames,
    transport: RwLock<Option<Arc<dyn StreamTransport>>>,
    injected: Option<Arc<dyn StreamTransport>>,
}

impl BrokerHandle {
    pub fn new(config: BusConfig) -> Self {
        let names = StreamNames::from_config(&config);
        Self {
            config,
            names,
            transport: RwLock::new(None),
            injected: None,
        }
    }

    /// Handle over a pre-built transport, already "connected". Used for the
    /// in-memory backend and tests. [`BrokerHandle::connect`] after a
    /// release reinstalls the same transport.
    pub fn with_transport(config: BusConfig, transport: Arc<dyn StreamTransport>) -> Self {
        let names = StreamNames::from_config(&config);
        Self {
            config,
            names,
            transport: RwLock::new(Some(transport.clone())),
            injected: Some(transport),
        }
    }

    /// Establish the connection. Calling this while connected is a no-op.
    /// A handle built over a pre-wired transport reconnects to that
    /// transport; otherwise a fresh Redis connection is made.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.transport.write().await;
        if slot.is_some() {
            debug!("broker already connected");
            return Ok(());
        }
        *slot = match &self.injected {
            Some(transport) => Some(transport.clone()),
            None => Some(Arc::new(RedisTransport::connect(&self.config).await?)),
        };
        info!(
            environment = %self.config.environment,
            stream = %self.names.main,
            "event bus connected"
        );
        Ok(())
    }

    /// Drop the connection. Consumer workers must already be stopped;
    /// in-flight clones of the transport remain usable until they finish.
    pub async fn release(&self) {
        let mut slot = self.transport.write().await;
        if slot.take().is_some() {
            info!("event bus connection released");
        }
    }

    /// Current transport, or [`EventBusError::NotConnected`].
    pub async fn transport(&self) -> Result<Arc<dyn StreamTransport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or(EventBusError::NotConnected)
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.read().await.is_some()
    }

    pub fn names(&self) -> &StreamNames {
        &self.names
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;

    #[test]
    fn test_stream_names_carry_prefix_and_environment() {
        let config = BusConfig::default()
            .with_stream_prefix("carebus")
            .with_environment("prod");
        let names = StreamNames::from_config(&config);
        assert_eq!(names.main, "carebus:prod");
        assert_eq!(names.dlq, "carebus:dlq:prod");
        assert_eq!(names.audit, "carebus:audit:prod");
    }

    #[tokio::test]
    async fn test_transport_before_connect_is_an_error() {
        let broker = BrokerHandle::new(BusConfig::default());
        assert!(!broker.is_connected().await);
        assert!(matches!(
            broker.transport().await,
            Err(EventBusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let broker = BrokerHandle::with_transport(
            BusConfig::default(),
            Arc::new(MemoryTransport::new()),
        );
        assert!(broker.is_connected().await);
        broker.release().await;
        broker.release().await;
        assert!(!broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_injected_transport_survives_reconnect() {
        let transport: Arc<dyn StreamTransport> = Arc::new(MemoryTransport::new());
        let broker = BrokerHandle::with_transport(BusConfig::default(), transport.clone());
        broker.release().await;
        assert!(!broker.is_connected().await);

        broker.connect().await.expect("reconnect");
        let current = broker.transport().await.expect("transport");
        assert!(Arc::ptr_eq(&current, &transport));
    }
}

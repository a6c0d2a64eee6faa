use crate::config::CommConfig;
use crate::error::Result;
use crate::registry::TransportRegistry;
use crate::transport::{MemBroker, MemTransport, Transport, TransportKind};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(not(all(unix, feature = "amqp")))]
use crate::error::CommError;
#[cfg(not(all(unix, feature = "amqp")))]
use anyhow::anyhow;

/// Process-scoped home for everything comms share: the tuning config, the
/// registry of live transport handles, and broker state for the in-process
/// and AMQP backends.
///
/// A process normally builds one context and hands `Arc` clones to every
/// comm. Tests build their own, which keeps their queues and registries
/// fully isolated from each other.
pub struct CommContext {
    config: CommConfig,
    registry: TransportRegistry,
    mem: Arc<MemBroker>,
    #[cfg(feature = "amqp")]
    amqp: Arc<crate::transport::AmqpPool>,
}

impl CommContext {
    /// Context with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(CommConfig::default())
    }

    pub fn with_config(config: CommConfig) -> Arc<Self> {
        #[cfg(feature = "amqp")]
        let amqp = Arc::new(crate::transport::AmqpPool::new(&config.amqp_url));
        Arc::new(Self {
            registry: TransportRegistry::new(),
            mem: Arc::new(MemBroker::new()),
            #[cfg(feature = "amqp")]
            amqp,
            config,
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    /// Create a brand-new transport resource of the given kind and register
    /// its handle.
    pub async fn create_transport(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match kind {
            #[cfg(unix)]
            TransportKind::SysvQueue => Arc::new(
                crate::transport::SysvQueueTransport::create_new(self.config.max_payload).await?,
            ),
            #[cfg(not(unix))]
            TransportKind::SysvQueue => {
                return Err(CommError::Backend(anyhow!(
                    "System V queues are not supported on this platform"
                )))
            }
            TransportKind::Memory => Arc::new(MemTransport::create_new(
                Arc::clone(&self.mem),
                self.config.mem_capacity,
                self.config.max_payload,
                self.config.poll_interval,
            )),
            #[cfg(feature = "amqp")]
            TransportKind::Amqp => Arc::new(
                crate::transport::AmqpTransport::create_new(
                    Arc::clone(&self.amqp),
                    self.config.max_payload,
                )
                .await?,
            ),
            #[cfg(not(feature = "amqp"))]
            TransportKind::Amqp => {
                return Err(CommError::Backend(anyhow!(
                    "this build does not include the amqp feature"
                )))
            }
        };
        Ok(self.registry.insert(transport))
    }

    /// Attach to an existing resource by key. The registry is consulted
    /// first so a key attaches to the already-live handle when this process
    /// holds one. `Ok(None)` means no such resource exists.
    pub async fn attach_transport(
        &self,
        kind: TransportKind,
        key: &str,
    ) -> Result<Option<Arc<dyn Transport>>> {
        if let Some(existing) = self.registry.get(key) {
            return Ok(Some(existing));
        }
        let attached: Option<Arc<dyn Transport>> = match kind {
            #[cfg(unix)]
            TransportKind::SysvQueue => {
                crate::transport::SysvQueueTransport::attach(key, self.config.max_payload)
                    .await?
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
            }
            #[cfg(not(unix))]
            TransportKind::SysvQueue => {
                return Err(CommError::Backend(anyhow!(
                    "System V queues are not supported on this platform"
                )))
            }
            TransportKind::Memory => MemTransport::attach(
                Arc::clone(&self.mem),
                key,
                self.config.max_payload,
                self.config.poll_interval,
            )
            .map(|t| Arc::new(t) as Arc<dyn Transport>),
            #[cfg(feature = "amqp")]
            TransportKind::Amqp => Some(Arc::new(
                crate::transport::AmqpTransport::attach(
                    Arc::clone(&self.amqp),
                    key,
                    self.config.max_payload,
                )
                .await?,
            ) as Arc<dyn Transport>),
            #[cfg(not(feature = "amqp"))]
            TransportKind::Amqp => {
                return Err(CommError::Backend(anyhow!(
                    "this build does not include the amqp feature"
                )))
            }
        };
        Ok(attached.map(|t| self.registry.insert(t)))
    }

    /// Force-remove every live transport and empty the registry.
    ///
    /// Meant for teardown sweeps; comms still holding one of these
    /// transports observe it as gone afterwards.
    pub async fn shutdown(&self) {
        for key in self.registry.keys() {
            let Ok(transport) = self.registry.unregister(&key) else {
                continue;
            };
            match transport.remove().await {
                Ok(outcome) => debug!("Shutdown removed transport '{}': {:?}", key, outcome),
                Err(e) => warn!("Shutdown failed to remove transport '{}': {}", key, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_registers_handle() {
        let ctx = CommContext::new();
        let transport = ctx.create_transport(TransportKind::Memory).await.unwrap();

        assert_eq!(ctx.registry().len(), 1);
        assert!(transport.key().starts_with("mem-"));
    }

    #[tokio::test]
    async fn test_attach_reuses_live_handle() {
        let ctx = CommContext::new();
        let created = ctx.create_transport(TransportKind::Memory).await.unwrap();
        let attached = ctx
            .attach_transport(TransportKind::Memory, created.key())
            .await
            .unwrap()
            .expect("resource exists");

        assert!(Arc::ptr_eq(&created, &attached));
        assert_eq!(ctx.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_unknown_key_finds_nothing() {
        let ctx = CommContext::new();
        let attached = ctx
            .attach_transport(TransportKind::Memory, "mem-no-such-queue")
            .await
            .unwrap();
        assert!(attached.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_sweeps_everything() {
        let ctx = CommContext::new();
        let a = ctx.create_transport(TransportKind::Memory).await.unwrap();
        let _b = ctx.create_transport(TransportKind::Memory).await.unwrap();
        assert_eq!(ctx.registry().len(), 2);

        ctx.shutdown().await;
        assert!(ctx.registry().is_empty());
        // Handles held across shutdown observe the resource as gone.
        assert_eq!(a.pending().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let one = CommContext::new();
        let two = CommContext::new();
        let created = one.create_transport(TransportKind::Memory).await.unwrap();

        let attached = two
            .attach_transport(TransportKind::Memory, created.key())
            .await
            .unwrap();
        assert!(attached.is_none());
    }
}

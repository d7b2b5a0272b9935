use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether::client::BrokerClient;
use tether_broker::registry::Ownership;
use tether_broker::{Broker, BrokerConfig, InMemoryRegistry};

/// A broker on a random loopback port with its own in-memory registry.
pub struct TestBroker {
    pub broker: Broker,
    pub registry: Arc<InMemoryRegistry>,
    pub addr: SocketAddr,
}

impl TestBroker {
    /// Spawn with the production liveness window.
    pub async fn spawn(resources: &[&str]) -> Result<Self> {
        Self::spawn_with(test_config(), resources).await
    }

    /// Spawn with a short liveness window so eviction can be observed quickly.
    pub async fn spawn_with_liveness(window: Duration, resources: &[&str]) -> Result<Self> {
        let config = BrokerConfig {
            liveness_window_ms: window.as_millis() as u64,
            sweep_interval_ms: 20,
            ..test_config()
        };
        Self::spawn_with(config, resources).await
    }

    pub async fn spawn_with(config: BrokerConfig, resources: &[&str]) -> Result<Self> {
        crate::init_tracing();
        let registry = Arc::new(InMemoryRegistry::with_resources(resources.iter().copied()));
        let broker = Broker::new(config, registry.clone());
        let addr = broker.start().await.context("failed to start broker")?;
        Ok(Self {
            broker,
            registry,
            addr,
        })
    }

    /// Connect a new client session.
    pub async fn client(&self) -> Result<BrokerClient> {
        BrokerClient::connect(self.addr).await
    }

    /// Current ownership of a resource; panics if it doesn't exist.
    pub fn ownership(&self, resource: &str) -> Ownership {
        self.registry
            .snapshot()
            .into_iter()
            .find(|r| r.name == resource)
            .map(|r| Ownership {
                owner: r.owner,
                generation: r.generation,
            })
            .unwrap_or_else(|| panic!("unknown resource {resource}"))
    }

    pub fn generation(&self, resource: &str) -> u64 {
        self.ownership(resource).generation
    }

    pub fn is_owned(&self, resource: &str) -> bool {
        self.ownership(resource).owner.is_some()
    }
}

fn test_config() -> BrokerConfig {
    BrokerConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..BrokerConfig::default()
    }
}

//! Assembled engine: one explicitly constructed service object owning the registry,
//! cabinet, load balancer, executor, and PASS broker.

use crate::cabinet::Cabinet;
use crate::capsule::{Capsule, CapsuleResult};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{CapsuleExecutor, Collaborators};
use crate::load_balancer::LoadBalancer;
use crate::pass_broker::PassBroker;
use crate::registry::BackendRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Engine {
    executor: Arc<CapsuleExecutor>,
    broker: PassBroker,
    balancer: Arc<LoadBalancer>,
    registry: Arc<BackendRegistry>,
}

impl Engine {
    /// Validate `config`, form the cabinet (embeds every Minister once), and wire the
    /// components together.
    pub async fn build(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = Arc::new(config.registry()?);
        let cabinet = Arc::new(
            Cabinet::form(&registry, Arc::clone(&collaborators.embedder), config.cabinet.clone()).await?,
        );
        let balancer = Arc::new(LoadBalancer::new(
            config.nodes.clone(),
            Arc::clone(&collaborators.backend),
            Arc::clone(&collaborators.resources),
            config.timeouts.health(),
        ));
        let executor = Arc::new(CapsuleExecutor::new(
            Arc::clone(&registry),
            cabinet,
            Arc::clone(&balancer),
            &collaborators,
            config.executor_settings(),
        ));
        let broker = PassBroker::new(Arc::clone(&executor), config.pass.clone());
        info!(
            target: "capsule::engine",
            profiles = registry.len(),
            nodes = config.nodes.len(),
            max_depth = config.pass.max_depth,
            ministers = ?executor.cabinet().minister_titles(),
            "Engine ready"
        );
        Ok(Self {
            executor,
            broker,
            balancer,
            registry,
        })
    }

    /// Execute `capsule` and, when the pass comes back blocked, run PASS resolution.
    pub async fn submit(&self, capsule: &Capsule, cancel: &CancellationToken) -> CapsuleResult {
        let first = self.executor.execute(capsule, cancel).await;
        if first.blocked {
            self.broker.resolve(capsule, first, cancel).await
        } else {
            first
        }
    }

    pub fn executor(&self) -> &CapsuleExecutor {
        &self.executor
    }

    pub fn broker(&self) -> &PassBroker {
        &self.broker
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }
}

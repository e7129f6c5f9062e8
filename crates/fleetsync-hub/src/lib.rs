pub mod aggregate;
pub mod config;
pub mod identity;
pub mod inventory;
pub mod logging;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;
pub mod stuck;
pub mod testing;
pub mod throttle;

use crate::aggregate::AggregationEngine;
use crate::config::HubConfig;
use crate::identity::{resolver_from_config, IdentityResolver};
use crate::provider::TopologyProvider;
use crate::registry::ConnectionRegistry;
use crate::retry::{RetryPolicy, RetryingProvider};
use crate::session::SessionContext;
use crate::throttle::AdaptiveIntervalController;
use std::sync::Arc;

/// Process-wide state: one aggregation engine, one interval controller and
/// one registry shared by every channel.
pub struct Hub {
    engine: Arc<AggregationEngine>,
    controller: Arc<AdaptiveIntervalController>,
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<dyn IdentityResolver>,
}

impl Hub {
    /// Wires the hub around a raw provider. Provider calls are retried per
    /// `config.retry`.
    pub fn new(config: &HubConfig, provider: Arc<dyn TopologyProvider>) -> Self {
        let retrying: Arc<dyn TopologyProvider> = Arc::new(RetryingProvider::new(
            provider,
            RetryPolicy::from(&config.retry),
        ));
        let engine = Arc::new(AggregationEngine::from_config(retrying, config));
        let controller = Arc::new(AdaptiveIntervalController::new(config.throttle.clone()));
        let context = SessionContext {
            engine: engine.clone(),
            controller: controller.clone(),
            allowed_intervals: Arc::from(config.intervals.allowed.as_slice()),
        };
        Self {
            engine,
            controller,
            registry: Arc::new(ConnectionRegistry::new(context)),
            resolver: resolver_from_config(config),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn controller(&self) -> &Arc<AdaptiveIntervalController> {
        &self.controller
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<dyn IdentityResolver> {
        &self.resolver
    }
}

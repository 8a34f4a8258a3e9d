use rg_risk::{CircuitBreakerManager, DynamicRiskLimits};
use rg_store::{ConnectionManager, StoreConnector};
use rg_types::{EventEmitter, RgResult, RiskGateConfig, MARKET_DATA_BREAKER};
use std::sync::Arc;
use tracing::info;

use crate::timer::AdaptiveTimer;

/// Shared components built once at startup and handed to the manager.
#[derive(Debug)]
pub struct RiskGateContext {
    pub config: RiskGateConfig,
    pub connections: Arc<ConnectionManager>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub timer: Arc<AdaptiveTimer>,
    pub limits: Arc<DynamicRiskLimits>,
    pub events: EventEmitter,
}

impl RiskGateContext {
    /// Validate `config` and wire every component. Fails only on
    /// configuration errors.
    pub fn new(
        config: RiskGateConfig,
        connector: Arc<dyn StoreConnector>,
        events: EventEmitter,
    ) -> RgResult<Self> {
        config.validate()?;

        let connections = Arc::new(ConnectionManager::new(connector, config.store.clone()));
        let breakers = Arc::new(CircuitBreakerManager::with_defaults(
            config.breakers.clone(),
            events.clone(),
        ));
        let timer = Arc::new(AdaptiveTimer::new(&config.timing, events.clone()));
        let limits = Arc::new(DynamicRiskLimits::new(
            &config.limits,
            connections.clone(),
            breakers.get_or_create(MARKET_DATA_BREAKER),
            events.clone(),
        )?);

        info!(
            workers = config.balancer.num_workers,
            strategy = %config.balancer.routing_strategy,
            strategies = config.limits.base_limits.len(),
            "RiskGate context initialized"
        );

        Ok(Self {
            config,
            connections,
            breakers,
            timer,
            limits,
            events,
        })
    }
}

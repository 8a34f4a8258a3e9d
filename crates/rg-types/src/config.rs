//! Structured configuration for every RiskGate component.
//!
//! All sections deserialize with defaults so a config file only needs to
//! name what it overrides. [`RiskGateConfig::validate`] must pass before any
//! component is started.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config_error;
use crate::errors::{RgError, RgResult};
use crate::limits::{default_base_limits, default_safety_bounds, RiskLimitSet, SafetyBounds};
use crate::request::{RequestPriority, StrategyType};

/// Breaker names the pipeline creates at startup.
pub const MARKET_DATA_BREAKER: &str = "market_data";
pub const FAST_VALIDATION_BREAKER: &str = "fast_validation";
pub const COMPREHENSIVE_VALIDATION_BREAKER: &str = "comprehensive_validation";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskGateConfig {
    pub store: StoreConfig,
    pub limits: LimitsConfig,
    pub timing: TimingConfig,
    pub balancer: BalancerConfig,
    pub breakers: BreakersConfig,
    pub manager: ManagerConfig,
    pub checks: ChecksConfig,
}

impl RiskGateConfig {
    pub fn from_json_str(json: &str) -> RgResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RgResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self) -> RgResult<()> {
        self.limits.validate()?;
        self.timing.validate()?;
        self.balancer.validate()?;
        self.breakers.validate()?;
        self.manager.validate()?;
        Ok(())
    }
}

/// Connection Manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub health_check_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            health_check_timeout_ms: 500,
        }
    }
}

/// `value > upper ⇒ above_factor`, `value < lower ⇒ below_factor`, else 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorRule {
    pub upper: Decimal,
    pub lower: Decimal,
    pub above_factor: Decimal,
    pub below_factor: Decimal,
}

impl FactorRule {
    pub fn factor(&self, value: Decimal) -> Decimal {
        if value > self.upper {
            self.above_factor
        } else if value < self.lower {
            self.below_factor
        } else {
            Decimal::ONE
        }
    }

    fn validate(&self, name: &str) -> RgResult<()> {
        let range = Decimal::new(6, 1)..=Decimal::new(12, 1);
        if self.lower > self.upper {
            return Err(config_error!(
                "{name} adjustment: lower threshold {} above upper {}",
                self.lower,
                self.upper
            ));
        }
        if !range.contains(&self.above_factor) || !range.contains(&self.below_factor) {
            return Err(config_error!(
                "{name} adjustment factors must lie in [0.6, 1.2]"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentThresholds {
    /// Applied to current / historical volatility
    pub volatility: FactorRule,
    /// Applied to the liquidity score
    pub liquidity: FactorRule,
    /// Applied to portfolio correlation
    pub correlation: FactorRule,
}

impl Default for AdjustmentThresholds {
    fn default() -> Self {
        Self {
            volatility: FactorRule {
                upper: Decimal::new(15, 1),
                lower: Decimal::new(7, 1),
                above_factor: Decimal::new(7, 1),
                below_factor: Decimal::new(12, 1),
            },
            liquidity: FactorRule {
                upper: Decimal::new(9, 1),
                lower: Decimal::new(5, 1),
                above_factor: Decimal::new(11, 1),
                below_factor: Decimal::new(6, 1),
            },
            correlation: FactorRule {
                upper: Decimal::new(7, 1),
                lower: Decimal::new(2, 1),
                above_factor: Decimal::new(8, 1),
                below_factor: Decimal::new(11, 1),
            },
        }
    }
}

/// Dynamic Risk Limits settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub cache_ttl_ms: u64,
    pub max_cache_size: usize,
    pub base_limits: HashMap<String, RiskLimitSet>,
    pub safety_bounds: HashMap<String, SafetyBounds>,
    /// Table entry used for strategies without their own
    pub fallback_strategy: String,
    pub adjustments: AdjustmentThresholds,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 300_000,
            max_cache_size: 1_000,
            base_limits: default_base_limits(),
            safety_bounds: default_safety_bounds(),
            fallback_strategy: "htf".to_string(),
            adjustments: AdjustmentThresholds::default(),
        }
    }
}

impl LimitsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Table key for `strategy`, falling back to `fallback_strategy`.
    pub fn table_key<'a>(&'a self, strategy: &'a StrategyType) -> &'a str {
        let key = strategy.as_str();
        if self.base_limits.contains_key(key) {
            key
        } else {
            &self.fallback_strategy
        }
    }

    pub fn validate(&self) -> RgResult<()> {
        if self.max_cache_size == 0 {
            return Err(config_error!("limits.max_cache_size must be positive"));
        }
        if !self.base_limits.contains_key(&self.fallback_strategy) {
            return Err(config_error!(
                "fallback strategy '{}' has no base limits",
                self.fallback_strategy
            ));
        }
        for (strategy, base) in &self.base_limits {
            let bounds = self.safety_bounds.get(strategy).ok_or_else(|| {
                config_error!("strategy '{strategy}' has base limits but no safety bounds")
            })?;
            if let Some(field) = bounds.first_malformed() {
                return Err(config_error!(
                    "malformed safety bound '{field}' for strategy '{strategy}'"
                ));
            }
            let values = [
                base.max_position_size,
                base.max_leverage,
                base.stop_loss,
                base.max_drawdown,
            ];
            if values.iter().any(|v| v.is_sign_negative()) {
                return Err(config_error!("negative base limit for strategy '{strategy}'"));
            }
        }
        self.adjustments.volatility.validate("volatility")?;
        self.adjustments.liquidity.validate("liquidity")?;
        self.adjustments.correlation.validate("correlation")?;
        Ok(())
    }
}

/// Adaptive Timer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub fast_target_ms: f64,
    pub comprehensive_target_ms: f64,
    pub adjustment_factor: f64,
    pub max_history: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            fast_target_ms: 50.0,
            comprehensive_target_ms: 500.0,
            adjustment_factor: 0.1,
            max_history: 100,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> RgResult<()> {
        if !(self.fast_target_ms > 0.0 && self.comprehensive_target_ms > 0.0) {
            return Err(config_error!("timing targets must be positive"));
        }
        if !(self.adjustment_factor > 0.0 && self.adjustment_factor <= 1.0) {
            return Err(config_error!("timing.adjustment_factor must lie in (0, 1]"));
        }
        Ok(())
    }
}

/// Worker-pool routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    FastestWorker,
    PriorityBased,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::LeastLoaded => "least_loaded",
            RoutingStrategy::FastestWorker => "fastest_worker",
            RoutingStrategy::PriorityBased => "priority_based",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = RgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(RoutingStrategy::RoundRobin),
            "least_loaded" => Ok(RoutingStrategy::LeastLoaded),
            "fastest_worker" => Ok(RoutingStrategy::FastestWorker),
            "priority_based" => Ok(RoutingStrategy::PriorityBased),
            other => Err(config_error!("unknown routing strategy: {other}")),
        }
    }
}

/// Load Balancer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub num_workers: usize,
    pub max_queue_size: usize,
    pub routing_strategy: RoutingStrategy,
    /// Samples kept for each worker's rolling average latency
    pub latency_window: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_queue_size: 1_000,
            routing_strategy: RoutingStrategy::PriorityBased,
            latency_window: 1_000,
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> RgResult<()> {
        if self.num_workers == 0 {
            return Err(config_error!("balancer.num_workers must be positive"));
        }
        if self.max_queue_size == 0 {
            return Err(config_error!("balancer.max_queue_size must be positive"));
        }
        if self.latency_window == 0 {
            return Err(config_error!("balancer.latency_window must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_ms,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, 60_000)
    }
}

/// Per-name circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakersConfig(pub HashMap<String, BreakerConfig>);

impl Default for BreakersConfig {
    fn default() -> Self {
        Self(HashMap::from([
            (MARKET_DATA_BREAKER.to_string(), BreakerConfig::new(5, 30_000)),
            (FAST_VALIDATION_BREAKER.to_string(), BreakerConfig::new(5, 30_000)),
            (
                COMPREHENSIVE_VALIDATION_BREAKER.to_string(),
                BreakerConfig::new(5, 60_000),
            ),
        ]))
    }
}

impl BreakersConfig {
    /// Settings for `name`, or the defaults when not configured.
    pub fn get(&self, name: &str) -> BreakerConfig {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn validate(&self) -> RgResult<()> {
        for (name, breaker) in &self.0 {
            if breaker.failure_threshold == 0 {
                return Err(config_error!("breaker '{name}' needs a positive failure threshold"));
            }
        }
        Ok(())
    }
}

/// Streamlined Risk Manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub submission_queue_size: usize,
    pub monitor_interval_ms: u64,
    /// Finished request records older than this are pruned
    pub result_retention_ms: u64,
    pub ultra_high_timeout_ms: u64,
    pub high_timeout_ms: u64,
    pub medium_timeout_ms: u64,
    pub low_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            submission_queue_size: 10_000,
            monitor_interval_ms: 5_000,
            result_retention_ms: 300_000,
            ultra_high_timeout_ms: 500,
            high_timeout_ms: 1_000,
            medium_timeout_ms: 5_000,
            low_timeout_ms: 10_000,
        }
    }
}

impl ManagerConfig {
    pub fn timeout_for(&self, priority: RequestPriority) -> Duration {
        let ms = match priority {
            RequestPriority::UltraHigh => self.ultra_high_timeout_ms,
            RequestPriority::High => self.high_timeout_ms,
            RequestPriority::Medium => self.medium_timeout_ms,
            RequestPriority::Low => self.low_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> RgResult<()> {
        if self.submission_queue_size == 0 {
            return Err(config_error!("manager.submission_queue_size must be positive"));
        }
        if self.monitor_interval_ms == 0 {
            return Err(config_error!("manager.monitor_interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Thresholds for the comprehensive-only checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// Existing exposure plus the new position, as a fraction of portfolio
    pub max_portfolio_exposure: Decimal,
    pub max_volatility_ratio: Decimal,
    pub min_liquidity_score: Decimal,
    pub max_portfolio_correlation: Decimal,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            max_portfolio_exposure: Decimal::ONE,
            max_volatility_ratio: Decimal::new(25, 1),
            min_liquidity_score: Decimal::new(3, 1),
            max_portfolio_correlation: Decimal::new(85, 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Bound;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_is_valid() {
        RiskGateConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = RiskGateConfig::from_json_str(
            r#"{"balancer": {"num_workers": 8, "routing_strategy": "least_loaded"}}"#,
        )
        .unwrap();
        assert_eq!(config.balancer.num_workers, 8);
        assert_eq!(config.balancer.max_queue_size, 1_000);
        assert_eq!(config.balancer.routing_strategy, RoutingStrategy::LeastLoaded);
        assert_eq!(config.limits.cache_ttl_ms, 300_000);
    }

    #[test]
    fn inverted_safety_bound_is_fatal() {
        let mut config = RiskGateConfig::default();
        let bounds = config.limits.safety_bounds.get_mut("arbitrage").unwrap();
        bounds.max_leverage = Bound::new(dec!(3), dec!(1));

        let err = config.validate().unwrap_err();
        assert!(matches!(err, RgError::Config(ref m) if m.contains("max_leverage")));
    }

    #[test]
    fn missing_safety_bounds_is_fatal() {
        let mut config = RiskGateConfig::default();
        config.limits.safety_bounds.remove("market_making");
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_workers_is_fatal() {
        let mut config = RiskGateConfig::default();
        config.balancer.num_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn factor_rule_bands() {
        let rule = AdjustmentThresholds::default().volatility;
        assert_eq!(rule.factor(dec!(1.6)), dec!(0.7));
        assert_eq!(rule.factor(dec!(0.5)), dec!(1.2));
        assert_eq!(rule.factor(dec!(1.0)), Decimal::ONE);
        assert_eq!(rule.factor(dec!(1.5)), Decimal::ONE);
    }

    #[test]
    fn out_of_range_factor_is_fatal() {
        let mut config = RiskGateConfig::default();
        config.limits.adjustments.liquidity.below_factor = dec!(0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_strategy_uses_fallback_table() {
        let config = LimitsConfig::default();
        let other = StrategyType::parse("grid_bot");
        assert_eq!(config.table_key(&other), "htf");
        assert_eq!(config.table_key(&StrategyType::Arbitrage), "arbitrage");
    }

    #[test]
    fn routing_strategy_parsing() {
        assert_eq!(
            "fastest_worker".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::FastestWorker
        );
        assert!("random".parse::<RoutingStrategy>().is_err());
    }

    #[test]
    fn timeouts_by_priority() {
        let manager = ManagerConfig::default();
        assert_eq!(
            manager.timeout_for(RequestPriority::UltraHigh),
            Duration::from_millis(500)
        );
        assert_eq!(manager.timeout_for(RequestPriority::Low), Duration::from_secs(10));
    }
}

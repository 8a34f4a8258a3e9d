//! Dynamic Risk Limits.
//!
//! Effective limits for a `(strategy, symbol)` pair are the strategy's base
//! limits, scaled by a market-condition factor and clamped into the
//! strategy's safety bounds. Results are cached for the configured TTL.
//!
//! [`DynamicRiskLimits::get_limits`] never fails: when signals cannot be
//! fetched the static base table is served instead and is not cached.

use chrono::{DateTime, Utc};
use rg_store::ConnectionManager;
use rg_types::{
    config_error, AdjustmentThresholds, DataFetchError, EventEmitter, GateEvent, LimitSource,
    LimitsConfig, RgResult, RiskLimitSet, SafetyBounds, StrategyType,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cache::{CacheKey, CacheStats, LimitCache};
use crate::signals::{fetch_signals, MarketSignals};

/// Per-signal adjustment factors and their mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub volatility: Decimal,
    pub liquidity: Decimal,
    pub correlation: Decimal,
    pub composite: Decimal,
}

impl Adjustment {
    pub fn neutral() -> Self {
        Self {
            volatility: Decimal::ONE,
            liquidity: Decimal::ONE,
            correlation: Decimal::ONE,
            composite: Decimal::ONE,
        }
    }

    pub fn from_signals(signals: &MarketSignals, thresholds: &AdjustmentThresholds) -> Self {
        let volatility = signals
            .volatility
            .value()
            .ratio()
            .map(|ratio| thresholds.volatility.factor(ratio))
            .unwrap_or(Decimal::ONE);
        let liquidity = thresholds
            .liquidity
            .factor(signals.liquidity.value().liquidity_score);
        let correlation = thresholds
            .correlation
            .factor(signals.correlation.value().portfolio_correlation);

        Self {
            volatility,
            liquidity,
            correlation,
            composite: (volatility + liquidity + correlation) / Decimal::from(3),
        }
    }
}

/// Limits a validation runs against, with their provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub strategy: String,
    pub symbol: String,
    pub limits: RiskLimitSet,
    pub source: LimitSource,
    pub adjustment: Adjustment,
    /// Signals used for the adjustment. `None` for base fallbacks.
    pub signals: Option<MarketSignals>,
    pub computed_at: DateTime<Utc>,
}

impl EffectiveLimits {
    /// Unadjusted base limits served when signals are unavailable.
    pub fn base(
        strategy: impl Into<String>,
        symbol: impl Into<String>,
        limits: RiskLimitSet,
        reason: String,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            symbol: symbol.into(),
            limits,
            source: LimitSource::BaseFallback { reason },
            adjustment: Adjustment::neutral(),
            signals: None,
            computed_at: Utc::now(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.source, LimitSource::BaseFallback { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct StrategyTable {
    base: RiskLimitSet,
    bounds: SafetyBounds,
}

#[derive(Debug)]
pub struct DynamicRiskLimits {
    connections: Arc<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    tables: HashMap<String, StrategyTable>,
    fallback: StrategyTable,
    thresholds: AdjustmentThresholds,
    cache: LimitCache,
    events: EventEmitter,
}

impl DynamicRiskLimits {
    /// `breaker` guards every signal fetch.
    pub fn new(
        config: &LimitsConfig,
        connections: Arc<ConnectionManager>,
        breaker: Arc<CircuitBreaker>,
        events: EventEmitter,
    ) -> RgResult<Self> {
        config.validate()?;

        let mut tables = HashMap::with_capacity(config.base_limits.len());
        for (strategy, base) in &config.base_limits {
            let bounds = config.safety_bounds.get(strategy).copied().ok_or_else(|| {
                config_error!("strategy '{strategy}' has base limits but no safety bounds")
            })?;
            tables.insert(strategy.clone(), StrategyTable { base: *base, bounds });
        }
        let fallback = tables
            .get(&config.fallback_strategy)
            .copied()
            .ok_or_else(|| {
                config_error!("fallback strategy '{}' missing", config.fallback_strategy)
            })?;

        Ok(Self {
            connections,
            breaker,
            tables,
            fallback,
            thresholds: config.adjustments,
            cache: LimitCache::new(config.max_cache_size, config.cache_ttl()),
            events,
        })
    }

    fn table(&self, strategy: &StrategyType) -> &StrategyTable {
        self.tables.get(strategy.as_str()).unwrap_or(&self.fallback)
    }

    /// Static base limits for `strategy`.
    pub fn base_limits(&self, strategy: &StrategyType) -> RiskLimitSet {
        self.table(strategy).base
    }

    /// Effective limits for `strategy` on `symbol`. Never fails; a cache hit
    /// returns the stored value as computed, hits show in [`Self::cache_stats`].
    pub async fn get_limits(&self, strategy: &StrategyType, symbol: &str) -> EffectiveLimits {
        let key = CacheKey::new(strategy.as_str(), symbol);
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let fetched = self
            .breaker
            .call(|| fetch_signals(&self.connections, symbol))
            .await;

        match fetched {
            Ok(signals) => {
                let effective = self.compute(strategy, symbol, signals);
                debug!(
                    %strategy,
                    symbol,
                    composite = %effective.adjustment.composite,
                    "Computed dynamic limits"
                );
                self.cache.insert(key, effective.clone());
                effective
            }
            Err(e) => {
                let reason = match e {
                    BreakerError::Open { name } => DataFetchError::CircuitOpen { breaker: name },
                    BreakerError::Inner(err) => DataFetchError::SourceUnavailable {
                        source_name: "signal store".to_string(),
                        message: err.to_string(),
                    },
                };
                warn!(%strategy, symbol, error = %reason, "Serving base limits");
                self.events.emit(GateEvent::LimitsFallback {
                    strategy: strategy.to_string(),
                    symbol: symbol.to_string(),
                    reason: reason.to_string(),
                });
                EffectiveLimits::base(
                    strategy.as_str(),
                    symbol,
                    self.base_limits(strategy),
                    reason.to_string(),
                )
            }
        }
    }

    /// Apply the market adjustment to the base table and clamp.
    pub fn compute(
        &self,
        strategy: &StrategyType,
        symbol: &str,
        signals: MarketSignals,
    ) -> EffectiveLimits {
        let table = self.table(strategy);
        let adjustment = Adjustment::from_signals(&signals, &self.thresholds);
        let limits = table
            .bounds
            .clamp(&table.base.scale_exposure(adjustment.composite));

        EffectiveLimits {
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            limits,
            source: LimitSource::Dynamic,
            adjustment,
            signals: Some(signals),
            computed_at: Utc::now(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The four limits every validation is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RiskLimitSet {
    /// Max position as a fraction of portfolio value
    pub max_position_size: Decimal,
    pub max_leverage: Decimal,
    /// Max stop-loss distance as a fraction of entry
    pub stop_loss: Decimal,
    pub max_drawdown: Decimal,
}

impl RiskLimitSet {
    pub fn new(
        max_position_size: Decimal,
        max_leverage: Decimal,
        stop_loss: Decimal,
        max_drawdown: Decimal,
    ) -> Self {
        Self {
            max_position_size,
            max_leverage,
            stop_loss,
            max_drawdown,
        }
    }

    /// Scale the size- and leverage-type limits by `factor`. Stop-loss and
    /// drawdown keep their values.
    pub fn scale_exposure(&self, factor: Decimal) -> Self {
        Self {
            max_position_size: self.max_position_size * factor,
            max_leverage: self.max_leverage * factor,
            ..*self
        }
    }
}

/// Inclusive `[min, max]` clamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    pub min: Decimal,
    pub max: Decimal,
}

impl Bound {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: Decimal) -> Decimal {
        value.max(self.min).min(self.max)
    }

    pub fn is_well_formed(&self) -> bool {
        self.min >= Decimal::ZERO && self.min <= self.max
    }

    pub fn contains(&self, value: Decimal) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Hard per-strategy clamps applied after market adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyBounds {
    pub max_position_size: Bound,
    pub max_leverage: Bound,
    pub stop_loss: Bound,
    pub max_drawdown: Bound,
}

impl SafetyBounds {
    pub fn clamp(&self, limits: &RiskLimitSet) -> RiskLimitSet {
        RiskLimitSet {
            max_position_size: self.max_position_size.clamp(limits.max_position_size),
            max_leverage: self.max_leverage.clamp(limits.max_leverage),
            stop_loss: self.stop_loss.clamp(limits.stop_loss),
            max_drawdown: self.max_drawdown.clamp(limits.max_drawdown),
        }
    }

    /// Name of the first malformed bound, if any.
    pub fn first_malformed(&self) -> Option<&'static str> {
        [
            ("max_position_size", &self.max_position_size),
            ("max_leverage", &self.max_leverage),
            ("stop_loss", &self.stop_loss),
            ("max_drawdown", &self.max_drawdown),
        ]
        .into_iter()
        .find(|(_, bound)| !bound.is_well_formed())
        .map(|(name, _)| name)
    }
}

/// Where a set of effective limits came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimitSource {
    /// Computed from market signals
    Dynamic,
    /// Static base table, signals could not be fetched
    BaseFallback { reason: String },
}

fn limits(pos: i64, lev: i64, stop: i64, dd: i64, scale: u32) -> RiskLimitSet {
    RiskLimitSet::new(
        Decimal::new(pos, scale),
        Decimal::new(lev, 1),
        Decimal::new(stop, scale + 1),
        Decimal::new(dd, scale + 1),
    )
}

fn bound(min: i64, max: i64, scale: u32) -> Bound {
    Bound::new(Decimal::new(min, scale), Decimal::new(max, scale))
}

/// Built-in base-limit table, keyed by canonical strategy name.
pub fn default_base_limits() -> HashMap<String, RiskLimitSet> {
    HashMap::from([
        // 5%, 2.0x, 0.2%, 1%
        ("arbitrage".to_string(), limits(5, 20, 2, 10, 2)),
        ("trend_following".to_string(), limits(15, 12, 10, 30, 2)),
        ("market_making".to_string(), limits(8, 30, 3, 15, 2)),
        ("statistical_arbitrage".to_string(), limits(10, 15, 6, 20, 2)),
        ("news_driven".to_string(), limits(12, 10, 8, 25, 2)),
        ("htf".to_string(), limits(20, 10, 20, 50, 2)),
    ])
}

/// Built-in safety-bound table, keyed by canonical strategy name.
pub fn default_safety_bounds() -> HashMap<String, SafetyBounds> {
    HashMap::from([
        (
            "arbitrage".to_string(),
            SafetyBounds {
                max_position_size: bound(2, 10, 2),
                max_leverage: bound(10, 30, 1),
                stop_loss: bound(1, 5, 3),
                max_drawdown: bound(5, 20, 3),
            },
        ),
        (
            "trend_following".to_string(),
            SafetyBounds {
                max_position_size: bound(5, 25, 2),
                max_leverage: bound(10, 20, 1),
                stop_loss: bound(5, 20, 3),
                max_drawdown: bound(10, 50, 3),
            },
        ),
        (
            "market_making".to_string(),
            SafetyBounds {
                max_position_size: bound(3, 15, 2),
                max_leverage: bound(15, 40, 1),
                stop_loss: bound(1, 8, 3),
                max_drawdown: bound(5, 30, 3),
            },
        ),
        (
            "statistical_arbitrage".to_string(),
            SafetyBounds {
                max_position_size: bound(4, 15, 2),
                max_leverage: bound(10, 20, 1),
                stop_loss: bound(3, 12, 3),
                max_drawdown: bound(10, 40, 3),
            },
        ),
        (
            "news_driven".to_string(),
            SafetyBounds {
                max_position_size: bound(5, 20, 2),
                max_leverage: bound(10, 15, 1),
                stop_loss: bound(5, 15, 3),
                max_drawdown: bound(10, 40, 3),
            },
        ),
        (
            "htf".to_string(),
            SafetyBounds {
                max_position_size: bound(10, 30, 2),
                max_leverage: bound(10, 15, 1),
                stop_loss: bound(10, 30, 3),
                max_drawdown: bound(20, 80, 3),
            },
        ),
    ])
}

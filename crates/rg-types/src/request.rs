use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique risk-request identifier
pub type RequestId = Uuid;

/// Urgency tier of a validation request. Lower ordinal is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPriority {
    /// HFT strategies, tens of milliseconds
    UltraHigh = 1,
    /// Standard intraday strategies
    High = 2,
    /// Strategic / long-horizon strategies
    Medium = 3,
    /// Background work
    Low = 4,
}

impl RequestPriority {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestPriority::UltraHigh => "ULTRA_HIGH",
            RequestPriority::High => "HIGH",
            RequestPriority::Medium => "MEDIUM",
            RequestPriority::Low => "LOW",
        };
        f.write_str(label)
    }
}

/// Strategy family a request originates from.
///
/// Parsing is infallible: names that don't match a known family are kept as
/// [`StrategyType::Other`] and classified with [`RequestPriority::Low`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StrategyType {
    Arbitrage,
    MarketMaking,
    TrendFollowing,
    StatisticalArbitrage,
    NewsDriven,
    Htf,
    Other(String),
}

impl StrategyType {
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "arbitrage" | "arb" | "latency_arbitrage" => StrategyType::Arbitrage,
            "market_making" | "mm" => StrategyType::MarketMaking,
            "trend_following" | "trend" => StrategyType::TrendFollowing,
            "statistical_arbitrage" | "stat_arb" => StrategyType::StatisticalArbitrage,
            "news_driven" | "news" => StrategyType::NewsDriven,
            "htf" | "high_time_frame" | "long_term" => StrategyType::Htf,
            _ => StrategyType::Other(normalized),
        }
    }

    /// Canonical key used in the base-limit and safety-bound tables.
    pub fn as_str(&self) -> &str {
        match self {
            StrategyType::Arbitrage => "arbitrage",
            StrategyType::MarketMaking => "market_making",
            StrategyType::TrendFollowing => "trend_following",
            StrategyType::StatisticalArbitrage => "statistical_arbitrage",
            StrategyType::NewsDriven => "news_driven",
            StrategyType::Htf => "htf",
            StrategyType::Other(name) => name,
        }
    }

    /// Urgency classification used at submission time.
    pub fn priority(&self) -> RequestPriority {
        match self {
            StrategyType::MarketMaking | StrategyType::Arbitrage => RequestPriority::UltraHigh,
            StrategyType::TrendFollowing | StrategyType::StatisticalArbitrage => {
                RequestPriority::High
            }
            StrategyType::NewsDriven | StrategyType::Htf => RequestPriority::Medium,
            StrategyType::Other(_) => RequestPriority::Low,
        }
    }
}

impl From<&str> for StrategyType {
    fn from(name: &str) -> Self {
        StrategyType::parse(name)
    }
}

impl From<String> for StrategyType {
    fn from(name: String) -> Self {
        StrategyType::parse(&name)
    }
}

impl From<StrategyType> for String {
    fn from(strategy: StrategyType) -> Self {
        strategy.as_str().to_string()
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade parameters the checks are evaluated against.
///
/// Sizes are fractions of portfolio value, leverage is a multiplier and
/// stop-loss is a fractional distance from entry. Fields the checks don't
/// know about are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradePayload {
    pub position_size: Decimal,
    pub leverage: Decimal,
    pub stop_loss: Decimal,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for TradePayload {
    fn default() -> Self {
        Self {
            position_size: Decimal::ZERO,
            leverage: Decimal::ONE,
            stop_loss: Decimal::ZERO,
            extra: serde_json::Map::new(),
        }
    }
}

impl TradePayload {
    pub fn new(position_size: Decimal, leverage: Decimal, stop_loss: Decimal) -> Self {
        Self {
            position_size,
            leverage,
            stop_loss,
            extra: serde_json::Map::new(),
        }
    }
}

/// One validation unit travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct RiskRequest {
    pub id: RequestId,
    pub strategy: StrategyType,
    pub symbol: String,
    pub priority: RequestPriority,
    pub submitted_at: Instant,
    pub submitted_wall: DateTime<Utc>,
    pub payload: TradePayload,
    pub timeout: Duration,
}

impl RiskRequest {
    /// Build a request, classifying its priority from the strategy type.
    pub fn new(
        strategy: StrategyType,
        symbol: impl Into<String>,
        payload: TradePayload,
        timeout: Duration,
    ) -> Self {
        let priority = strategy.priority();
        Self {
            id: Uuid::new_v4(),
            strategy,
            symbol: symbol.into(),
            priority,
            submitted_at: Instant::now(),
            submitted_wall: Utc::now(),
            payload,
            timeout,
        }
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.age() > self.timeout
    }
}

/// Lifecycle of a request inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Submitted,
    Queued,
    Routed,
    FastValidated,
    ComprehensiveValidated,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// Typed reason a request produced no validation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Still queued past its timeout
    TimedOut { waited_ms: u64 },
    /// All workers saturated and fallback routing exhausted
    RoutingFailure { message: String },
    /// The tier's circuit breaker refused the call
    CircuitOpen { breaker: String },
    /// Shared store unreachable during a comprehensive check
    Connection { message: String },
    /// Dropped by shutdown before processing
    Cancelled,
    Internal { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TimedOut { waited_ms } => {
                write!(f, "timed out after {waited_ms} ms in queue")
            }
            FailureReason::RoutingFailure { message } => write!(f, "routing failure: {message}"),
            FailureReason::CircuitOpen { breaker } => write!(f, "circuit '{breaker}' open"),
            FailureReason::Connection { message } => write!(f, "connection error: {message}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

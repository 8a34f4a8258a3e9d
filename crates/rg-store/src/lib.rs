//! Shared-store access for RiskGate.
//!
//! [`ConnectionManager`] is the only way pipeline components reach the
//! store. Backends plug in through [`StoreConnector`] / [`StoreBackend`].

pub mod backend;
pub mod connection;
pub mod memory;

pub use backend::*;
pub use connection::*;
pub use memory::*;

/// Well-known store keys and channels.
pub mod keys {
    pub const PORTFOLIO_EXPOSURE: &str = "portfolio:exposure";
    pub const HEALTH: &str = "risk_gate:health";
    pub const STATS: &str = "risk_gate:stats";
    pub const DECISIONS_CHANNEL: &str = "risk_decisions";
    pub const ALERTS_CHANNEL: &str = "risk_alerts";

    pub fn market_data(symbol: &str) -> String {
        format!("market_data:{symbol}")
    }

    pub fn volatility_data(symbol: &str) -> String {
        format!("volatility_data:{symbol}")
    }

    pub fn liquidity_data(symbol: &str) -> String {
        format!("liquidity_data:{symbol}")
    }

    pub fn correlation_data(symbol: &str) -> String {
        format!("correlation_data:{symbol}")
    }
}

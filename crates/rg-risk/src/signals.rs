//! Market signals feeding the limit adjustment.
//!
//! Each signal is read from its own store hash. A hash that is missing, or in
//! which no known field parses, yields [`Signal::Defaulted`] carrying neutral
//! values so downstream maths never sees a hole.

use rg_store::{keys, ConnectionManager};
use rg_types::ConnectionError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", content = "value", rename_all = "snake_case")]
pub enum Signal<T> {
    Fetched(T),
    Defaulted(T),
}

impl<T: Copy> Signal<T> {
    pub fn value(&self) -> T {
        match self {
            Signal::Fetched(v) | Signal::Defaulted(v) => *v,
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Signal::Defaulted(_))
    }
}

fn field(fields: &HashMap<String, String>, name: &str) -> Option<Decimal> {
    fields.get(name).and_then(|raw| Decimal::from_str(raw.trim()).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
}

impl MarketQuote {
    pub fn neutral() -> Self {
        Self {
            price: Decimal::ONE,
            bid: Decimal::new(9999, 4),
            ask: Decimal::new(10001, 4),
            volume: Decimal::from(1_000_000),
        }
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Signal<Self> {
        let n = Self::neutral();
        let (price, bid, ask, volume) = (
            field(fields, "price"),
            field(fields, "bid"),
            field(fields, "ask"),
            field(fields, "volume"),
        );
        if price.is_none() && bid.is_none() && ask.is_none() && volume.is_none() {
            return Signal::Defaulted(n);
        }
        Signal::Fetched(Self {
            price: price.unwrap_or(n.price),
            bid: bid.unwrap_or(n.bid),
            ask: ask.unwrap_or(n.ask),
            volume: volume.unwrap_or(n.volume),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilitySignal {
    pub current: Decimal,
    pub historical: Decimal,
}

impl VolatilitySignal {
    pub fn neutral() -> Self {
        Self {
            current: Decimal::new(15, 2),
            historical: Decimal::new(12, 2),
        }
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Signal<Self> {
        let n = Self::neutral();
        match (
            field(fields, "current_volatility"),
            field(fields, "historical_volatility"),
        ) {
            (None, None) => Signal::Defaulted(n),
            (current, historical) => Signal::Fetched(Self {
                current: current.unwrap_or(n.current),
                historical: historical.unwrap_or(n.historical),
            }),
        }
    }

    /// `current / historical`, or `None` when historical volatility is zero.
    pub fn ratio(&self) -> Option<Decimal> {
        self.current.checked_div(self.historical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySignal {
    pub liquidity_score: Decimal,
    pub bid_ask_spread: Decimal,
}

impl LiquiditySignal {
    pub fn neutral() -> Self {
        Self {
            liquidity_score: Decimal::new(85, 2),
            bid_ask_spread: Decimal::new(2, 4),
        }
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Signal<Self> {
        let n = Self::neutral();
        match (
            field(fields, "liquidity_score"),
            field(fields, "bid_ask_spread"),
        ) {
            (None, None) => Signal::Defaulted(n),
            (score, spread) => Signal::Fetched(Self {
                liquidity_score: score.unwrap_or(n.liquidity_score),
                bid_ask_spread: spread.unwrap_or(n.bid_ask_spread),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSignal {
    pub portfolio_correlation: Decimal,
}

impl CorrelationSignal {
    pub fn neutral() -> Self {
        Self {
            portfolio_correlation: Decimal::new(3, 1),
        }
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Signal<Self> {
        match field(fields, "portfolio_correlation") {
            Some(portfolio_correlation) => Signal::Fetched(Self {
                portfolio_correlation,
            }),
            None => Signal::Defaulted(Self::neutral()),
        }
    }
}

/// Everything the limit adjustment and the market checks look at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketSignals {
    pub market: Signal<MarketQuote>,
    pub volatility: Signal<VolatilitySignal>,
    pub liquidity: Signal<LiquiditySignal>,
    pub correlation: Signal<CorrelationSignal>,
}

impl MarketSignals {
    pub fn neutral() -> Self {
        Self {
            market: Signal::Defaulted(MarketQuote::neutral()),
            volatility: Signal::Defaulted(VolatilitySignal::neutral()),
            liquidity: Signal::Defaulted(LiquiditySignal::neutral()),
            correlation: Signal::Defaulted(CorrelationSignal::neutral()),
        }
    }

    pub fn defaulted_count(&self) -> usize {
        [
            self.market.is_defaulted(),
            self.volatility.is_defaulted(),
            self.liquidity.is_defaulted(),
            self.correlation.is_defaulted(),
        ]
        .into_iter()
        .filter(|d| *d)
        .count()
    }
}

/// Read all four signal hashes for `symbol` over one connection.
pub async fn fetch_signals(
    connections: &ConnectionManager,
    symbol: &str,
) -> Result<MarketSignals, ConnectionError> {
    connections
        .with_connection(|conn| async move {
            let market = conn.hgetall(&keys::market_data(symbol)).await?;
            let volatility = conn.hgetall(&keys::volatility_data(symbol)).await?;
            let liquidity = conn.hgetall(&keys::liquidity_data(symbol)).await?;
            let correlation = conn.hgetall(&keys::correlation_data(symbol)).await?;
            Ok(MarketSignals {
                market: MarketQuote::from_fields(&market),
                volatility: VolatilitySignal::from_fields(&volatility),
                liquidity: LiquiditySignal::from_fields(&liquidity),
                correlation: CorrelationSignal::from_fields(&correlation),
            })
        })
        .await
}

/// Current portfolio exposure as a fraction of portfolio value. A missing or
/// unparseable key counts as zero.
pub async fn read_portfolio_exposure(
    connections: &ConnectionManager,
) -> Result<Decimal, ConnectionError> {
    connections
        .with_connection(|conn| async move {
            let raw = conn.get(keys::PORTFOLIO_EXPOSURE).await?;
            Ok(raw
                .and_then(|v| Decimal::from_str(v.trim()).ok())
                .unwrap_or(Decimal::ZERO))
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_store::{InMemoryConnector, InMemoryStore};
    use rg_types::StoreConfig;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_hash_defaults_to_neutral() {
        let vol = VolatilitySignal::from_fields(&HashMap::new());
        assert!(vol.is_defaulted());
        assert_eq!(vol.value().current, dec!(0.15));
        assert_eq!(vol.value().historical, dec!(0.12));
    }

    #[test]
    fn garbage_fields_count_as_missing() {
        let liq = LiquiditySignal::from_fields(&fields(&[("liquidity_score", "n/a")]));
        assert!(liq.is_defaulted());

        let liq = LiquiditySignal::from_fields(&fields(&[("liquidity_score", " 0.42 ")]));
        assert_eq!(
            liq,
            Signal::Fetched(LiquiditySignal {
                liquidity_score: dec!(0.42),
                bid_ask_spread: dec!(0.0002),
            })
        );
    }

    #[test]
    fn zero_historical_volatility_has_no_ratio() {
        let vol = VolatilitySignal {
            current: dec!(0.2),
            historical: Decimal::ZERO,
        };
        assert_eq!(vol.ratio(), None);
        assert_eq!(VolatilitySignal::neutral().ratio(), Some(dec!(1.25)));
    }

    #[tokio::test]
    async fn fetch_reads_all_four_hashes() {
        let store = InMemoryStore::shared();
        store.put_hash("correlation_data:AAPL", [("portfolio_correlation", "0.75")]);
        let cm = ConnectionManager::new(
            Arc::new(InMemoryConnector::new(store.clone())),
            StoreConfig::default(),
        );

        let signals = fetch_signals(&cm, "AAPL").await.unwrap();
        assert_eq!(store.read_count(), 4);
        assert_eq!(signals.defaulted_count(), 3);
        assert_eq!(signals.correlation.value().portfolio_correlation, dec!(0.75));
    }

    #[tokio::test]
    async fn exposure_defaults_to_zero() {
        let store = InMemoryStore::shared();
        let cm = ConnectionManager::new(
            Arc::new(InMemoryConnector::new(store.clone())),
            StoreConfig::default(),
        );
        assert_eq!(read_portfolio_exposure(&cm).await.unwrap(), Decimal::ZERO);

        store.put_string("portfolio:exposure", "0.35");
        assert_eq!(read_portfolio_exposure(&cm).await.unwrap(), dec!(0.35));
    }
}

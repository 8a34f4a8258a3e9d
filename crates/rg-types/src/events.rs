//! In-process pipeline events.
//!
//! Components that accept an [`EventEmitter`] send a [`GateEvent`] for every
//! notable state change. Delivery is best effort: a full or disconnected
//! channel never blocks the pipeline.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::request::{FailureReason, RequestId};
use crate::validation::ValidationTier;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GateEvent {
    BreakerTransition {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
        timestamp: DateTime<Utc>,
    },
    /// Signals could not be fetched and base limits were served.
    LimitsFallback {
        strategy: String,
        symbol: String,
        reason: String,
    },
    TimingAdjusted {
        tier: ValidationTier,
        previous_ms: f64,
        current_ms: f64,
    },
    RequestCompleted {
        request_id: RequestId,
        tier: ValidationTier,
        passed: bool,
        duration_ms: f64,
    },
    RequestFailed {
        request_id: RequestId,
        reason: FailureReason,
    },
}

/// Optional best-effort sender of [`GateEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<Sender<GateEvent>>,
}

impl EventEmitter {
    pub fn new(tx: Sender<GateEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Emitter that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Bounded channel with an emitter attached to its sending side.
    pub fn bounded(capacity: usize) -> (Self, Receiver<GateEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: GateEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitter_delivers_until_full() {
        let (emitter, rx) = EventEmitter::bounded(1);
        let event = GateEvent::LimitsFallback {
            strategy: "arbitrage".into(),
            symbol: "BTCUSD".into(),
            reason: "store down".into(),
        };
        emitter.emit(event.clone());
        emitter.emit(event.clone());

        assert_eq!(rx.try_recv().unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_emitter_is_silent() {
        EventEmitter::disabled().emit(GateEvent::RequestFailed {
            request_id: uuid::Uuid::new_v4(),
            reason: FailureReason::Cancelled,
        });
    }

    #[test]
    fn transition_serializes_with_event_tag() {
        let json = serde_json::to_value(GateEvent::BreakerTransition {
            breaker: "market_data".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["event"], "breaker_transition");
        assert_eq!(json["to"], "OPEN");
    }
}

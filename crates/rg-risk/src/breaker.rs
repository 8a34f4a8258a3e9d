//! Circuit breakers guarding store reads and validation tiers.
//!
//! A [`CircuitBreaker`] wraps an async operation. After `failure_threshold`
//! consecutive failures it opens and fails fast for `recovery_timeout`, then
//! lets exactly one trial call through (half-open). The trial's outcome
//! closes or reopens the circuit.
//!
//! Every admission carries the epoch it was admitted in; the epoch advances
//! on each state change. Outcomes from an earlier epoch only update the
//! counters, so a slow call admitted while closed cannot decide a later
//! half-open trial.
//!
//! State lives under one `parking_lot::Mutex` per breaker that is never held
//! across the awaited operation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rg_types::{
    config_error, BreakerConfig, BreakersConfig, CircuitState, EventEmitter, GateEvent, RgResult,
    COMPREHENSIVE_VALIDATION_BREAKER, FAST_VALIDATION_BREAKER, MARKET_DATA_BREAKER,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation
    #[error("Circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
    pub failure_streak: u32,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    epoch: u64,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    times_opened: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
            epoch: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            times_opened: 0,
            last_failure_at: None,
            last_state_change: Utc::now(),
        }
    }

    /// Move to `to`, returning the transition if the state changed.
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.epoch += 1;
        self.last_state_change = Utc::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.times_opened += 1;
                self.trial_in_flight = false;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.opened_at = None;
                self.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
            }
        }
        Some((from, to))
    }
}

/// Outstanding admission. Releases a half-open trial slot if the caller's
/// future is dropped before the outcome is recorded.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    epoch: u64,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            if inner.epoch == self.epoch {
                inner.trial_in_flight = false;
            }
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: EventEmitter,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_events(name, config, EventEmitter::disabled())
    }

    pub fn with_events(name: impl Into<String>, config: BreakerConfig, events: EventEmitter) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Current state. An expired open window is only turned into half-open
    /// by the next call.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `op` under the breaker.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut admission = match self.admit() {
            Some(admission) => admission,
            None => {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                })
            }
        };

        let result = op().await;
        admission.settled = true;
        match &result {
            Ok(_) => self.record_success(admission.epoch),
            Err(_) => self.record_failure(admission.epoch),
        }
        result.map_err(BreakerError::Inner)
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let mut transition = None;
        let (admitted, epoch) = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;
            let admitted = match inner.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed() >= self.config.recovery_timeout())
                        .unwrap_or(true);
                    if elapsed {
                        transition = inner.transition(CircuitState::HalfOpen);
                        inner.trial_in_flight = true;
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if inner.trial_in_flight => None,
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            };
            if admitted.is_none() {
                inner.rejected_calls += 1;
            }
            (admitted, inner.epoch)
        };
        self.announce(transition);

        admitted.map(|trial| Admission {
            breaker: self,
            trial,
            epoch,
            settled: false,
        })
    }

    fn record_success(&self, epoch: u64) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.successful_calls += 1;
            if inner.epoch != epoch {
                return;
            }
            inner.failure_count = 0;
            match inner.state {
                CircuitState::HalfOpen => inner.transition(CircuitState::Closed),
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn record_failure(&self, epoch: u64) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failed_calls += 1;
            inner.last_failure_at = Some(Utc::now());
            if inner.epoch != epoch {
                return;
            }
            inner.failure_count += 1;
            match inner.state {
                CircuitState::HalfOpen => inner.transition(CircuitState::Open),
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.transition(CircuitState::Open)
                }
                _ => None,
            }
        };
        self.announce(transition);
    }

    fn announce(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, %to, "Circuit opened"),
            _ => info!(breaker = %self.name, %from, %to, "Circuit state changed"),
        }
        self.events.emit(GateEvent::BreakerTransition {
            breaker: self.name.clone(),
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    pub fn force_open(&self) {
        let transition = self.inner.lock().transition(CircuitState::Open);
        self.announce(transition);
    }

    pub fn force_close(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            inner.transition(CircuitState::Closed)
        };
        self.announce(transition);
    }

    pub fn force_half_open(&self) {
        let transition = self.inner.lock().transition(CircuitState::HalfOpen);
        self.announce(transition);
    }

    /// Zero the call counters. State is untouched.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls = 0;
        inner.successful_calls = 0;
        inner.failed_calls = 0;
        inner.rejected_calls = 0;
        inner.times_opened = 0;
        inner.last_failure_at = None;
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let executed = inner.successful_calls + inner.failed_calls;
        let (success_rate, failure_rate) = if executed == 0 {
            (1.0, 0.0)
        } else {
            (
                inner.successful_calls as f64 / executed as f64,
                inner.failed_calls as f64 / executed as f64,
            )
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout_ms,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
            failure_streak: inner.failure_count,
            success_rate,
            failure_rate,
            last_failure_at: inner.last_failure_at,
            last_state_change: inner.last_state_change,
        }
    }
}

/// Aggregate breaker health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    /// `closed / max(total, 1)`
    pub health_score: f64,
    pub open_breakers: Vec<String>,
}

/// Named registry of circuit breakers.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakersConfig,
    events: EventEmitter,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakersConfig, events: EventEmitter) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            events,
        }
    }

    /// Registry pre-populated with the breakers the pipeline uses.
    pub fn with_defaults(config: BreakersConfig, events: EventEmitter) -> Self {
        let manager = Self::new(config, events);
        for name in [
            MARKET_DATA_BREAKER,
            FAST_VALIDATION_BREAKER,
            COMPREHENSIVE_VALIDATION_BREAKER,
        ] {
            manager.get_or_create(name);
        }
        manager
    }

    /// Register a new breaker. Duplicate names are rejected.
    pub fn create(&self, name: &str, config: BreakerConfig) -> RgResult<Arc<CircuitBreaker>> {
        match self.breakers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(config_error!("circuit breaker '{name}' already exists"))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let breaker = Arc::new(CircuitBreaker::with_events(
                    name,
                    config,
                    self.events.clone(),
                ));
                slot.insert(breaker.clone());
                info!(breaker = name, threshold = config.failure_threshold, "Circuit breaker created");
                Ok(breaker)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Existing breaker, or a new one with the configured (or default) settings.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_events(
                    name,
                    self.config.get(name),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn status(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|b| (b.key().clone(), b.state()))
            .collect()
    }

    pub fn health_check(&self) -> BreakerHealth {
        let status = self.status();
        let count = |s: CircuitState| status.values().filter(|&&v| v == s).count();
        let closed = count(CircuitState::Closed);
        BreakerHealth {
            total: status.len(),
            closed,
            open: count(CircuitState::Open),
            half_open: count(CircuitState::HalfOpen),
            health_score: closed as f64 / status.len().max(1) as f64,
            open_breakers: status
                .iter()
                .filter(|&(_, s)| *s == CircuitState::Open)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open");
        for breaker in self.breakers.iter() {
            breaker.force_open();
        }
    }

    pub fn force_close_all(&self) {
        info!("Forcing all circuit breakers closed");
        for breaker in self.breakers.iter() {
            breaker.force_close();
        }
    }
}

//! Adaptive Timer.
//!
//! Each validation tier has a fixed target budget and a current budget that
//! drifts with observed durations. The current budget never leaves
//! `[0.5 × target, 2 × target]`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rg_types::{EventEmitter, GateEvent, TimingConfig, ValidationTier};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingAdjustment {
    pub observed_ms: f64,
    pub previous_ms: f64,
    pub current_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingTier {
    pub tier: ValidationTier,
    pub target_ms: f64,
    pub current_ms: f64,
    pub history: VecDeque<TimingAdjustment>,
}

impl TimingTier {
    fn new(tier: ValidationTier, target_ms: f64) -> Self {
        Self {
            tier,
            target_ms,
            current_ms: target_ms,
            history: VecDeque::new(),
        }
    }

    /// Apply one observation. Returns the new budget when a rule fired.
    fn observe(&mut self, observed_ms: f64, factor: f64, max_history: usize) -> Option<f64> {
        let target = self.target_ms;
        let previous = self.current_ms;

        let next = if observed_ms > target * 1.2 {
            let step = (observed_ms * factor).min(target * 0.2);
            (previous + step).min(target * 2.0)
        } else if observed_ms < target * 0.8 {
            let step = (target * factor).min(target * 0.1);
            (previous - step).max(target * 0.5)
        } else {
            return None;
        };

        self.current_ms = next;
        self.history.push_back(TimingAdjustment {
            observed_ms,
            previous_ms: previous,
            current_ms: next,
            timestamp: Utc::now(),
        });
        while self.history.len() > max_history {
            self.history.pop_front();
        }
        Some(next)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub fast_target_ms: f64,
    pub fast_current_ms: f64,
    pub comprehensive_target_ms: f64,
    pub comprehensive_current_ms: f64,
    pub adjustments: usize,
}

#[derive(Debug)]
pub struct AdaptiveTimer {
    fast: Mutex<TimingTier>,
    comprehensive: Mutex<TimingTier>,
    adjustment_factor: f64,
    max_history: usize,
    events: EventEmitter,
}

impl AdaptiveTimer {
    pub fn new(config: &TimingConfig, events: EventEmitter) -> Self {
        Self {
            fast: Mutex::new(TimingTier::new(ValidationTier::Fast, config.fast_target_ms)),
            comprehensive: Mutex::new(TimingTier::new(
                ValidationTier::Comprehensive,
                config.comprehensive_target_ms,
            )),
            adjustment_factor: config.adjustment_factor,
            max_history: config.max_history,
            events,
        }
    }

    fn tier(&self, tier: ValidationTier) -> &Mutex<TimingTier> {
        match tier {
            ValidationTier::Fast => &self.fast,
            ValidationTier::Comprehensive => &self.comprehensive,
        }
    }

    pub fn update_timing(&self, tier: ValidationTier, observed_ms: f64) {
        if !observed_ms.is_finite() || observed_ms < 0.0 {
            return;
        }
        let (previous, changed) = {
            let mut t = self.tier(tier).lock();
            let previous = t.current_ms;
            (
                previous,
                t.observe(observed_ms, self.adjustment_factor, self.max_history),
            )
        };

        if let Some(current) = changed.filter(|c| *c != previous) {
            debug!(%tier, observed_ms, previous, current, "Timing budget adjusted");
            self.events.emit(GateEvent::TimingAdjusted {
                tier,
                previous_ms: previous,
                current_ms: current,
            });
        }
    }

    /// Current budget for `tier` in milliseconds.
    pub fn get_timing(&self, tier: ValidationTier) -> f64 {
        self.tier(tier).lock().current_ms
    }

    pub fn target(&self, tier: ValidationTier) -> f64 {
        self.tier(tier).lock().target_ms
    }

    pub fn history(&self, tier: ValidationTier) -> Vec<TimingAdjustment> {
        self.tier(tier).lock().history.iter().cloned().collect()
    }

    /// Restore `tier` to its target and drop its history.
    pub fn reset(&self, tier: ValidationTier) {
        let mut t = self.tier(tier).lock();
        t.current_ms = t.target_ms;
        t.history.clear();
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        let fast = self.fast.lock();
        let comprehensive = self.comprehensive.lock();
        TimingSnapshot {
            fast_target_ms: fast.target_ms,
            fast_current_ms: fast.current_ms,
            comprehensive_target_ms: comprehensive.target_ms,
            comprehensive_current_ms: comprehensive.current_ms,
            adjustments: fast.history.len() + comprehensive.history.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> AdaptiveTimer {
        AdaptiveTimer::new(&TimingConfig::default(), EventEmitter::disabled())
    }

    #[test]
    fn slow_observations_converge_to_double_target() {
        let t = timer();
        for _ in 0..100 {
            t.update_timing(ValidationTier::Fast, 1_000.0);
            let current = t.get_timing(ValidationTier::Fast);
            assert!((25.0..=100.0).contains(&current));
        }
        assert_eq!(t.get_timing(ValidationTier::Fast), 100.0);
    }

    #[test]
    fn step_is_capped_at_fifth_of_target() {
        let t = timer();
        t.update_timing(ValidationTier::Fast, 1_000.0);
        assert_eq!(t.get_timing(ValidationTier::Fast), 60.0);

        t.reset(ValidationTier::Fast);
        t.update_timing(ValidationTier::Fast, 70.0);
        assert!((t.get_timing(ValidationTier::Fast) - 57.0).abs() < 1e-9);
    }

    #[test]
    fn fast_observations_floor_at_half_target() {
        let t = timer();
        for _ in 0..50 {
            t.update_timing(ValidationTier::Comprehensive, 1.0);
        }
        assert_eq!(t.get_timing(ValidationTier::Comprehensive), 250.0);
        assert_eq!(t.get_timing(ValidationTier::Fast), 50.0);
    }

    #[test]
    fn in_band_observations_change_nothing() {
        let t = timer();
        t.update_timing(ValidationTier::Fast, 45.0);
        t.update_timing(ValidationTier::Fast, 60.0);
        assert_eq!(t.get_timing(ValidationTier::Fast), 50.0);
        assert!(t.history(ValidationTier::Fast).is_empty());
    }

    #[test]
    fn history_is_capped() {
        let config = TimingConfig {
            max_history: 5,
            ..TimingConfig::default()
        };
        let t = AdaptiveTimer::new(&config, EventEmitter::disabled());
        for _ in 0..20 {
            t.update_timing(ValidationTier::Fast, 500.0);
        }
        assert_eq!(t.history(ValidationTier::Fast).len(), 5);
        assert_eq!(t.snapshot().adjustments, 5);
    }

    #[test]
    fn adjustments_are_emitted() {
        let (events, rx) = EventEmitter::bounded(4);
        let t = AdaptiveTimer::new(&TimingConfig::default(), events);
        t.update_timing(ValidationTier::Fast, 1_000.0);

        assert_eq!(
            rx.try_recv().unwrap(),
            GateEvent::TimingAdjusted {
                tier: ValidationTier::Fast,
                previous_ms: 50.0,
                current_ms: 60.0,
            }
        );
    }
}

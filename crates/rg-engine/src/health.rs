use chrono::{DateTime, Utc};
use rg_risk::BreakerHealth;
use rg_store::ConnectionHealth;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::balancer::BalancerHealth;

const HEALTHY_SCORE: f64 = 0.9;
const DEGRADED_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

/// Combined view of the store connection, worker pool and breakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// Lower of the balancer and breaker scores
    pub score: f64,
    pub running: bool,
    pub connection: ConnectionHealth,
    pub balancer: BalancerHealth,
    pub breakers: BreakerHealth,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealth {
    /// An unreachable store is always unhealthy. Otherwise the weakest of
    /// the balancer and breaker scores decides.
    pub fn assess(
        running: bool,
        connection: ConnectionHealth,
        balancer: BalancerHealth,
        breakers: BreakerHealth,
    ) -> Self {
        let score = balancer.overall.min(breakers.health_score);
        let status = if !running || !connection.is_healthy() {
            HealthStatus::Unhealthy
        } else if score >= HEALTHY_SCORE {
            HealthStatus::Healthy
        } else if score >= DEGRADED_SCORE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        Self {
            status,
            score,
            running,
            connection,
            balancer,
            breakers,
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

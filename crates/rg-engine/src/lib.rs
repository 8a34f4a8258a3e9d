// RiskGate validation pipeline: adaptive timing, worker pool and the
// streamlined risk manager that ties them together.

pub mod balancer;
pub mod context;
pub mod health;
pub mod manager;
pub mod timer;

pub use balancer::{
    BalancerHealth, BalancerStats, LoadBalancer, RequestProcessor, WorkerStats,
};
pub use context::RiskGateContext;
pub use health::{HealthStatus, SystemHealth};
pub use manager::{tier_for, ManagerStats, StreamlinedRiskManager};
pub use timer::{AdaptiveTimer, TimingAdjustment, TimingSnapshot, TimingTier};

//! Streamlined Risk Manager.
//!
//! Requests enter through [`StreamlinedRiskManager::submit`], wait on a
//! bounded submission queue, are handed to the [`LoadBalancer`] by a single
//! dispatch task and validated on a worker under the tier's circuit breaker.
//! Results are kept per request id until they age out.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rg_risk::{
    assess, correlation_check, essential_checks, market_condition_check,
    portfolio_exposure_check, read_portfolio_exposure, BreakerError, BreakerStats, CacheStats,
};
use rg_store::{keys, ConnectionStats, StoreConnector};
use rg_types::{
    internal_error, EventEmitter, FailureReason, GateEvent, RequestId, RequestPriority,
    RequestState, RgError, RgResult, RiskGateConfig, RiskRequest, StrategyType, TradePayload,
    ValidationResult, ValidationStatus, ValidationTier, COMPREHENSIVE_VALIDATION_BREAKER,
    FAST_VALIDATION_BREAKER,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::balancer::{BalancerStats, LoadBalancer, RequestProcessor};
use crate::context::RiskGateContext;
use crate::health::SystemHealth;
use crate::timer::TimingSnapshot;

/// UltraHigh requests take the fast tier, everything else the full one.
pub fn tier_for(priority: RequestPriority) -> ValidationTier {
    match priority {
        RequestPriority::UltraHigh => ValidationTier::Fast,
        RequestPriority::High | RequestPriority::Medium | RequestPriority::Low => {
            ValidationTier::Comprehensive
        }
    }
}

fn breaker_for(tier: ValidationTier) -> &'static str {
    match tier {
        ValidationTier::Fast => FAST_VALIDATION_BREAKER,
        ValidationTier::Comprehensive => COMPREHENSIVE_VALIDATION_BREAKER,
    }
}

fn rank(state: RequestState) -> u8 {
    match state {
        RequestState::Submitted => 0,
        RequestState::Queued => 1,
        RequestState::Routed => 2,
        RequestState::FastValidated | RequestState::ComprehensiveValidated => 3,
        RequestState::Completed | RequestState::Failed => 4,
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Completed(Box<ValidationResult>),
    Failed(FailureReason),
}

#[derive(Debug, Clone)]
struct RequestRecord {
    state: RequestState,
    submitted_at: Instant,
    timeout: Duration,
    finished_at: Option<Instant>,
    outcome: Option<Outcome>,
}

impl RequestRecord {
    fn new(request: &RiskRequest) -> Self {
        Self {
            state: RequestState::Submitted,
            submitted_at: request.submitted_at,
            timeout: request.timeout,
            finished_at: None,
            outcome: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    fast: AtomicU64,
    comprehensive: AtomicU64,
    passed: AtomicU64,
    blocked: AtomicU64,
    validation_us: AtomicU64,
}

/// State shared by the manager, the dispatch task and the worker callback.
#[derive(Debug)]
struct Shared {
    ctx: Arc<RiskGateContext>,
    records: DashMap<RequestId, RequestRecord>,
    counters: Counters,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl Shared {
    /// Move a live record forward. Never moves backwards or out of a
    /// terminal state.
    fn advance(&self, id: RequestId, state: RequestState) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if rank(state) > rank(record.state) {
                record.state = state;
            }
        }
    }

    /// Store the outcome unless the record already finished.
    fn finish(&self, id: RequestId, outcome: Outcome) -> bool {
        let Some(mut record) = self.records.get_mut(&id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        record.state = match outcome {
            Outcome::Completed(_) => RequestState::Completed,
            Outcome::Failed(_) => RequestState::Failed,
        };
        record.finished_at = Some(Instant::now());
        record.outcome = Some(outcome);
        true
    }

    async fn complete(&self, result: ValidationResult) {
        let id = result.request_id;
        let (tier, passed, duration_ms) = (result.tier, result.passed, result.duration_ms);
        let message = serde_json::to_string(&result);

        if !self.finish(id, Outcome::Completed(Box::new(result))) {
            return;
        }
        let c = &self.counters;
        c.completed.fetch_add(1, Ordering::Relaxed);
        match tier {
            ValidationTier::Fast => c.fast.fetch_add(1, Ordering::Relaxed),
            ValidationTier::Comprehensive => c.comprehensive.fetch_add(1, Ordering::Relaxed),
        };
        if passed {
            c.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            c.blocked.fetch_add(1, Ordering::Relaxed);
        }
        c.validation_us
            .fetch_add((duration_ms * 1_000.0) as u64, Ordering::Relaxed);

        debug!(request_id = %id, %tier, passed, duration_ms, "Validation completed");
        self.ctx.events.emit(GateEvent::RequestCompleted {
            request_id: id,
            tier,
            passed,
            duration_ms,
        });

        match message {
            Ok(message) => self.publish(keys::DECISIONS_CHANNEL, message).await,
            Err(e) => error!(request_id = %id, error = %e, "Failed to serialize decision"),
        }
    }

    async fn fail(&self, id: RequestId, reason: FailureReason) {
        if !self.finish(id, Outcome::Failed(reason.clone())) {
            return;
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(request_id = %id, %reason, "Request failed");
        self.ctx.events.emit(GateEvent::RequestFailed {
            request_id: id,
            reason: reason.clone(),
        });

        let alert = serde_json::json!({
            "request_id": id,
            "reason": reason,
            "timestamp": Utc::now(),
        });
        self.publish(keys::ALERTS_CHANNEL, alert.to_string()).await;
    }

    async fn publish(&self, channel: &'static str, message: String) {
        let sent = self
            .ctx
            .connections
            .with_connection(|conn| async move { conn.publish(channel, message).await })
            .await;
        if let Err(e) = sent {
            debug!(channel, error = %e, "Publish skipped");
        }
    }

    fn prune(&self, retention: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| r.finished_at.map_or(true, |at| at.elapsed() < retention));
        before.saturating_sub(self.records.len())
    }

    fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }
}

/// Worker callback: validates one request under its tier's breaker.
struct RiskProcessor {
    shared: Arc<Shared>,
}

impl RiskProcessor {
    async fn validate(
        &self,
        request: &RiskRequest,
        tier: ValidationTier,
        started: Instant,
    ) -> Result<ValidationResult, FailureReason> {
        let ctx = &self.shared.ctx;
        let limits = ctx.limits.get_limits(&request.strategy, &request.symbol).await;
        let mut checks = essential_checks(&request.payload, &limits);

        match tier {
            ValidationTier::Fast => {
                self.shared.advance(request.id, RequestState::FastValidated);
            }
            ValidationTier::Comprehensive => {
                let exposure = read_portfolio_exposure(&ctx.connections)
                    .await
                    .map_err(|e| FailureReason::Connection {
                        message: e.to_string(),
                    })?;
                let signals = limits.signals.as_ref();
                checks.push(portfolio_exposure_check(
                    exposure,
                    &request.payload,
                    &ctx.config.checks,
                ));
                checks.push(market_condition_check(signals, &ctx.config.checks));
                checks.push(correlation_check(signals, &ctx.config.checks));
                self.shared
                    .advance(request.id, RequestState::ComprehensiveValidated);
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;
        Ok(assess(request, tier, checks, &limits, duration_ms))
    }
}

#[async_trait]
impl RequestProcessor for RiskProcessor {
    async fn process(&self, request: RiskRequest) -> Result<(), FailureReason> {
        let ctx = &self.shared.ctx;
        let tier = tier_for(request.priority);
        let breaker = ctx.breakers.get_or_create(breaker_for(tier));
        let budget_ms = ctx.timer.get_timing(tier);

        let started = Instant::now();
        let outcome = breaker
            .call(|| self.validate(&request, tier, started))
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        // fail-fast rejections say nothing about validation latency
        if !matches!(outcome, Err(BreakerError::Open { .. })) {
            ctx.timer.update_timing(tier, elapsed_ms);
            if elapsed_ms > budget_ms {
                warn!(
                    request_id = %request.id,
                    %tier,
                    elapsed_ms,
                    budget_ms,
                    "Validation exceeded timing budget"
                );
            }
        }

        match outcome {
            Ok(result) => {
                self.shared.complete(result).await;
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    BreakerError::Open { name } => FailureReason::CircuitOpen { breaker: name },
                    BreakerError::Inner(reason) => reason,
                };
                self.shared.fail(request.id, reason.clone()).await;
                Err(reason)
            }
        }
    }

    async fn reject(&self, request: RiskRequest, reason: FailureReason) {
        self.shared.fail(request.id, reason).await;
    }
}

/// Point-in-time manager statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub running: bool,
    pub uptime_secs: f64,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
    pub fast_validations: u64,
    pub comprehensive_validations: u64,
    pub passed: u64,
    pub blocked: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Completed validations per second since start
    pub throughput: f64,
    pub avg_validation_ms: f64,
    pub timing: TimingSnapshot,
    pub balancer: BalancerStats,
    pub breakers: Vec<BreakerStats>,
    pub limits_cache: CacheStats,
    pub connections: ConnectionStats,
}

impl ManagerStats {
    fn store_fields(&self) -> HashMap<String, String> {
        [
            ("running", self.running.to_string()),
            ("submitted", self.submitted.to_string()),
            ("rejected", self.rejected.to_string()),
            ("completed", self.completed.to_string()),
            ("failed", self.failed.to_string()),
            ("pending", self.pending.to_string()),
            ("passed", self.passed.to_string()),
            ("blocked", self.blocked.to_string()),
            ("success_rate", format!("{:.4}", self.success_rate)),
            ("throughput", format!("{:.2}", self.throughput)),
            ("avg_validation_ms", format!("{:.3}", self.avg_validation_ms)),
            ("fast_budget_ms", format!("{:.1}", self.timing.fast_current_ms)),
            (
                "comprehensive_budget_ms",
                format!("{:.1}", self.timing.comprehensive_current_ms),
            ),
            ("updated_at", Utc::now().to_rfc3339()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

fn collect_stats(shared: &Shared, balancer: &LoadBalancer) -> ManagerStats {
    let c = &shared.counters;
    let completed = c.completed.load(Ordering::Relaxed);
    let failed = c.failed.load(Ordering::Relaxed);
    let finished = completed + failed;
    let uptime_secs = shared.uptime().as_secs_f64();
    let ctx = &shared.ctx;

    ManagerStats {
        running: shared.running.load(Ordering::SeqCst),
        uptime_secs,
        submitted: c.submitted.load(Ordering::Relaxed),
        rejected: c.rejected.load(Ordering::Relaxed),
        completed,
        failed,
        pending: shared
            .records
            .iter()
            .filter(|r| !r.state.is_terminal())
            .count(),
        fast_validations: c.fast.load(Ordering::Relaxed),
        comprehensive_validations: c.comprehensive.load(Ordering::Relaxed),
        passed: c.passed.load(Ordering::Relaxed),
        blocked: c.blocked.load(Ordering::Relaxed),
        success_rate: if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        },
        failure_rate: if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        },
        throughput: if uptime_secs > 0.0 {
            completed as f64 / uptime_secs
        } else {
            0.0
        },
        avg_validation_ms: if completed == 0 {
            0.0
        } else {
            c.validation_us.load(Ordering::Relaxed) as f64 / completed as f64 / 1_000.0
        },
        timing: ctx.timer.snapshot(),
        balancer: balancer.stats(),
        breakers: ctx.breakers.all_stats(),
        limits_cache: ctx.limits.cache_stats(),
        connections: ctx.connections.stats(),
    }
}

async fn collect_health(shared: &Shared, balancer: &LoadBalancer) -> SystemHealth {
    let connection = shared.ctx.connections.health_check().await;
    SystemHealth::assess(
        shared.running.load(Ordering::SeqCst),
        connection,
        balancer.health_check(),
        shared.ctx.breakers.health_check(),
    )
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    balancer: Arc<LoadBalancer>,
    mut rx: mpsc::Receiver<RiskRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = rx.recv() => next,
        };
        let Some(request) = next else { break };

        let id = request.id;
        shared.advance(id, RequestState::Routed);
        if let Err(e) = balancer.route_request(request) {
            shared
                .fail(
                    id,
                    FailureReason::RoutingFailure {
                        message: e.to_string(),
                    },
                )
                .await;
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Ok(request) = rx.try_recv() {
        shared.fail(request.id, FailureReason::Cancelled).await;
        drained += 1;
    }
    debug!(drained, "Dispatch loop stopped");
}

async fn monitor_loop(
    shared: Arc<Shared>,
    balancer: Arc<LoadBalancer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let manager = &shared.ctx.config.manager;
    let retention = Duration::from_millis(manager.result_retention_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(manager.monitor_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let pruned = shared.prune(retention);
        if pruned > 0 {
            debug!(pruned, "Pruned finished request records");
        }

        let fields = collect_stats(&shared, &balancer).store_fields();
        let health = collect_health(&shared, &balancer).await;
        let health_json = match serde_json::to_string(&health) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize health");
                continue;
            }
        };

        let written = shared
            .ctx
            .connections
            .with_connection(|conn| async move {
                conn.hset(keys::STATS, fields).await?;
                conn.set(keys::HEALTH, health_json).await
            })
            .await;
        if let Err(e) = written {
            warn!(error = %e, "Failed to write status to store");
        }
    }
    debug!("Monitor loop stopped");
}

/// Entry point of the validation pipeline.
pub struct StreamlinedRiskManager {
    shared: Arc<Shared>,
    balancer: Arc<LoadBalancer>,
    submit_tx: mpsc::Sender<RiskRequest>,
    submit_rx: Mutex<Option<mpsc::Receiver<RiskRequest>>>,
    dispatch_stop: watch::Sender<bool>,
    monitor_stop: watch::Sender<bool>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamlinedRiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamlinedRiskManager")
            .field("running", &self.is_running())
            .field("records", &self.shared.records.len())
            .field("balancer", &self.balancer)
            .finish()
    }
}

impl StreamlinedRiskManager {
    pub fn new(ctx: Arc<RiskGateContext>) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(ctx.config.manager.submission_queue_size.max(1));
        let shared = Arc::new(Shared {
            ctx,
            records: DashMap::new(),
            counters: Counters::default(),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        });
        let processor = Arc::new(RiskProcessor {
            shared: shared.clone(),
        });
        let balancer = Arc::new(LoadBalancer::new(
            &shared.ctx.config.balancer,
            processor,
        ));
        let (dispatch_stop, _) = watch::channel(false);
        let (monitor_stop, _) = watch::channel(false);

        Self {
            shared,
            balancer,
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            dispatch_stop,
            monitor_stop,
            dispatch_task: Mutex::new(None),
            monitor_task: Mutex::new(None),
        }
    }

    /// Build the context from `config` and wrap it in a manager.
    pub fn from_config(
        config: RiskGateConfig,
        connector: Arc<dyn StoreConnector>,
        events: EventEmitter,
    ) -> RgResult<Self> {
        let ctx = RiskGateContext::new(config, connector, events)?;
        Ok(Self::new(Arc::new(ctx)))
    }

    pub fn context(&self) -> &Arc<RiskGateContext> {
        &self.shared.ctx
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start workers, the dispatch task and the monitor task.
    pub fn start(&self) -> RgResult<()> {
        let rx = self
            .submit_rx
            .lock()
            .take()
            .ok_or_else(|| internal_error!("risk manager already started"))?;
        self.balancer.start()?;

        *self.dispatch_task.lock() = Some(tokio::spawn(dispatch_loop(
            self.shared.clone(),
            self.balancer.clone(),
            rx,
            self.dispatch_stop.subscribe(),
        )));
        *self.monitor_task.lock() = Some(tokio::spawn(monitor_loop(
            self.shared.clone(),
            self.balancer.clone(),
            self.monitor_stop.subscribe(),
        )));

        *self.shared.started_at.lock() = Some(Instant::now());
        self.shared.running.store(true, Ordering::SeqCst);
        info!(
            workers = self.balancer.worker_count(),
            queue = self.shared.ctx.config.manager.submission_queue_size,
            "Streamlined risk manager started"
        );
        Ok(())
    }

    /// Queue a validation request without waiting for it.
    pub fn submit(
        &self,
        strategy: &str,
        symbol: &str,
        payload: TradePayload,
    ) -> RgResult<RequestId> {
        if !self.is_running() {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RgError::SubmissionRejected {
                reason: "risk manager is not running".to_string(),
            });
        }

        let strategy = StrategyType::parse(strategy);
        let timeout = self
            .shared
            .ctx
            .config
            .manager
            .timeout_for(strategy.priority());
        let request = RiskRequest::new(strategy, symbol, payload, timeout);
        let id = request.id;
        let priority = request.priority;

        self.shared.records.insert(id, RequestRecord::new(&request));
        match self.submit_tx.try_send(request) {
            Ok(()) => {
                self.shared.advance(id, RequestState::Queued);
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %id, ?priority, symbol, "Request queued");
                Ok(id)
            }
            Err(e) => {
                self.shared.records.remove(&id);
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "submission queue full",
                    mpsc::error::TrySendError::Closed(_) => "submission queue closed",
                };
                warn!(request_id = %id, reason, "Submission rejected");
                Err(RgError::SubmissionRejected {
                    reason: reason.to_string(),
                })
            }
        }
    }

    /// Status of `id`. A request still pending past its timeout is recorded
    /// and reported as timed out.
    pub fn get_validation_result(&self, id: RequestId) -> ValidationStatus {
        let timed_out = {
            let Some(mut record) = self.shared.records.get_mut(&id) else {
                return ValidationStatus::Unknown;
            };
            match &record.outcome {
                Some(Outcome::Completed(result)) => {
                    return ValidationStatus::Completed {
                        result: result.clone(),
                    }
                }
                Some(Outcome::Failed(reason)) => {
                    return ValidationStatus::Failed {
                        reason: reason.clone(),
                    }
                }
                None => {}
            }

            let age = record.submitted_at.elapsed();
            if age <= record.timeout {
                return ValidationStatus::Pending {
                    state: record.state,
                };
            }

            let reason = FailureReason::TimedOut {
                waited_ms: age.as_millis() as u64,
            };
            record.state = RequestState::Failed;
            record.finished_at = Some(Instant::now());
            record.outcome = Some(Outcome::Failed(reason.clone()));
            reason
        };

        self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(request_id = %id, reason = %timed_out, "Pending request expired");
        self.shared.ctx.events.emit(GateEvent::RequestFailed {
            request_id: id,
            reason: timed_out.clone(),
        });
        ValidationStatus::Failed { reason: timed_out }
    }

    pub async fn health_check(&self) -> SystemHealth {
        collect_health(&self.shared, &self.balancer).await
    }

    pub fn stats(&self) -> ManagerStats {
        collect_stats(&self.shared, &self.balancer)
    }

    /// Stop dispatch (queued submissions fail as cancelled), drain and stop
    /// the workers, stop the monitor, then close the store connection.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down streamlined risk manager");

        let _ = self.dispatch_stop.send(true);
        let dispatch = self.dispatch_task.lock().take();
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch task failed");
            }
        }

        self.balancer.stop().await;

        let _ = self.monitor_stop.send(true);
        let monitor = self.monitor_task.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                error!(error = %e, "Monitor task failed");
            }
        }

        self.shared.ctx.connections.close();
        let stats = self.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            "Streamlined risk manager stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_risk::{CORRELATION_CHECK, PORTFOLIO_EXPOSURE_CHECK};
    use rg_store::{InMemoryConnector, InMemoryStore};
    use rg_types::{LimitSource, RiskLevel};
    use rust_decimal_macros::dec;

    fn manager(store: &Arc<InMemoryStore>, config: RiskGateConfig) -> StreamlinedRiskManager {
        StreamlinedRiskManager::from_config(
            config,
            Arc::new(InMemoryConnector::new(store.clone())),
            EventEmitter::disabled(),
        )
        .unwrap()
    }

    async fn wait_for(manager: &StreamlinedRiskManager, id: RequestId) -> ValidationStatus {
        loop {
            let status = manager.get_validation_result(id);
            if !status.is_pending() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn small_trade() -> TradePayload {
        TradePayload::new(dec!(0.01), dec!(1), dec!(0.001))
    }

    #[tokio::test]
    async fn submit_requires_running_manager() {
        let store = InMemoryStore::shared();
        let m = manager(&store, RiskGateConfig::default());

        let err = m.submit("arbitrage", "BTCUSD", small_trade()).unwrap_err();
        assert!(matches!(err, RgError::SubmissionRejected { .. }));
        assert_eq!(m.stats().rejected, 1);
        assert_eq!(m.get_validation_result(RequestId::new_v4()), ValidationStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_path_publishes_decision() {
        let store = InMemoryStore::shared();
        let mut decisions = store.subscribe(keys::DECISIONS_CHANNEL);
        let m = manager(&store, RiskGateConfig::default());
        m.start().unwrap();

        let id = m.submit("market_making", "EURUSD", small_trade()).unwrap();
        let status = wait_for(&m, id).await;
        let result = status.result().unwrap();

        assert!(result.passed);
        assert_eq!(result.tier, ValidationTier::Fast);
        assert_eq!(result.checks.len(), 3);
        assert_eq!(result.risk_level, RiskLevel::Low);

        let published: serde_json::Value =
            serde_json::from_str(&decisions.recv().await.unwrap()).unwrap();
        assert_eq!(published["request_id"], serde_json::json!(id));
        assert_eq!(published["passed"], serde_json::json!(true));

        let stats = m.stats();
        assert_eq!((stats.completed, stats.fast_validations, stats.passed), (1, 1, 1));
        m.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn comprehensive_path_reads_portfolio_exposure() {
        let store = InMemoryStore::shared();
        store.put_string(keys::PORTFOLIO_EXPOSURE, "0.95");
        let m = manager(&store, RiskGateConfig::default());
        m.start().unwrap();

        let id = m
            .submit("htf", "SPY", TradePayload::new(dec!(0.1), dec!(1), dec!(0.01)))
            .unwrap();
        let status = wait_for(&m, id).await;
        let result = status.result().unwrap();

        assert_eq!(result.tier, ValidationTier::Comprehensive);
        assert_eq!(result.checks.len(), 6);
        assert!(!result.passed);
        let failed: Vec<_> = result
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(failed, vec![PORTFOLIO_EXPOSURE_CHECK]);
        assert!(result.checks.iter().any(|c| c.name == CORRELATION_CHECK));
        assert_eq!(m.stats().blocked, 1);
        m.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_fails_comprehensive_requests() {
        let store = InMemoryStore::shared();
        store.set_available(false);
        let mut config = RiskGateConfig::default();
        config.store.retry_attempts = 1;
        let m = manager(&store, config);
        m.start().unwrap();

        let id = m.submit("news_driven", "AAPL", small_trade()).unwrap();
        assert!(matches!(
            wait_for(&m, id).await,
            ValidationStatus::Failed {
                reason: FailureReason::Connection { .. }
            }
        ));

        // the fast tier has no store dependency beyond the limits fallback
        let id = m.submit("arbitrage", "BTCUSD", small_trade()).unwrap();
        let status = wait_for(&m, id).await;
        assert!(matches!(
            status.result().unwrap().limit_source,
            LimitSource::BaseFallback { .. }
        ));
        m.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pending_request_reports_timeout() {
        let store = InMemoryStore::shared();
        let m = manager(&store, RiskGateConfig::default());

        let request = RiskRequest::new(
            StrategyType::Arbitrage,
            "BTCUSD",
            small_trade(),
            Duration::from_millis(10),
        );
        let id = request.id;
        m.shared.records.insert(id, RequestRecord::new(&request));
        m.shared.advance(id, RequestState::Queued);

        assert_eq!(
            m.get_validation_result(id),
            ValidationStatus::Pending {
                state: RequestState::Queued
            }
        );
        tokio::time::advance(Duration::from_millis(25)).await;

        assert!(matches!(
            m.get_validation_result(id),
            ValidationStatus::Failed {
                reason: FailureReason::TimedOut { waited_ms: 25 }
            }
        ));
        // recorded once, not recomputed
        assert!(matches!(
            m.get_validation_result(id),
            ValidationStatus::Failed { .. }
        ));
        assert_eq!(m.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_writes_status_and_prunes() {
        let store = InMemoryStore::shared();
        let mut config = RiskGateConfig::default();
        config.manager.monitor_interval_ms = 100;
        config.manager.result_retention_ms = 200;
        let m = manager(&store, config);
        m.start().unwrap();

        let id = m.submit("arbitrage", "BTCUSD", small_trade()).unwrap();
        assert!(wait_for(&m, id).await.result().is_some());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(m.get_validation_result(id), ValidationStatus::Unknown);

        let stats = store.hash_value(keys::STATS).unwrap();
        assert_eq!(stats["completed"], "1");
        let health: serde_json::Value =
            serde_json::from_str(&store.string_value(keys::HEALTH).unwrap()).unwrap();
        assert_eq!(health["status"], "healthy");
        m.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let store = InMemoryStore::shared();
        let m = manager(&store, RiskGateConfig::default());
        m.start().unwrap();
        assert!(m.start().is_err());

        m.shutdown().await;
        assert!(!m.is_running());
        assert!(m.context().connections.is_closed());
        assert!(!m.balancer().is_running());
        assert!(m.submit("htf", "SPY", small_trade()).is_err());
        assert!(!m.health_check().await.is_healthy());
    }
}

//! Load Balancer and worker pool.
//!
//! Each worker owns a bounded FIFO queue drained by one tokio task. The
//! balancer picks a worker per request according to the active
//! [`RoutingStrategy`], falling back to other choices when the first queue is
//! full. ULTRA_HIGH requests always go to the fastest worker.

use async_trait::async_trait;
use parking_lot::Mutex;
use rg_types::{
    internal_error, BalancerConfig, FailureReason, RequestPriority, RgResult, RiskRequest,
    RoutingError, RoutingStrategy,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const ROUTING_TIME_WINDOW: usize = 1_000;

/// Work performed for each dequeued request.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, request: RiskRequest) -> Result<(), FailureReason>;

    /// Called for requests dropped without processing.
    async fn reject(&self, request: RiskRequest, reason: FailureReason);
}

#[derive(Debug)]
struct WorkerMetrics {
    queue_len: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    running: AtomicBool,
    latencies: Mutex<VecDeque<f64>>,
    window: usize,
}

impl WorkerMetrics {
    fn new(window: usize) -> Self {
        Self {
            queue_len: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            latencies: Mutex::new(VecDeque::with_capacity(window)),
            window,
        }
    }

    fn record(&self, latency_ms: f64, ok: bool) {
        if ok {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = self.latencies.lock();
        latencies.push_back(latency_ms);
        while latencies.len() > self.window {
            latencies.pop_front();
        }
    }

    /// Rolling average, `None` until the first processed request.
    fn avg_latency_ms(&self) -> Option<f64> {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        }
    }

    fn success_rate(&self) -> f64 {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        match processed + failed {
            0 => 1.0,
            total => processed as f64 / total as f64,
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    tx: mpsc::Sender<RiskRequest>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    /// Enqueue without waiting, handing the request back when refused.
    fn try_enqueue(&self, request: RiskRequest) -> Result<(), RiskRequest> {
        self.metrics.queue_len.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(request))
            | Err(mpsc::error::TrySendError::Closed(request)) => {
                self.metrics.queue_len.fetch_sub(1, Ordering::SeqCst);
                Err(request)
            }
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            running: self.metrics.running.load(Ordering::Relaxed),
            queue_len: self.metrics.queue_len.load(Ordering::Relaxed),
            processed: self.metrics.processed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            avg_latency_ms: self.metrics.avg_latency_ms(),
            success_rate: self.metrics.success_rate(),
        }
    }
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<RiskRequest>,
    metrics: Arc<WorkerMetrics>,
    processor: Arc<dyn RequestProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    metrics.running.store(true, Ordering::SeqCst);
    debug!(worker = id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = rx.recv() => next,
        };
        let Some(request) = next else { break };
        metrics.queue_len.fetch_sub(1, Ordering::SeqCst);

        if request.is_expired() {
            let waited_ms = request.age().as_millis() as u64;
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            debug!(worker = id, request_id = %request.id, waited_ms, "Dropping expired request");
            processor
                .reject(request, FailureReason::TimedOut { waited_ms })
                .await;
            continue;
        }

        let started = Instant::now();
        let outcome = processor.process(request).await;
        metrics.record(started.elapsed().as_secs_f64() * 1_000.0, outcome.is_ok());
    }

    rx.close();
    let mut drained = 0usize;
    while let Ok(request) = rx.try_recv() {
        metrics.queue_len.fetch_sub(1, Ordering::SeqCst);
        processor.reject(request, FailureReason::Cancelled).await;
        drained += 1;
    }
    metrics.running.store(false, Ordering::SeqCst);
    debug!(worker = id, drained, "Worker stopped");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub id: usize,
    pub running: bool,
    pub queue_len: usize,
    pub processed: u64,
    pub failed: u64,
    pub avg_latency_ms: Option<f64>,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerStats {
    pub total_requests: u64,
    pub successful_routes: u64,
    pub failed_routes: u64,
    pub total_load: usize,
    pub average_load: f64,
    pub active_workers: usize,
    pub avg_routing_time_us: f64,
    pub routing_strategy: RoutingStrategy,
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerHealth {
    pub lb_success_rate: f64,
    pub mean_worker_success_rate: f64,
    /// Mean of the two rates above
    pub overall: f64,
    pub workers: Vec<WorkerStats>,
}

pub struct LoadBalancer {
    workers: Vec<Worker>,
    receivers: Mutex<Vec<mpsc::Receiver<RiskRequest>>>,
    processor: Arc<dyn RequestProcessor>,
    strategy: Mutex<RoutingStrategy>,
    next_rr: AtomicUsize,
    total_requests: AtomicU64,
    successful_routes: AtomicU64,
    failed_routes: AtomicU64,
    routing_times_us: Mutex<VecDeque<f64>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("workers", &self.workers.len())
            .field("strategy", &*self.strategy.lock())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(config: &BalancerConfig, processor: Arc<dyn RequestProcessor>) -> Self {
        let mut workers = Vec::with_capacity(config.num_workers);
        let mut receivers = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
            workers.push(Worker {
                id,
                tx,
                metrics: Arc::new(WorkerMetrics::new(config.latency_window.max(1))),
            });
            receivers.push(rx);
        }
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            workers,
            receivers: Mutex::new(receivers),
            processor,
            strategy: Mutex::new(config.routing_strategy),
            next_rr: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            successful_routes: AtomicU64::new(0),
            failed_routes: AtomicU64::new(0),
            routing_times_us: Mutex::new(VecDeque::with_capacity(ROUTING_TIME_WINDOW)),
            running: AtomicBool::new(false),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one task per worker. A balancer can only be started once.
    pub fn start(&self) -> RgResult<()> {
        let receivers: Vec<_> = std::mem::take(&mut *self.receivers.lock());
        if receivers.is_empty() {
            return Err(internal_error!("load balancer already started"));
        }

        let mut handles = self.handles.lock();
        for (worker, rx) in self.workers.iter().zip(receivers) {
            handles.push(tokio::spawn(run_worker(
                worker.id,
                rx,
                worker.metrics.clone(),
                self.processor.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }
        self.running.store(true, Ordering::SeqCst);
        info!(
            workers = self.workers.len(),
            strategy = %self.routing_strategy(),
            "Load balancer started"
        );
        Ok(())
    }

    /// Signal every worker, let them drain their queues and wait for them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Load balancer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn routing_strategy(&self) -> RoutingStrategy {
        *self.strategy.lock()
    }

    pub fn set_routing_strategy(&self, strategy: RoutingStrategy) {
        info!(%strategy, "Routing strategy changed");
        *self.strategy.lock() = strategy;
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Hand `request` to a worker queue, returning the worker id.
    pub fn route_request(&self, request: RiskRequest) -> Result<usize, RoutingError> {
        if !self.is_running() {
            return Err(RoutingError::NotRunning);
        }
        if self.workers.is_empty() {
            return Err(RoutingError::NoWorkers);
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let strategy = if request.priority == RequestPriority::UltraHigh {
            RoutingStrategy::FastestWorker
        } else {
            self.routing_strategy()
        };
        let primary = self.select(strategy, request.priority);
        let request_id = request.id;

        let mut tried = Vec::with_capacity(4);
        let mut pending = request;
        // fallbacks are resolved only when reached so the round-robin
        // cursor moves once per use
        for attempt in 0..4 {
            let idx = match attempt {
                0 => primary,
                1 => self.least_loaded(),
                2 => self.fastest(),
                _ => self.round_robin(),
            };
            if tried.contains(&idx) {
                continue;
            }
            tried.push(idx);

            match self.workers[idx].try_enqueue(pending) {
                Ok(()) => {
                    self.successful_routes.fetch_add(1, Ordering::Relaxed);
                    self.record_routing_time(started);
                    debug!(%request_id, worker = idx, attempts = tried.len(), "Request routed");
                    return Ok(idx);
                }
                Err(back) => pending = back,
            }
        }

        self.failed_routes.fetch_add(1, Ordering::Relaxed);
        self.record_routing_time(started);
        warn!(%request_id, attempts = tried.len(), "All worker queues full");
        Err(RoutingError::Saturated {
            request_id: request_id.to_string(),
            attempts: tried.len() as u32,
        })
    }

    fn select(&self, strategy: RoutingStrategy, priority: RequestPriority) -> usize {
        match strategy {
            RoutingStrategy::RoundRobin => self.round_robin(),
            RoutingStrategy::LeastLoaded => self.least_loaded(),
            RoutingStrategy::FastestWorker => self.fastest(),
            RoutingStrategy::PriorityBased => match priority {
                RequestPriority::UltraHigh => self.fastest(),
                RequestPriority::High => self.least_loaded(),
                RequestPriority::Medium | RequestPriority::Low => self.round_robin(),
            },
        }
    }

    fn round_robin(&self) -> usize {
        self.next_rr.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    fn least_loaded(&self) -> usize {
        self.workers
            .iter()
            .min_by_key(|w| w.metrics.queue_len.load(Ordering::Relaxed))
            .map(|w| w.id)
            .unwrap_or(0)
    }

    /// Lowest rolling latency among workers with history, else least loaded.
    fn fastest(&self) -> usize {
        self.workers
            .iter()
            .filter_map(|w| w.metrics.avg_latency_ms().map(|avg| (w.id, avg)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
            .unwrap_or_else(|| self.least_loaded())
    }

    fn record_routing_time(&self, started: Instant) {
        let us = started.elapsed().as_secs_f64() * 1_000_000.0;
        let mut times = self.routing_times_us.lock();
        times.push_back(us);
        while times.len() > ROUTING_TIME_WINDOW {
            times.pop_front();
        }
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(Worker::stats).collect()
    }

    pub fn stats(&self) -> BalancerStats {
        let workers = self.worker_stats();
        let total_load: usize = workers.iter().map(|w| w.queue_len).sum();
        let avg_routing_time_us = {
            let times = self.routing_times_us.lock();
            if times.is_empty() {
                0.0
            } else {
                times.iter().sum::<f64>() / times.len() as f64
            }
        };

        BalancerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_routes: self.successful_routes.load(Ordering::Relaxed),
            failed_routes: self.failed_routes.load(Ordering::Relaxed),
            total_load,
            average_load: total_load as f64 / workers.len().max(1) as f64,
            active_workers: workers.iter().filter(|w| w.running).count(),
            avg_routing_time_us,
            routing_strategy: self.routing_strategy(),
            workers,
        }
    }

    pub fn health_check(&self) -> BalancerHealth {
        let workers = self.worker_stats();
        let total = self.total_requests.load(Ordering::Relaxed);
        let lb_success_rate = if total == 0 {
            1.0
        } else {
            self.successful_routes.load(Ordering::Relaxed) as f64 / total as f64
        };
        let mean_worker_success_rate = if workers.is_empty() {
            0.0
        } else {
            workers.iter().map(|w| w.success_rate).sum::<f64>() / workers.len() as f64
        };

        BalancerHealth {
            lb_success_rate,
            mean_worker_success_rate,
            overall: (lb_success_rate + mean_worker_success_rate) / 2.0,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_types::{StrategyType, TradePayload};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records outcomes; optionally parks every request until released.
    #[derive(Default)]
    struct Recorder {
        processed: Mutex<Vec<(RequestPriority, String)>>,
        rejected: Mutex<Vec<FailureReason>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl RequestProcessor for Recorder {
        async fn process(&self, request: RiskRequest) -> Result<(), FailureReason> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.processed
                .lock()
                .push((request.priority, request.symbol.clone()));
            if request.symbol == "FAIL" {
                Err(FailureReason::Internal {
                    message: "boom".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn reject(&self, _request: RiskRequest, reason: FailureReason) {
            self.rejected.lock().push(reason);
        }
    }

    fn request(strategy: StrategyType, symbol: &str) -> RiskRequest {
        RiskRequest::new(strategy, symbol, TradePayload::default(), Duration::from_secs(5))
    }

    fn config(workers: usize, queue: usize, strategy: RoutingStrategy) -> BalancerConfig {
        BalancerConfig {
            num_workers: workers,
            max_queue_size: queue,
            routing_strategy: strategy,
            ..BalancerConfig::default()
        }
    }

    #[tokio::test]
    async fn routing_requires_start() {
        let lb = LoadBalancer::new(
            &config(2, 4, RoutingStrategy::RoundRobin),
            Arc::new(Recorder::default()),
        );
        assert_eq!(
            lb.route_request(request(StrategyType::Htf, "SPY")),
            Err(RoutingError::NotRunning)
        );
        lb.start().unwrap();
        assert!(lb.start().is_err());
        lb.stop().await;
    }

    #[tokio::test]
    async fn ultra_high_goes_to_fastest_worker() {
        let gate = Arc::new(Notify::new());
        let lb = LoadBalancer::new(
            &config(4, 16, RoutingStrategy::RoundRobin),
            Arc::new(Recorder {
                gate: Some(gate.clone()),
                ..Recorder::default()
            }),
        );
        lb.workers[0].metrics.record(9.0, true);
        lb.workers[1].metrics.record(4.0, true);
        lb.workers[2].metrics.record(1.5, true);
        lb.start().unwrap();

        for _ in 0..5 {
            let worker = lb
                .route_request(request(StrategyType::MarketMaking, "EURUSD"))
                .unwrap();
            assert_eq!(worker, 2);
        }

        // non-urgent traffic follows the configured strategy
        let routed: Vec<_> = (0..4)
            .map(|_| lb.route_request(request(StrategyType::Htf, "SPY")).unwrap())
            .collect();
        assert_eq!(routed, vec![0, 1, 2, 3]);

        gate.notify_waiters();
        lb.stop().await;
    }

    #[tokio::test]
    async fn round_robin_cycles_every_worker() {
        let lb = LoadBalancer::new(
            &config(4, 16, RoutingStrategy::RoundRobin),
            Arc::new(Recorder::default()),
        );
        lb.start().unwrap();

        let routed: Vec<_> = (0..8)
            .map(|_| lb.route_request(request(StrategyType::Htf, "SPY")).unwrap())
            .collect();
        assert_eq!(routed, vec![0, 1, 2, 3, 0, 1, 2, 3]);

        // other strategies leave the cursor alone
        lb.route_request(request(StrategyType::MarketMaking, "EURUSD"))
            .unwrap();
        lb.set_routing_strategy(RoutingStrategy::LeastLoaded);
        lb.route_request(request(StrategyType::Htf, "SPY")).unwrap();
        lb.set_routing_strategy(RoutingStrategy::RoundRobin);
        assert_eq!(lb.route_request(request(StrategyType::Htf, "SPY")).unwrap(), 0);

        lb.stop().await;
    }

    #[tokio::test]
    async fn fastest_without_history_falls_back_to_least_loaded() {
        let lb = LoadBalancer::new(
            &config(3, 16, RoutingStrategy::FastestWorker),
            Arc::new(Recorder::default()),
        );
        lb.workers[0].metrics.queue_len.store(5, Ordering::SeqCst);
        lb.workers[1].metrics.queue_len.store(2, Ordering::SeqCst);
        lb.workers[2].metrics.queue_len.store(7, Ordering::SeqCst);
        assert_eq!(lb.fastest(), 1);
    }

    #[tokio::test]
    async fn priority_based_selection() {
        let lb = LoadBalancer::new(
            &config(3, 16, RoutingStrategy::PriorityBased),
            Arc::new(Recorder::default()),
        );
        lb.workers[0].metrics.queue_len.store(3, Ordering::SeqCst);
        lb.workers[1].metrics.queue_len.store(1, Ordering::SeqCst);
        lb.workers[2].metrics.record(0.5, true);

        let strategy = lb.routing_strategy();
        assert_eq!(lb.select(strategy, RequestPriority::UltraHigh), 2);
        assert_eq!(lb.select(strategy, RequestPriority::High), 2);
        lb.workers[2].metrics.queue_len.store(9, Ordering::SeqCst);
        assert_eq!(lb.select(strategy, RequestPriority::High), 1);
        assert_eq!(lb.select(strategy, RequestPriority::Low), 0);
        assert_eq!(lb.select(strategy, RequestPriority::Medium), 1);
    }

    #[tokio::test]
    async fn full_queues_fall_back_then_saturate() {
        let gate = Arc::new(Notify::new());
        let recorder = Arc::new(Recorder {
            gate: Some(gate.clone()),
            ..Recorder::default()
        });
        let lb = LoadBalancer::new(&config(2, 1, RoutingStrategy::RoundRobin), recorder.clone());
        lb.start().unwrap();

        // each worker parks one request in-flight and holds one queued
        let mut accepted = 0;
        for _ in 0..4 {
            if lb.route_request(request(StrategyType::Htf, "SPY")).is_ok() {
                accepted += 1;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(accepted, 4);

        let err = lb
            .route_request(request(StrategyType::Htf, "SPY"))
            .unwrap_err();
        assert!(matches!(err, RoutingError::Saturated { attempts: 2, .. }));

        let stats = lb.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.failed_routes, 1);

        // stop drains the queued requests as cancelled, in-flight ones finish
        let stopping = tokio::spawn({
            let gate = gate.clone();
            async move {
                tokio::task::yield_now().await;
                gate.notify_waiters();
            }
        });
        lb.stop().await;
        stopping.await.unwrap();

        let rejected = recorder.rejected.lock().clone();
        assert!(rejected.iter().all(|r| *r == FailureReason::Cancelled));
        assert_eq!(recorder.processed.lock().len() + rejected.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_requests_are_not_processed() {
        let recorder = Arc::new(Recorder::default());
        let lb = LoadBalancer::new(&config(1, 8, RoutingStrategy::RoundRobin), recorder.clone());

        let stale = RiskRequest::new(
            StrategyType::Htf,
            "SPY",
            TradePayload::default(),
            Duration::from_millis(10),
        );
        tokio::time::advance(Duration::from_millis(50)).await;
        lb.start().unwrap();
        lb.route_request(stale).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        lb.stop().await;

        assert!(recorder.processed.lock().is_empty());
        assert!(matches!(
            recorder.rejected.lock().as_slice(),
            [FailureReason::TimedOut { waited_ms }] if *waited_ms >= 50
        ));
        assert_eq!(lb.worker_stats()[0].failed, 1);
    }

    #[tokio::test]
    async fn health_combines_route_and_worker_success() {
        let recorder = Arc::new(Recorder::default());
        let lb = LoadBalancer::new(&config(2, 8, RoutingStrategy::RoundRobin), recorder.clone());
        lb.start().unwrap();

        lb.route_request(request(StrategyType::Htf, "OK")).unwrap();
        lb.route_request(request(StrategyType::Htf, "FAIL")).unwrap();
        while recorder.processed.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        lb.stop().await;

        let health = lb.health_check();
        assert_eq!(health.lb_success_rate, 1.0);
        assert!((health.mean_worker_success_rate - 0.5).abs() < 1e-9);
        assert!((health.overall - 0.75).abs() < 1e-9);
        assert_eq!(lb.stats().active_workers, 0);
    }
}

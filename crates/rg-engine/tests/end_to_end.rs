use async_trait::async_trait;
use rg_engine::{LoadBalancer, RequestProcessor, StreamlinedRiskManager};
use rg_store::{InMemoryConnector, InMemoryStore};
use rg_types::{
    BalancerConfig, BreakerConfig, CircuitState, EventEmitter, FailureReason, GateEvent,
    RequestId, RiskGateConfig, RiskRequest, RoutingStrategy, StrategyType, TradePayload,
    ValidationStatus, ValidationTier, COMPREHENSIVE_VALIDATION_BREAKER, FAST_VALIDATION_BREAKER,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn manager_on(
    store: &Arc<InMemoryStore>,
    config: RiskGateConfig,
    events: EventEmitter,
) -> StreamlinedRiskManager {
    StreamlinedRiskManager::from_config(
        config,
        Arc::new(InMemoryConnector::new(store.clone())),
        events,
    )
    .unwrap()
}

async fn wait_all(manager: &StreamlinedRiskManager, ids: &[RequestId]) -> Vec<ValidationStatus> {
    loop {
        let statuses: Vec<_> = ids
            .iter()
            .map(|id| manager.get_validation_result(*id))
            .collect();
        if statuses.iter().all(|s| !s.is_pending()) {
            return statuses;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn thousand_ultra_high_requests_all_pass() {
    let store = InMemoryStore::shared();
    let mut config = RiskGateConfig::default();
    config.balancer = BalancerConfig {
        num_workers: 4,
        max_queue_size: 1_000,
        ..BalancerConfig::default()
    };
    let (events, event_rx) = EventEmitter::bounded(4_096);
    let manager = manager_on(&store, config, events);
    assert_ok!(manager.start());

    let trade = TradePayload::new(dec!(0.01), dec!(1), dec!(0.001));
    let ids: Vec<_> = (0..1_000)
        .map(|i| {
            let strategy = if i % 2 == 0 { "market_making" } else { "arbitrage" };
            manager.submit(strategy, "EURUSD", trade.clone()).unwrap()
        })
        .collect();

    let statuses = wait_all(&manager, &ids).await;
    for status in &statuses {
        let result = status.result().expect("every request completes");
        assert!(result.passed, "blocked: {:?}", result.reasons);
        assert_eq!(result.tier, ValidationTier::Fast);
    }

    let stats = manager.stats();
    assert_eq!(stats.submitted, 1_000);
    assert_eq!(stats.completed, 1_000);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.fast_validations, 1_000);
    assert_eq!(stats.balancer.failed_routes, 0);
    assert!(stats.limits_cache.hits >= 990);

    let completed = event_rx
        .try_iter()
        .filter(|e| matches!(e, GateEvent::RequestCompleted { passed: true, .. }))
        .count();
    assert_eq!(completed, 1_000);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failure_cascade_opens_breaker_and_stops_processing() {
    let store = InMemoryStore::shared();
    store.set_available(false);

    let mut config = RiskGateConfig::default();
    config.store.retry_attempts = 1;
    config.balancer.num_workers = 1;
    config.breakers.0.insert(
        COMPREHENSIVE_VALIDATION_BREAKER.to_string(),
        BreakerConfig::new(5, 600_000),
    );
    let manager = manager_on(&store, config, EventEmitter::disabled());
    assert_ok!(manager.start());

    let trade = TradePayload::new(dec!(0.01), dec!(1), dec!(0.001));
    let ids: Vec<_> = (0..12)
        .map(|_| manager.submit("htf", "SPY", trade.clone()).unwrap())
        .collect();
    let statuses = wait_all(&manager, &ids).await;

    let connection_failures = statuses
        .iter()
        .filter(|s| {
            matches!(
                s,
                ValidationStatus::Failed {
                    reason: FailureReason::Connection { .. }
                }
            )
        })
        .count();
    let fail_fast = statuses
        .iter()
        .filter(|s| {
            matches!(
                s,
                ValidationStatus::Failed {
                    reason: FailureReason::CircuitOpen { .. }
                }
            )
        })
        .count();
    assert_eq!(connection_failures, 5);
    assert_eq!(fail_fast, 7);

    let breakers = &manager.context().breakers;
    let comprehensive = breakers.get(COMPREHENSIVE_VALIDATION_BREAKER).unwrap();
    assert_eq!(comprehensive.state(), CircuitState::Open);
    let stats = comprehensive.stats();
    assert_eq!(stats.failed_calls, 5);
    assert_eq!(stats.rejected_calls, 7);

    // the fast tier is isolated from the cascade
    let id = manager.submit("arbitrage", "BTCUSD", trade).unwrap();
    assert!(wait_all(&manager, &[id]).await[0].result().is_some());
    assert_eq!(
        breakers.get(FAST_VALIDATION_BREAKER).unwrap().state(),
        CircuitState::Closed
    );

    manager.shutdown().await;
}

/// Sleeps for the number of milliseconds encoded in the request symbol.
struct SleepyProcessor;

#[async_trait]
impl RequestProcessor for SleepyProcessor {
    async fn process(&self, request: RiskRequest) -> Result<(), FailureReason> {
        let ms = request.symbol.parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn reject(&self, _request: RiskRequest, _reason: FailureReason) {}
}

fn request(strategy: StrategyType, symbol: &str) -> RiskRequest {
    RiskRequest::new(strategy, symbol, TradePayload::default(), Duration::from_secs(60))
}

#[tokio::test(start_paused = true)]
async fn ultra_high_routes_to_lowest_latency_worker() {
    let config = BalancerConfig {
        num_workers: 4,
        max_queue_size: 64,
        routing_strategy: RoutingStrategy::RoundRobin,
        ..BalancerConfig::default()
    };
    let balancer = LoadBalancer::new(&config, Arc::new(SleepyProcessor));
    assert_ok!(balancer.start());

    for symbol in ["40", "30", "5", "20"] {
        assert_ok!(balancer.route_request(request(StrategyType::Htf, symbol)));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = balancer.stats();
    assert!(stats.workers.iter().all(|w| w.processed == 1));
    assert_eq!(stats.total_load, 0);

    for _ in 0..3 {
        let worker = balancer
            .route_request(request(StrategyType::MarketMaking, "1"))
            .unwrap();
        assert_eq!(worker, 2);
    }

    balancer.stop().await;
    assert_err!(balancer.route_request(request(StrategyType::Arbitrage, "1")));
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_no_request_pending() {
    let store = InMemoryStore::shared();
    let manager = manager_on(&store, RiskGateConfig::default(), EventEmitter::disabled());
    assert_ok!(manager.start());

    let trade = TradePayload::new(dec!(0.01), dec!(1), dec!(0.001));
    let ids: Vec<_> = (0..50)
        .map(|i| {
            let strategy = if i % 3 == 0 { "trend_following" } else { "market_making" };
            manager.submit(strategy, "ETHUSD", trade.clone()).unwrap()
        })
        .collect();

    manager.shutdown().await;
    assert_err!(manager.submit("htf", "SPY", trade));

    for id in ids {
        match manager.get_validation_result(id) {
            ValidationStatus::Completed { .. } => {}
            ValidationStatus::Failed {
                reason: FailureReason::Cancelled,
            } => {}
            other => panic!("unexpected status after shutdown: {other:?}"),
        }
    }

    let timing = manager.stats().timing;
    assert!(timing.fast_current_ms >= timing.fast_target_ms * 0.5);
    assert!(timing.fast_current_ms <= timing.fast_target_ms * 2.0);
}

//! Connection Manager for the shared store.
//!
//! Owns one pooled backend session, re-established lazily after a failure.
//! Acquisition retries with exponential backoff and jitter before giving up
//! with [`ConnectionError::RetriesExhausted`].

use parking_lot::Mutex;
use rand::Rng;
use rg_types::{ConnectionError, StoreConfig};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{StoreBackend, StoreConnector};

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    reconnects: AtomicU64,
    failed_connects: AtomicU64,
    acquisitions: AtomicU64,
    in_use: AtomicU64,
}

/// A live store session. Counts as "in use" until dropped.
#[derive(Debug)]
pub struct StoreHandle {
    backend: Arc<dyn StoreBackend>,
    counters: Arc<Counters>,
}

impl Deref for StoreHandle {
    type Target = dyn StoreBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub detail: String,
    pub latency_ms: Option<f64>,
}

impl ConnectionHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == ConnectionStatus::Healthy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connects: u64,
    pub reconnects: u64,
    pub failed_connects: u64,
    pub acquisitions: u64,
    pub in_use: u64,
    pub pooled: bool,
    pub closed: bool,
}

#[derive(Debug)]
pub struct ConnectionManager {
    connector: Arc<dyn StoreConnector>,
    config: StoreConfig,
    pooled: Mutex<Option<Arc<dyn StoreBackend>>>,
    /// Set once a session has existed, so later connects count as reconnects
    connected_before: AtomicBool,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn StoreConnector>, config: StoreConfig) -> Self {
        Self {
            connector,
            config,
            pooled: Mutex::new(None),
            connected_before: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Acquire a live handle, connecting (with retries) if nothing is pooled.
    pub async fn get_connection(&self) -> Result<StoreHandle, ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let pooled = self.pooled.lock().clone();
        let backend = match pooled {
            Some(backend) => backend,
            None => self.connect_with_retry().await?,
        };

        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.counters.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(StoreHandle {
            backend,
            counters: self.counters.clone(),
        })
    }

    /// Run `op` with an acquired handle. The handle is released on every exit
    /// path and a connection error drops the pooled session.
    pub async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(StoreHandle) -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        let handle = self.get_connection().await?;
        let result = op(handle).await;
        if let Err(ref e) = result {
            warn!(error = %e, "Store operation failed, invalidating pooled connection");
            self.invalidate();
        }
        result
    }

    /// Drop the pooled session so the next acquisition reconnects.
    pub fn invalidate(&self) {
        if self.pooled.lock().take().is_some() {
            debug!("Pooled store connection invalidated");
        }
    }

    pub async fn health_check(&self) -> ConnectionHealth {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.health_check_timeout_ms);

        let probe = async {
            let handle = self.get_connection().await?;
            handle.ping().await
        };

        let outcome = match tokio::time::timeout(timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Unreachable {
                message: format!("ping timed out after {} ms", timeout.as_millis()),
            }),
        };

        match outcome {
            Ok(()) => ConnectionHealth {
                status: ConnectionStatus::Healthy,
                detail: "store reachable".to_string(),
                latency_ms: Some(started.elapsed().as_secs_f64() * 1_000.0),
            },
            Err(e) => {
                self.invalidate();
                ConnectionHealth {
                    status: ConnectionStatus::Unhealthy,
                    detail: e.to_string(),
                    latency_ms: None,
                }
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connects: self.counters.connects.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            failed_connects: self.counters.failed_connects.load(Ordering::Relaxed),
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            in_use: self.counters.in_use.load(Ordering::Relaxed),
            pooled: self.pooled.lock().is_some(),
            closed: self.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the pooled session. Later acquisitions fail with
    /// [`ConnectionError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pooled.lock().take();
        info!("Connection manager closed");
    }

    async fn connect_with_retry(&self) -> Result<Arc<dyn StoreBackend>, ConnectionError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(backend) => {
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    if self.connected_before.swap(true, Ordering::SeqCst) {
                        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        info!(attempt, "Reconnected to store");
                    } else {
                        info!(backend = backend.name(), "Connected to store");
                    }
                    *self.pooled.lock() = Some(backend.clone());
                    return Ok(backend);
                }
                Err(e) => {
                    self.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                    warn!(attempt, attempts, error = %e, "Store connect attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(ConnectionError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// `base * 2^(attempt-1)` capped at the max delay, plus up to 50% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        let capped = exp.min(self.config.retry_max_delay_ms);
        let jitter = if capped > 1 {
            rand::rng().random_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sphere_common::GatewayError;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful trial calls in HalfOpen that close the circuit again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open before allowing trial calls.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Concurrent trial calls admitted in HalfOpen.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Deadline for every admitted call; exceeding it counts as a failure.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    3
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_half_open_max_calls() -> u32 {
    2
}
fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

/// Point-in-time view served by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_total: u64,
    pub rejected_total: u64,
    /// Milliseconds until the next trial call is admitted, when Open.
    pub retry_in_ms: Option<u64>,
}

/// Per-service fault-tolerance state machine.
///
/// One instance exists per registry entry and every caller for that service
/// shares it. Calls are admitted or rejected under a single short lock; the
/// wrapped operation itself runs outside it.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    opened_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                last_failure_at: None,
                next_attempt_at: None,
            }),
            opened_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let retry_in_ms = match inner.state {
            CircuitState::Open => inner
                .next_attempt_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_total: self.opened_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            retry_in_ms,
        }
    }

    /// Run `op` through the breaker, bounded by the configured call timeout.
    ///
    /// The operation is spawned on its own task: when the timeout wins the
    /// race, the losing call is abandoned but left running so its eventual
    /// outcome still shows up in logs, and the caller is never blocked on it.
    ///
    /// A call whose caller disappears mid-flight (client disconnect) is
    /// counted as a failure — an abandoned call is indistinguishable from a
    /// slow backend.
    pub async fn execute<T, F>(&self, op: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>> + Send + 'static,
        T: Send + 'static,
    {
        let half_open = self.try_acquire()?;
        let guard = CallGuard {
            breaker: self,
            half_open,
            resolved: false,
        };

        let mut handle = tokio::spawn(op);
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(value)) => {
                    guard.resolve(true);
                    Ok(value)
                }
                Ok(Err(err)) => {
                    guard.resolve(false);
                    Err(err)
                }
                Err(join_err) => {
                    guard.resolve(false);
                    Err(GatewayError::Connection {
                        service: self.name.clone(),
                        message: format!("proxy task failed: {join_err}"),
                    })
                }
            },
            _ = tokio::time::sleep(self.config.call_timeout()) => {
                let name = self.name.clone();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(_)) => {
                            tracing::debug!(service = %name, "call completed after deadline")
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(service = %name, error = %err, "call failed after deadline")
                        }
                        Err(_) => {}
                    }
                });
                guard.resolve(false);
                Err(GatewayError::Timeout {
                    service: self.name.clone(),
                    timeout_ms: self.config.call_timeout_ms,
                })
            }
        }
    }

    /// Admission decision. Returns whether the admitted call is a HalfOpen
    /// trial (its completion must release the trial slot).
    fn try_acquire(&self) -> Result<bool, GatewayError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let due = inner
                    .next_attempt_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if !due {
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    return Err(GatewayError::CircuitOpen {
                        service: self.name.clone(),
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.half_open_in_flight = 1;
                tracing::info!(service = %self.name, "circuit half-open, admitting trial call");
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(true)
                } else {
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    Err(GatewayError::CircuitOpen {
                        service: self.name.clone(),
                    })
                }
            }
        }
    }

    fn on_success(&self, half_open: bool) {
        let mut inner = self.inner.lock();
        if half_open {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 0;
                    inner.next_attempt_at = None;
                    tracing::info!(service = %self.name, "circuit closed");
                }
            }
            // Trial result landed after the circuit re-opened; too late to count.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, half_open: bool) {
        let mut inner = self.inner.lock();
        if half_open {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout());
        self.opened_total.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            service = %self.name,
            reset_timeout_ms = self.config.reset_timeout_ms,
            "circuit opened"
        );
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Ties a call's outcome back to the state machine. Dropped without being
/// resolved (the caller was cancelled mid-call), it records a failure.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    resolved: bool,
}

impl CallGuard<'_> {
    fn resolve(mut self, success: bool) {
        self.resolved = true;
        if success {
            self.breaker.on_success(self.half_open);
        } else {
            self.breaker.on_failure(self.half_open);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_failure(self.half_open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn config(
        failure_threshold: u32,
        success_threshold: u32,
        reset_timeout_ms: u64,
        half_open_max_calls: u32,
        call_timeout_ms: u64,
    ) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout_ms,
            half_open_max_calls,
            call_timeout_ms,
        }
    }

    fn connection_error() -> GatewayError {
        GatewayError::Connection {
            service: "jobs".into(),
            message: "refused".into(),
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("jobs", config(3, 3, 60_000, 2, 5_000));

        for _ in 0..3 {
            let result = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
            assert!(matches!(result, Err(GatewayError::Connection { .. })));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().opened_total, 1);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking_operation() {
        let breaker = CircuitBreaker::new("jobs", config(1, 3, 60_000, 2, 5_000));
        let _ = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let started = Instant::now();
        let result = breaker
            .execute(async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, GatewayError>(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert!(!invoked.load(Ordering::SeqCst));
        // Rejection is immediate, not bounded by the 5s call timeout.
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(breaker.snapshot().rejected_total, 1);
    }

    #[tokio::test]
    async fn reset_timeout_elapse_admits_trial_then_closes() {
        let breaker = CircuitBreaker::new("jobs", config(1, 3, 50, 2, 5_000));
        let _ = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // First call after the reset timeout is actually attempted.
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let result = breaker
            .execute(async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, GatewayError>(())
            })
            .await;
        assert!(result.is_ok());
        assert!(invoked.load(Ordering::SeqCst));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Two more successes reach the success threshold.
        for _ in 0..2 {
            breaker
                .execute(async { Ok::<_, GatewayError>(()) })
                .await
                .unwrap();
        }
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("jobs", config(1, 3, 50, 2, 5_000));
        let _ = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
        assert!(matches!(result, Err(GatewayError::Connection { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().opened_total, 2);
    }

    #[tokio::test]
    async fn half_open_concurrency_is_capped() {
        let breaker = Arc::new(CircuitBreaker::new("jobs", config(1, 3, 50, 1, 5_000)));
        let _ = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Occupy the single trial slot with a slow call.
        let slow = breaker.clone();
        let trial = tokio::spawn(async move {
            slow.execute(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, GatewayError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A second caller is rejected while the trial is in flight.
        let result = breaker.execute(async { Ok::<_, GatewayError>(()) }).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));

        trial.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("jobs", config(1, 3, 60_000, 2, 50));
        let result = breaker
            .execute(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, GatewayError>(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout { timeout_ms: 50, .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn cancelled_call_counts_as_failure() {
        // A caller that disappears mid-call is failure-counted (the
        // alternative — ignoring cancelled calls — would hide a backend that
        // is slow enough to make clients give up).
        let breaker = Arc::new(CircuitBreaker::new("jobs", config(1, 3, 60_000, 2, 5_000)));
        let b = breaker.clone();
        let caller = tokio::spawn(async move {
            b.execute(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, GatewayError>(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_closed_failure_count() {
        let breaker = CircuitBreaker::new("jobs", config(3, 3, 60_000, 2, 5_000));
        for _ in 0..2 {
            let _ = breaker.execute(async { Err::<(), _>(connection_error()) }).await;
        }
        assert_eq!(breaker.snapshot().failure_count, 2);

        breaker
            .execute(async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn config_defaults() {
        let cfg: CircuitBreakerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.success_threshold, 3);
        assert_eq!(cfg.reset_timeout_ms, 30_000);
        assert_eq!(cfg.half_open_max_calls, 2);
        assert_eq!(cfg.call_timeout_ms, 10_000);
    }
}

//! Circuit breaker around ERP calls.
//!
//! Closed → Open after `failure_threshold` consecutive transient failures
//! inside `monitoring_window`. Open fails fast until `reset_timeout` elapses,
//! then HalfOpen admits exactly one trial call: success closes the circuit,
//! a transient failure re-opens it.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use ordersync_purchasing::ErpRecord;

use super::{ConnectionStatus, ErpClient, ErpError, FieldMetadata, SearchDomain, SearchOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Releases a half-open trial slot if the guarded call is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut inner) = self.breaker.inner.lock() {
                inner.trial_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose reset timeout has elapsed reports
    /// `HalfOpen` even before the trial call arrives.
    pub fn state(&self) -> CircuitState {
        let Ok(inner) = self.inner.lock() else {
            return CircuitState::Open;
        };
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.config.reset_timeout => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Run `call` under the breaker.
    pub async fn call<T, F>(&self, call: F) -> Result<T, ErpError>
    where
        F: Future<Output = Result<T, ErpError>>,
    {
        let trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };
        let result = call.await;
        guard.armed = false;
        self.record(&result, trial);
        result
    }

    fn admit(&self) -> Result<bool, ErpError> {
        let mut inner = self.inner.lock().map_err(|_| ErpError::CircuitOpen)?;
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if !elapsed {
                    return Err(ErpError::CircuitOpen);
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!("circuit half-open, admitting trial call");
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(ErpError::CircuitOpen);
                }
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn record<T>(&self, result: &Result<T, ErpError>, trial: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if trial {
            inner.trial_in_flight = false;
        }

        match result {
            Err(err) if err.is_transient() => {
                let now = Instant::now();
                if inner.state == CircuitState::HalfOpen {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(error = %err, "trial call failed, circuit re-opened");
                    return;
                }

                let window = self.config.monitoring_window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                if inner.state == CircuitState::Closed
                    && inner.failures.len() >= self.config.failure_threshold as usize
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        failures = inner.failures.len(),
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            // Any answer from the remote, even a rejection, proves it is reachable.
            _ => {
                if inner.state != CircuitState::Closed {
                    tracing::info!("circuit closed");
                }
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
            }
        }
    }
}

/// ERP client decorator that routes every remote call through a [`CircuitBreaker`].
#[derive(Debug)]
pub struct CircuitBreakerErpClient<C> {
    inner: C,
    breaker: CircuitBreaker,
}

impl<C> CircuitBreakerErpClient<C> {
    pub fn new(inner: C, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ErpClient> ErpClient for CircuitBreakerErpClient<C> {
    async fn create(&self, model: &str, values: ErpRecord) -> Result<i64, ErpError> {
        self.breaker.call(self.inner.create(model, values)).await
    }

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<ErpRecord>, ErpError> {
        self.breaker.call(self.inner.read(model, ids, fields)).await
    }

    async fn write(&self, model: &str, ids: &[i64], values: ErpRecord) -> Result<bool, ErpError> {
        self.breaker.call(self.inner.write(model, ids, values)).await
    }

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, ErpError> {
        self.breaker.call(self.inner.unlink(model, ids)).await
    }

    async fn search(
        &self,
        model: &str,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<i64>, ErpError> {
        self.breaker.call(self.inner.search(model, domain, options)).await
    }

    async fn search_read(
        &self,
        model: &str,
        domain: &SearchDomain,
        fields: Option<&[&str]>,
        options: SearchOptions,
    ) -> Result<Vec<ErpRecord>, ErpError> {
        self.breaker
            .call(self.inner.search_read(model, domain, fields, options))
            .await
    }

    async fn search_count(&self, model: &str, domain: &SearchDomain) -> Result<usize, ErpError> {
        self.breaker.call(self.inner.search_count(model, domain)).await
    }

    async fn fields_get(
        &self,
        model: &str,
        fields: Option<&[&str]>,
    ) -> Result<BTreeMap<String, FieldMetadata>, ErpError> {
        self.breaker.call(self.inner.fields_get(model, fields)).await
    }

    async fn connection_status(&self) -> ConnectionStatus {
        if self.breaker.state() == CircuitState::Open {
            return ConnectionStatus::Error;
        }
        self.inner.connection_status().await
    }

    async fn authenticate(&self) -> Result<(), ErpError> {
        self.breaker.call(self.inner.authenticate()).await
    }

    async fn logout(&self) -> Result<(), ErpError> {
        self.inner.logout().await
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-provider circuit breaker with exponential-backoff retry.
//!
//! CLOSED → OPEN after `failure_threshold` failures; OPEN → HALF_OPEN once
//! `timeout` has elapsed; HALF_OPEN → CLOSED after `success_threshold`
//! consecutive successes, back to OPEN on any failure.  Requests made while
//! OPEN fail fast with [`LlmError::CircuitOpen`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// How long the breaker stays OPEN before probing.
    pub timeout: Duration,
    /// Success/failure history bound for the stats window.
    pub window_size: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            window_size: 100,
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
            jitter_factor: 0.25,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    history: VecDeque<bool>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub window_success_rate: f64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            timeout_secs = config.timeout.as_secs(),
            "circuit breaker initialized"
        );
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                history: VecDeque::new(),
            }),
        }
    }

    /// Run `f` through the breaker with exponential-backoff retry.
    ///
    /// `f` is called once per attempt; only errors classified retryable are
    /// retried, up to `max_retries` (config default when `None`).
    pub async fn call<T, F, Fut>(&self, max_retries: Option<u32>, mut f: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        {
            let mut state = self.state.lock().await;
            if !self.should_allow(&mut state) {
                let retry_after = state
                    .opened_at
                    .map(|t| self.config.timeout.saturating_sub(t.elapsed()))
                    .unwrap_or(self.config.timeout);
                return Err(LlmError::CircuitOpen { retry_after });
            }
        }

        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(result) => {
                    self.record_success().await;
                    return Ok(result);
                }
                Err(err) => {
                    if !err.is_retryable() || attempt >= max_retries {
                        self.record_failure().await;
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "retryable request failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn should_allow(&self, state: &mut BreakerState) -> bool {
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.timeout {
                    info!("circuit breaker entering half-open state");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.failure_count = 0;
        push_history(&mut state.history, true, self.config.window_size);

        if state.state == CircuitState::HalfOpen {
            state.success_count += 1;
            if state.success_count >= self.config.success_threshold {
                info!("circuit breaker recovered to closed state");
                state.state = CircuitState::Closed;
                state.success_count = 0;
            }
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;
        push_history(&mut state.history, false, self.config.window_size);

        match state.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker failed while half-open, reopening");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                warn!(failures = state.failure_count, "circuit breaker opened");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let mut delay = base.min(self.config.max_delay.as_secs_f64());
        if self.config.jitter {
            let range = delay * self.config.jitter_factor;
            let jitter: f64 = rand::thread_rng().gen_range(-range..=range);
            delay += jitter;
        }
        Duration::from_secs_f64(delay.max(0.1))
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        let rate = if state.history.is_empty() {
            1.0
        } else {
            state.history.iter().filter(|ok| **ok).count() as f64 / state.history.len() as f64
        };
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            window_success_rate: rate,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
        state.history.clear();
        info!("circuit breaker reset");
    }
}

fn push_history(history: &mut VecDeque<bool>, ok: bool, bound: usize) {
    history.push_back(ok);
    while history.len() > bound {
        history.pop_front();
    }
}

/// Registry of per-provider breakers.  Process-wide: all clients for one
/// provider share the same breaker.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { breakers: Mutex::new(HashMap::new()), config }
    }

    pub async fn for_provider(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            max_retries: 0,
            ..Default::default()
        }
    }

    fn connection_err() -> LlmError {
        LlmError::Connection { provider: "test".into(), message: "boom".into() }
    }

    #[tokio::test]
    async fn successful_call_passes_through() {
        let cb = CircuitBreaker::new(fast_config());
        let out: Result<u32, _> = cb.call(None, || async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn breaker_opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(Some(0), || async { Err(connection_err()) }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_breaker_fast_fails_with_retry_after() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(Some(0), || async { Err(connection_err()) }).await;
        }
        let err = cb.call(Some(0), || async { Ok(()) }).await.unwrap_err();
        match err {
            LlmError::CircuitOpen { retry_after } => {
                assert!(retry_after <= Duration::from_millis(50));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_breaker_probes_after_timeout_and_recovers() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(Some(0), || async { Err(connection_err()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Two successful probes close the breaker again.
        assert!(cb.call(Some(0), || async { Ok(()) }).await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(cb.call(Some(0), || async { Ok(()) }).await.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(Some(0), || async { Err(connection_err()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _: Result<(), _> = cb.call(Some(0), || async { Err(connection_err()) }).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_up_to_max() {
        let cb = CircuitBreaker::new(fast_config());
        let attempts = AtomicU32::new(0);
        let out: Result<u32, _> = cb
            .call(Some(3), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(connection_err())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let cb = CircuitBreaker::new(fast_config());
        let attempts = AtomicU32::new(0);
        let out: Result<(), _> = cb
            .call(Some(5), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Validation("bad".into())) }
            })
            .await;
        assert!(matches!(out, Err(LlmError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registry_returns_same_breaker_per_provider() {
        let reg = BreakerRegistry::new(fast_config());
        let a = reg.for_provider("openai").await;
        let b = reg.for_provider("openai").await;
        let c = reg.for_provider("ollama").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}

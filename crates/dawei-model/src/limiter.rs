// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Adaptive rate limiter for outbound LLM requests.
//!
//! Tracks request history in a sliding window (or token bucket), scales the
//! admitted rate up after sustained success and down after sustained failure,
//! and halves the rate immediately when a provider signals 429.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    TokenBucket,
    SlidingWindow,
    /// Kept as an alias of the sliding window; a dedicated leaky-bucket
    /// implementation has never been needed in practice.
    LeakyBucket,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Initial admitted rate in requests/second.
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Sliding-window history bound / token-bucket capacity.
    pub burst_capacity: usize,
    pub scale_up_factor: f64,
    pub scale_down_factor: f64,
    /// Consecutive successes required before scaling up.
    pub scale_up_threshold: u32,
    /// Consecutive failures required before scaling down.
    pub scale_down_threshold: u32,
    pub strategy: RateLimitStrategy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_rate: 5.0,
            min_rate: 0.5,
            max_rate: 50.0,
            burst_capacity: 20,
            scale_up_factor: 1.2,
            scale_down_factor: 0.7,
            scale_up_threshold: 10,
            scale_down_threshold: 3,
            strategy: RateLimitStrategy::SlidingWindow,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RateLimiterStats {
    pub current_rate: f64,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rate_limit_errors: u64,
}

#[derive(Debug)]
struct LimiterState {
    current_rate: f64,
    success_count: u32,
    failure_count: u32,
    request_history: VecDeque<Instant>,
    bucket_tokens: f64,
    last_refill: Option<Instant>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rate_limit_errors: u64,
}

pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        info!(
            initial_rate = config.initial_rate,
            strategy = ?config.strategy,
            "rate limiter initialized"
        );
        let state = LimiterState {
            current_rate: config.initial_rate,
            success_count: 0,
            failure_count: 0,
            request_history: VecDeque::with_capacity(config.burst_capacity),
            bucket_tokens: config.burst_capacity as f64,
            last_refill: None,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_rate_limit_errors: 0,
        };
        Self { config, state: Mutex::new(state) }
    }

    /// Acquire `tokens` admission slots.
    ///
    /// Returns `(true, None)` on admission.  With `timeout = None` the call
    /// fails fast, returning `(false, wait_hint)`; otherwise it sleeps and
    /// retries until admitted or the timeout elapses.
    pub async fn acquire(
        &self,
        tokens: usize,
        timeout: Option<Duration>,
    ) -> (bool, Option<Duration>) {
        let start = Instant::now();
        loop {
            let (admitted, wait) = {
                let mut state = self.state.lock().await;
                self.try_acquire(&mut state, tokens)
            };
            if admitted {
                return (true, None);
            }
            let Some(limit) = timeout else {
                return (false, Some(wait));
            };
            let elapsed = start.elapsed();
            if elapsed >= limit {
                warn!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    "rate limiter acquire timed out"
                );
                return (false, Some(wait));
            }
            tokio::time::sleep(wait.min(limit - elapsed)).await;
        }
    }

    fn try_acquire(&self, state: &mut LimiterState, tokens: usize) -> (bool, Duration) {
        let now = Instant::now();
        let result = match self.config.strategy {
            RateLimitStrategy::SlidingWindow | RateLimitStrategy::LeakyBucket => {
                self.sliding_window_acquire(state, now, tokens)
            }
            RateLimitStrategy::TokenBucket => self.token_bucket_acquire(state, now, tokens),
        };
        if result.0 {
            state.total_requests += 1;
        }
        result
    }

    fn sliding_window_acquire(
        &self,
        state: &mut LimiterState,
        now: Instant,
        tokens: usize,
    ) -> (bool, Duration) {
        // Purge entries older than the 1-second window.
        while let Some(oldest) = state.request_history.front() {
            if now.duration_since(*oldest) > Duration::from_secs(1) {
                state.request_history.pop_front();
            } else {
                break;
            }
        }

        let window = state.request_history.len();
        let max_requests = (state.current_rate.floor() as usize).max(1);

        if window + tokens <= max_requests {
            for _ in 0..tokens {
                state.request_history.push_back(now);
                if state.request_history.len() > self.config.burst_capacity {
                    state.request_history.pop_front();
                }
            }
            return (true, Duration::ZERO);
        }

        let wait = if window >= max_requests {
            // Window full — wait for the oldest entry to expire.
            let oldest = state.request_history.front().copied().unwrap_or(now);
            let age = now.duration_since(oldest);
            Duration::from_secs(1)
                .checked_sub(age)
                .unwrap_or(Duration::ZERO)
                .saturating_add(Duration::from_millis(10))
        } else if max_requests - window >= tokens {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(500)
        };
        (false, wait.max(Duration::from_millis(10)))
    }

    fn token_bucket_acquire(
        &self,
        state: &mut LimiterState,
        now: Instant,
        tokens: usize,
    ) -> (bool, Duration) {
        let elapsed = state
            .last_refill
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        state.bucket_tokens = (state.bucket_tokens + elapsed * state.current_rate)
            .clamp(0.0, self.config.burst_capacity as f64);
        state.last_refill = Some(now);

        let need = tokens as f64;
        if state.bucket_tokens >= need {
            state.bucket_tokens -= need;
            return (true, Duration::ZERO);
        }
        let wait = ((need - state.bucket_tokens) / state.current_rate).max(0.01);
        (false, Duration::from_secs_f64(wait))
    }

    /// Record a successful request; after `scale_up_threshold` consecutive
    /// successes the rate grows by `scale_up_factor`.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.success_count += 1;
        state.failure_count = 0;
        state.total_successes += 1;

        if state.success_count >= self.config.scale_up_threshold {
            self.adjust_rate(&mut state, true);
            state.success_count = 0;
        }
    }

    /// Record a failed request.
    ///
    /// A rate-limit failure halves the rate immediately (clamped to
    /// `min_rate`) and deliberately does NOT reset the failure streak so the
    /// problem keeps surfacing; other failures scale down after
    /// `scale_down_threshold` in a row.
    pub async fn record_failure(&self, is_rate_limit: bool) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;
        state.success_count = 0;
        state.total_failures += 1;

        if is_rate_limit {
            state.total_rate_limit_errors += 1;
            state.current_rate = (state.current_rate * 0.5).max(self.config.min_rate);
            warn!(
                current_rate = state.current_rate,
                failure_count = state.failure_count,
                "rate limit hit, halving admitted rate"
            );
        } else if state.failure_count >= self.config.scale_down_threshold {
            self.adjust_rate(&mut state, false);
            state.failure_count = 0;
        }
    }

    fn adjust_rate(&self, state: &mut LimiterState, up: bool) {
        let old = state.current_rate;
        let factor = if up { self.config.scale_up_factor } else { self.config.scale_down_factor };
        state.current_rate =
            (state.current_rate * factor).clamp(self.config.min_rate, self.config.max_rate);
        info!(old_rate = old, new_rate = state.current_rate, up, "rate adjusted");
    }

    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.current_rate
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        RateLimiterStats {
            current_rate: state.current_rate,
            total_requests: state.total_requests,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rate_limit_errors: state.total_rate_limit_errors,
        }
    }

    /// Reset to the initial configuration.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.current_rate = self.config.initial_rate;
        state.success_count = 0;
        state.failure_count = 0;
        state.request_history.clear();
        state.bucket_tokens = self.config.burst_capacity as f64;
        state.last_refill = None;
        info!("rate limiter reset");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimitConfig { initial_rate: rate, ..Default::default() })
    }

    #[tokio::test]
    async fn acquire_within_rate_succeeds_immediately() {
        let l = limiter(5.0);
        let (ok, wait) = l.acquire(1, None).await;
        assert!(ok);
        assert!(wait.is_none());
    }

    #[tokio::test]
    async fn acquire_over_rate_fails_fast_without_timeout() {
        let l = limiter(2.0);
        assert!(l.acquire(1, None).await.0);
        assert!(l.acquire(1, None).await.0);
        let (ok, wait) = l.acquire(1, None).await;
        assert!(!ok, "third request within the same second must be rejected");
        assert!(wait.unwrap() > Duration::ZERO);
    }

    #[tokio::test]
    async fn rate_limit_failure_halves_rate_clamped_to_min() {
        let l = limiter(5.0);
        l.record_failure(true).await;
        assert!((l.current_rate().await - 2.5).abs() < f64::EPSILON);
        for _ in 0..10 {
            l.record_failure(true).await;
        }
        assert!((l.current_rate().await - 0.5).abs() < f64::EPSILON, "clamped to min_rate");
    }

    #[tokio::test]
    async fn sustained_success_scales_up() {
        let l = limiter(5.0);
        for _ in 0..10 {
            l.record_success().await;
        }
        assert!((l.current_rate().await - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn success_streak_resets_after_scale_up() {
        let l = limiter(5.0);
        for _ in 0..10 {
            l.record_success().await;
        }
        // A further 9 successes must not trigger another adjustment.
        for _ in 0..9 {
            l.record_success().await;
        }
        assert!((l.current_rate().await - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn consecutive_failures_scale_down() {
        let l = limiter(10.0);
        for _ in 0..3 {
            l.record_failure(false).await;
        }
        assert!((l.current_rate().await - 7.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let l = limiter(10.0);
        l.record_failure(false).await;
        l.record_failure(false).await;
        l.record_success().await;
        l.record_failure(false).await;
        l.record_failure(false).await;
        assert!((l.current_rate().await - 10.0).abs() < 1e-9, "streak was interrupted");
    }

    #[tokio::test]
    async fn scale_up_never_exceeds_max_rate() {
        let l = AdaptiveRateLimiter::new(RateLimitConfig {
            initial_rate: 45.0,
            ..Default::default()
        });
        for _ in 0..30 {
            l.record_success().await;
        }
        assert!(l.current_rate().await <= 50.0);
    }

    #[tokio::test]
    async fn token_bucket_permits_bursts_up_to_capacity() {
        let l = AdaptiveRateLimiter::new(RateLimitConfig {
            initial_rate: 1.0,
            burst_capacity: 5,
            strategy: RateLimitStrategy::TokenBucket,
            ..Default::default()
        });
        for _ in 0..5 {
            assert!(l.acquire(1, None).await.0);
        }
        let (ok, wait) = l.acquire(1, None).await;
        assert!(!ok);
        assert!(wait.unwrap() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_with_timeout_eventually_succeeds() {
        let l = limiter(2.0);
        assert!(l.acquire(1, None).await.0);
        assert!(l.acquire(1, None).await.0);
        // Window is full; with a generous timeout the third acquire should
        // succeed once the oldest entry expires.
        let (ok, _) = l.acquire(1, Some(Duration::from_secs(3))).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn reset_restores_initial_rate() {
        let l = limiter(5.0);
        l.record_failure(true).await;
        l.reset().await;
        assert!((l.current_rate().await - 5.0).abs() < f64::EPSILON);
    }
}

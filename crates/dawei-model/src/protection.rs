// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The shared protection stack in front of every LLM request: adaptive rate
//! limiter, bounded priority queue, per-provider circuit breakers and an
//! active-request gauge.
//!
//! Clients take the stack as an explicit constructor dependency.  A lazily
//! initialized process-global instance exists for call sites that have no
//! natural place to thread one through; the global is an optimization, not a
//! requirement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::breaker::BreakerRegistry;
use crate::{
    AdaptiveRateLimiter, CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, RequestQueue,
    RequestQueueConfig,
};

pub struct ProtectionStack {
    limiter: AdaptiveRateLimiter,
    queue: RequestQueue,
    breakers: BreakerRegistry,
    active_requests: AtomicU64,
}

static GLOBAL_STACK: OnceLock<Arc<ProtectionStack>> = OnceLock::new();

impl ProtectionStack {
    pub fn new(
        limiter: RateLimitConfig,
        queue: RequestQueueConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let queue = RequestQueue::new(queue);
        queue.start();
        Self {
            limiter: AdaptiveRateLimiter::new(limiter),
            queue,
            breakers: BreakerRegistry::new(breaker),
            active_requests: AtomicU64::new(0),
        }
    }

    /// The process-global stack, created with default configuration on first
    /// use.  Later callers observe the same instance.
    pub fn global() -> Arc<ProtectionStack> {
        GLOBAL_STACK
            .get_or_init(|| {
                Arc::new(ProtectionStack::new(
                    RateLimitConfig::default(),
                    RequestQueueConfig::default(),
                    CircuitBreakerConfig::default(),
                ))
            })
            .clone()
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub async fn breaker_for(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers.for_provider(provider).await
    }

    /// RAII gauge of in-flight provider requests.
    pub fn track_request(self: &Arc<Self>) -> ActiveRequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        ActiveRequestGuard { stack: Arc::clone(self) }
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }
}

pub struct ActiveRequestGuard {
    stack: Arc<ProtectionStack>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.stack.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_request_gauge_tracks_guards() {
        let stack = Arc::new(ProtectionStack::new(
            RateLimitConfig::default(),
            RequestQueueConfig::default(),
            CircuitBreakerConfig::default(),
        ));
        assert_eq!(stack.active_requests(), 0);
        let g1 = stack.track_request();
        let g2 = stack.track_request();
        assert_eq!(stack.active_requests(), 2);
        drop(g1);
        assert_eq!(stack.active_requests(), 1);
        drop(g2);
        assert_eq!(stack.active_requests(), 0);
    }

    #[tokio::test]
    async fn global_returns_same_instance() {
        let a = ProtectionStack::global();
        let b = ProtectionStack::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn breakers_are_shared_per_provider() {
        let stack = ProtectionStack::new(
            RateLimitConfig::default(),
            RequestQueueConfig::default(),
            CircuitBreakerConfig::default(),
        );
        let a = stack.breaker_for("deepseek").await;
        let b = stack.breaker_for("deepseek").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Monotonic monitoring counters.
//!
//! Minimal by intent: named `u64` counters with optional tags folded into
//! the name, readable as a snapshot for diagnostics endpoints and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static COUNTERS: OnceLock<Mutex<HashMap<String, AtomicU64>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, AtomicU64>> {
    COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn counter_key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    tags.sort();
    format!("{name}{{{}}}", tags.join(","))
}

/// Increment a named counter by one.
pub fn increment_counter(name: &str, tags: &[(&str, &str)]) {
    let key = counter_key(name, tags);
    let map = registry().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(counter) = map.get(&key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    drop(map);
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
}

/// Read a counter value (0 when it has never been incremented).
pub fn counter_value(name: &str, tags: &[(&str, &str)]) -> u64 {
    let key = counter_key(name, tags);
    let map = registry().lock().unwrap_or_else(|e| e.into_inner());
    map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
}

/// Snapshot of every counter, sorted by name.
pub fn snapshot() -> Vec<(String, u64)> {
    let map = registry().lock().unwrap_or_else(|e| e.into_inner());
    let mut out: Vec<(String, u64)> =
        map.iter().map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed))).collect();
    out.sort();
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_read() {
        increment_counter("test.metric.a", &[]);
        increment_counter("test.metric.a", &[]);
        assert!(counter_value("test.metric.a", &[]) >= 2);
    }

    #[test]
    fn tags_are_order_insensitive() {
        increment_counter("test.metric.b", &[("provider", "x"), ("status", "ok")]);
        assert_eq!(
            counter_value("test.metric.b", &[("status", "ok"), ("provider", "x")]),
            counter_value("test.metric.b", &[("provider", "x"), ("status", "ok")]),
        );
    }

    #[test]
    fn unknown_counter_reads_zero() {
        assert_eq!(counter_value("test.metric.never", &[]), 0);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-trigger sliding-window rate limiter.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Sliding one-minute window of admitted invocations, keyed by trigger id.
///
/// State is in memory only; a restart forgets the window.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an invocation at `now` unless `max_per_minute` were already
    /// admitted in the trailing minute. Rejected attempts do not count.
    pub async fn try_acquire(&self, key: &str, max_per_minute: i64, now: DateTime<Utc>) -> bool {
        let window_start = now - Duration::minutes(1);
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();

        while window.front().is_some_and(|t| *t <= window_start) {
            window.pop_front();
        }

        if (window.len() as i64) >= max_per_minute {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop the window of a deleted or edited trigger.
    pub async fn forget(&self, key: &str) {
        self.windows.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_within_window() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Utc::now();

        for i in 0..3 {
            assert!(limiter.try_acquire("hook", 3, t0 + Duration::seconds(i)).await);
        }
        assert!(!limiter.try_acquire("hook", 3, t0 + Duration::seconds(10)).await);
        // Other keys have their own window.
        assert!(limiter.try_acquire("other", 3, t0 + Duration::seconds(10)).await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Utc::now();

        assert!(limiter.try_acquire("hook", 2, t0).await);
        assert!(limiter.try_acquire("hook", 2, t0 + Duration::seconds(30)).await);
        assert!(!limiter.try_acquire("hook", 2, t0 + Duration::seconds(59)).await);
        // First admission leaves the window after a full minute.
        assert!(limiter.try_acquire("hook", 2, t0 + Duration::seconds(60)).await);
        assert!(!limiter.try_acquire("hook", 2, t0 + Duration::seconds(61)).await);
    }

    #[tokio::test]
    async fn test_forget_resets() {
        let limiter = SlidingWindowLimiter::new();
        let t0 = Utc::now();
        assert!(limiter.try_acquire("hook", 1, t0).await);
        assert!(!limiter.try_acquire("hook", 1, t0).await);
        limiter.forget("hook").await;
        assert!(limiter.try_acquire("hook", 1, t0).await);
    }
}

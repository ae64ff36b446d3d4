//! Fixed-window rate limiter.
//!
//! One window per key.  Keys are remote addresses before login and user ids
//! after; the caller picks the key per request, so the switchover happens at
//! the next admitted request.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

struct Window {
    started_at: i64,
    count: u32,
}

pub struct RateLimiter {
    max_requests: u32,
    window_ms: i64,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        RateLimiter {
            max_requests,
            window_ms: i64::try_from(window_ms).unwrap_or(i64::MAX).max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one token for `key`.  `Err(retry_after_ms)` when exhausted.
    pub fn consume(&self, key: &str, now_ms: i64) -> Result<(), u64> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(key.to_owned()).or_insert(Window {
            started_at: now_ms,
            count: 0,
        });
        if now_ms - window.started_at >= self.window_ms {
            window.started_at = now_ms;
            window.count = 0;
        }
        if window.count >= self.max_requests {
            let retry_after = (window.started_at + self.window_ms - now_ms).max(0);
            return Err(u64::try_from(retry_after).unwrap_or(0));
        }
        window.count += 1;
        Ok(())
    }

    /// Drop windows that have fully elapsed.  Called opportunistically; the
    /// limiter is correct without it.
    pub fn prune(&self, now_ms: i64) {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, w| now_ms - w.started_at < self.window_ms);
    }
}

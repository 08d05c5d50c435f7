use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct RateLimitConfig {
    /// maximum requests per window
    pub max_requests_per_window: u32,
    /// window duration
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 300,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// request is allowed
    Allowed { remaining: u32 },
    /// client has exceeded the limit for the current window
    RateLimited { retry_after: u64 },
}

pub type DynRateLimitService = Arc<dyn RateLimitServiceTrait + Send + Sync>;

pub trait RateLimitServiceTrait {
    /// count a request against the client and say whether it may go through
    fn check_rate_limit(&self, client_id: &str) -> RateLimitResult;

    /// forget windows that have already closed, returns how many were dropped
    fn sweep(&self) -> usize;
}

struct Window {
    started_at: Instant,
    count: u32,
}

/// fixed window counter per client identifier, in memory only since there's a single process
pub struct InMemoryRateLimitService {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryRateLimitService {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimitServiceTrait for InMemoryRateLimitService {
    fn check_rate_limit(&self, client_id: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows();

        let window = windows.entry(client_id.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        let elapsed = now.duration_since(window.started_at);
        if elapsed >= self.config.window {
            window.started_at = now;
            window.count = 0;
        }

        window.count += 1;

        if window.count > self.config.max_requests_per_window {
            let remaining_window = self
                .config
                .window
                .saturating_sub(now.duration_since(window.started_at));
            debug!(
                "Client {} rate limited: {} requests in window",
                client_id, window.count
            );
            RateLimitResult::RateLimited {
                retry_after: remaining_window.as_secs().max(1),
            }
        } else {
            RateLimitResult::Allowed {
                remaining: self.config.max_requests_per_window - window.count,
            }
        }
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows();
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started_at) < self.config.window);
        before - windows.len()
    }
}

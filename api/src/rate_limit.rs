use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::AuthError;
use crate::metrics::LOGIN_RATE_LIMITED_TOTAL;

pub const DEFAULT_MAX_ATTEMPTS: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_TRACKED: usize = 10_000;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Records an attempt for `identity`, or rejects it once the window is full.
    /// Rejected attempts are not recorded.
    async fn check_and_record(&self, identity: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_attempts: usize,
    pub window: Duration,
    /// Identity count above which idle identities are swept.
    pub max_tracked: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window: DEFAULT_WINDOW,
            max_tracked: DEFAULT_MAX_TRACKED,
        }
    }
}

/// Sliding window of attempt instants per client identity.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    attempts: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Number of identities currently holding attempt history.
    pub async fn tracked_identities(&self) -> usize {
        self.attempts.lock().await.len()
    }
}

fn prune(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = history.front() {
        if now.duration_since(*oldest) < window {
            break;
        }
        history.pop_front();
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_record(&self, identity: &str) -> Result<(), AuthError> {
        let now = Instant::now();
        let window = self.config.window;

        // One lock covers prune, count and record so concurrent attempts
        // from the same identity cannot both slip under the limit.
        let mut attempts = self.attempts.lock().await;

        if attempts.len() > self.config.max_tracked {
            let before = attempts.len();
            attempts.retain(|_, history| {
                prune(history, now, window);
                !history.is_empty()
            });
            debug!(
                "Swept {} idle rate limit identities",
                before - attempts.len()
            );
        }

        let history = attempts.entry(identity.to_string()).or_default();
        prune(history, now, window);

        if history.len() >= self.config.max_attempts {
            warn!("Login rate limit exceeded for {}", identity);
            LOGIN_RATE_LIMITED_TOTAL.inc();
            return Err(AuthError::TooManyAttempts);
        }

        history.push_back(now);
        Ok(())
    }
}

// In-memory rate limiter for the tutoring help endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Different rate limit types with their constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitType {
    /// Help requests per signed-in learner per hour.
    AiHelp,
    /// Help requests without a learner, per client address.
    AnonymousAiHelp,
}

impl RateLimitType {
    /// Maximum number of events allowed in the window.
    pub fn max_count(&self) -> usize {
        match self {
            RateLimitType::AiHelp => 30,
            RateLimitType::AnonymousAiHelp => 200,
        }
    }

    /// Time window for the rate limit.
    pub fn window(&self) -> Duration {
        match self {
            RateLimitType::AiHelp => Duration::from_secs(3600),
            RateLimitType::AnonymousAiHelp => Duration::from_secs(3600),
        }
    }
}

impl std::fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitType::AiHelp => write!(f, "help requests per hour"),
            RateLimitType::AnonymousAiHelp => write!(f, "help requests per hour from one address"),
        }
    }
}

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub limit_type: RateLimitType,
    pub max: usize,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rate limit exceeded: max {} {}",
            self.max, self.limit_type
        )
    }
}

/// Key for the rate limit map: (caller key, limit_type).
type LimitKey = (String, RateLimitType);

/// Thread-safe in-memory rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<LimitKey, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check if the caller is within the rate limit for the given type.
    /// If within limits, records the event and returns Ok(()).
    /// If exceeded, returns Err(RateLimitError).
    /// In local mode, rate limiting is always bypassed.
    pub fn check_limit(&self, key: &str, limit_type: RateLimitType) -> Result<(), RateLimitError> {
        if crate::config::is_local_mode() {
            return Ok(());
        }
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let window = limit_type.window();
        let max = limit_type.max_count();
        let now = Instant::now();

        let entries = map.entry((key.to_string(), limit_type)).or_default();

        // Remove expired entries
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            return Err(RateLimitError { limit_type, max });
        }

        entries.push(now);
        Ok(())
    }

    /// Get the current count for a caller and limit type (for testing/diagnostics).
    pub fn current_count(&self, key: &str, limit_type: RateLimitType) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let window = limit_type.window();
        let now = Instant::now();

        if let Some(entries) = map.get_mut(&(key.to_string(), limit_type)) {
            entries.retain(|t| now.duration_since(*t) < window);
            entries.len()
        } else {
            0
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

//! Bounded retry helpers: exponential backoff for session reconnects and a
//! fixed-step time budget for opening forwarding channels.

use std::time::{Duration, Instant};

/// Sleep between two channel-open attempts.
pub const CHANNEL_OPEN_STEP: Duration = Duration::from_millis(100);

/// Configuration for reconnection behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Maximum number of reconnect attempts
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

/// Exponential backoff iterator for reconnection attempts
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given config
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;

        let next =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(delay)
    }

    /// Get the current attempt number (1-based after first call to next_delay)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

/// Fixed-step retry bounded by total elapsed time.
///
/// Used while a forwarding channel is still being negotiated: each failed
/// attempt sleeps one `step`, until the attempts have taken `budget` in
/// total.
pub struct RetryBudget {
    started: Instant,
    budget: Duration,
    step: Duration,
    retries: u32,
}

impl RetryBudget {
    pub fn new(budget: Duration, step: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            step,
            retries: 0,
        }
    }

    /// Sleep one step and return true, or return false once the budget is
    /// spent.
    pub fn wait_next(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        std::thread::sleep(self.step);
        self.retries += 1;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

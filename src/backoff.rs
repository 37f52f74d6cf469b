// ABOUTME: Exponential backoff with jitter for gateway reconnection.
// ABOUTME: Retries with 2s, 4s, 8s... up to a max delay, bounded by a finite retry budget.

use rand::Rng;
use std::time::Duration;

/// Backoff configuration for gateway reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Starting delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failure
    pub multiplier: u32,
    /// Maximum number of consecutive failures before giving up (0 = unlimited)
    pub max_retries: u32,
    /// Jitter fraction in [0, 1]; each delay is scaled by a random factor
    /// in [1 - jitter, 1 + jitter] to avoid reconnect stampedes
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
            max_retries: 10,
            jitter: 0.25,
        }
    }
}

/// Tracks reconnection state with exponential backoff
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    /// Create a new backoff state with the given config
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            consecutive_failures: 0,
            current_delay,
        }
    }

    /// Record a successful connection (resets backoff)
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Record a failure and return the jittered delay before the next retry,
    /// or None if the retry budget is exhausted
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive_failures += 1;

        if self.config.max_retries > 0 && self.consecutive_failures > self.config.max_retries {
            return None;
        }

        let delay = self.current_delay;

        self.current_delay = std::cmp::min(
            self.current_delay * self.config.multiplier,
            self.config.max_delay,
        );

        Some(apply_jitter(delay, self.config.jitter))
    }

    /// Get the number of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Get the unjittered delay that would be used on the next failure
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

/// Scale a delay by a random factor in [1 - jitter, 1 + jitter]
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + jitter * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    delay.mul_f64(factor.max(0.0))
}

// =============================================================================
// Tests
// =============================================================================

//! Retry policy: backoff delays and per-class eligibility for transient
//! failures.
//!
//! The controller is a pure function of the attempt index and the declared
//! policy: [`RetryPolicy::delay`] computes how long to wait before a retry
//! and [`RetryPolicy::eligible`] decides whether an error class may be
//! retried at all. Whether a retry actually happens additionally depends on
//! the request method being idempotent, which the orchestrator enforces.

use std::time::Duration;

use rand::Rng;

/// Default maximum attempts, including the first try.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default exponential base (seconds): delays of 1s, 2s, 4s, ...
const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;

/// Coarse classification of an execution error, used for retry
/// eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity, DNS, or TLS failure.
    Network,
    /// The exchange timed out.
    Timeout,
    /// The server answered with a retryable status (5xx or other
    /// non-2xx/non-4xx).
    Server,
    /// A terminal outcome that must never trigger an automatic retry:
    /// construction failures, 4xx responses, decode failures, file and
    /// integrity errors, middleware rejections, cache misses.
    Terminal,
}

/// Backoff strategy between retry attempts.
///
/// The attempt index passed to [`Backoff::delay`] is 0-indexed from the
/// first retry, not the first try: the wait before retry N uses
/// `attempt = N - 1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Fixed delay, ignoring the attempt index.
    Constant(Duration),

    /// `base ^ attempt` seconds.
    Exponential {
        /// The base of the exponential, in seconds.
        base: f64,
    },

    /// Uniform draw from the closed interval `[min, max]`, independent per
    /// call.
    Random {
        /// Lower bound (inclusive).
        min: Duration,
        /// Upper bound (inclusive).
        max: Duration,
    },
}

impl Backoff {
    /// Computes the delay before a retry.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(delay) => *delay,
            Self::Exponential { base } => {
                let secs = base.powi(attempt as i32);
                if secs.is_finite() && secs >= 0.0 {
                    Duration::from_secs_f64(secs)
                } else {
                    Duration::ZERO
                }
            }
            Self::Random { min, max } => {
                let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
                let millis =
                    rand::thread_rng().gen_range(lo.as_millis() as u64..=hi.as_millis() as u64);
                Duration::from_millis(millis)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: DEFAULT_EXPONENTIAL_BASE,
        }
    }
}

/// Declared retry behavior for one request.
///
/// `max_attempts` includes the first try and is floored at 1. The
/// per-class flags decide which error classes the policy accepts;
/// [`ErrorClass::Terminal`] is never eligible regardless of flags.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retry_network: bool,
    retry_timeout: bool,
    retry_server: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            retry_network: true,
            retry_timeout: true,
            retry_server: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and backoff; all
    /// retryable classes are accepted.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            ..Self::default()
        }
    }

    /// Creates a policy with a custom attempt budget and the default
    /// backoff.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }

    /// Enables or disables retries for network failures.
    #[must_use]
    pub fn retry_on_network(mut self, enabled: bool) -> Self {
        self.retry_network = enabled;
        self
    }

    /// Enables or disables retries for timeouts.
    #[must_use]
    pub fn retry_on_timeout(mut self, enabled: bool) -> Self {
        self.retry_timeout = enabled;
        self
    }

    /// Enables or disables retries for server (5xx) failures.
    #[must_use]
    pub fn retry_on_server(mut self, enabled: bool) -> Self {
        self.retry_server = enabled;
        self
    }

    /// Returns the attempt budget, including the first try.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the configured backoff strategy.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Whether this policy accepts the given error class for retry.
    #[must_use]
    pub fn eligible(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Network => self.retry_network,
            ErrorClass::Timeout => self.retry_timeout,
            ErrorClass::Server => self.retry_server,
            ErrorClass::Terminal => false,
        }
    }

    /// Delay before the retry with the given 0-indexed retry index.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

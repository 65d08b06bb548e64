//! Retry policy configuration based on gRFC A6.

use std::time::Duration;

use crate::error::{Error, Result};

/// Retry policy for reconnecting to the discovery server.
///
/// Reconnection uses exponential backoff with jitter. There is no attempt
/// limit: the control plane being unreachable is treated as transient and
/// only cancellation ends a recovery episode.
///
/// # Example
///
/// ```
/// use xds_agent::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_initial_backoff(Duration::from_secs(1)).unwrap()
///     .with_max_backoff(Duration::from_secs(30)).unwrap()
///     .with_backoff_multiplier(2.0).unwrap()
///     .with_jitter(0.1).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial backoff duration for the first retry attempt.
    ///
    /// Default: 1 second.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    ///
    /// The backoff will not grow beyond this value, regardless of how many
    /// retry attempts have been made.
    ///
    /// Default: 30 seconds.
    pub max_backoff: Duration,

    /// Multiplier for exponential backoff.
    ///
    /// Default: 2.0.
    pub backoff_multiplier: f64,

    /// Fraction of the computed backoff that is randomized, in `[0.0, 1.0)`.
    ///
    /// A value of `0.2` spreads each delay over `±20%` of its base value.
    ///
    /// Default: 0.2.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Create a new retry policy with custom parameters and default jitter.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `backoff_multiplier` is less than 1.0
    /// - `max_backoff` is less than `initial_backoff`
    /// - `initial_backoff` is zero
    ///
    /// # Example
    ///
    /// ```
    /// use xds_agent::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(
    ///     Duration::from_millis(500),  // initial_backoff
    ///     Duration::from_secs(60),     // max_backoff
    ///     1.6,                         // backoff_multiplier
    /// )?;
    /// # Ok::<(), xds_agent::Error>(())
    /// ```
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        if initial_backoff.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }

        if backoff_multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {backoff_multiplier}"
            )));
        }

        if max_backoff < initial_backoff {
            return Err(Error::Validation(format!(
                "max_backoff ({max_backoff:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }

        Ok(Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            ..Self::default()
        })
    }

    /// Set the initial backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is zero or greater than `max_backoff`.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if duration > self.max_backoff {
            let max_backoff = self.max_backoff;
            return Err(Error::Validation(format!(
                "initial_backoff ({duration:?}) must be <= max_backoff ({max_backoff:?})"
            )));
        }
        self.initial_backoff = duration;
        Ok(self)
    }

    /// Set the maximum backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is less than `initial_backoff`.
    pub fn with_max_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration < self.initial_backoff {
            let initial_backoff = self.initial_backoff;
            return Err(Error::Validation(format!(
                "max_backoff ({duration:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }
        self.max_backoff = duration;
        Ok(self)
    }

    /// Set the backoff multiplier.
    ///
    /// # Errors
    ///
    /// Returns an error if `multiplier` is less than 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Result<Self> {
        if multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        self.backoff_multiplier = multiplier;
        Ok(self)
    }

    /// Set the jitter fraction.
    ///
    /// # Errors
    ///
    /// Returns an error if `jitter` is outside `[0.0, 1.0)`.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&jitter) {
            return Err(Error::Validation(format!(
                "jitter must be in [0.0, 1.0), got {jitter}"
            )));
        }
        self.jitter = jitter;
        Ok(self)
    }

    /// Calculate the un-jittered backoff duration for a given attempt number.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The retry attempt number (0-indexed).
    ///
    /// # Example
    ///
    /// ```
    /// use xds_agent::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff_duration(0), Duration::from_secs(1));
    /// assert_eq!(policy.backoff_duration(1), Duration::from_secs(2));
    /// assert_eq!(policy.backoff_duration(2), Duration::from_secs(4));
    /// assert_eq!(policy.backoff_duration(20), Duration::from_secs(30));
    /// ```
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        // Past this exponent every multiplier >= 2 has long since hit the cap.
        let exponent = attempt.min(64) as i32;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_backoff.as_secs_f64();
        let backoff_secs = (self.initial_backoff.as_secs_f64() * multiplier).min(max_secs);

        Duration::from_secs_f64(backoff_secs)
    }
}

impl Default for RetryPolicy {
    /// Create a retry policy with default values.
    ///
    /// Defaults:
    /// - `initial_backoff`: 1 second
    /// - `max_backoff`: 30 seconds
    /// - `backoff_multiplier`: 2.0
    /// - `jitter`: 0.2
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Stateful backoff calculator based on a [`RetryPolicy`].
///
/// Tracks the attempt number of one recovery episode. Delays handed out by
/// a single `Backoff` never decrease until [`reset`](Self::reset) is called,
/// even with jitter applied.
///
/// # Example
///
/// ```
/// use xds_agent::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default().with_jitter(0.0).unwrap();
/// let mut backoff = Backoff::new(policy);
///
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
/// assert_eq!(backoff.attempt(), 2);
///
/// backoff.reset();
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
    last: Duration,
}

impl Backoff {
    /// Create a new backoff calculator from a retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Number of backoff delays handed out since the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get the next backoff duration and advance the attempt counter.
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.policy.backoff_duration(self.attempt);
        let jittered = if self.policy.jitter > 0.0 {
            let spread = self.policy.jitter * (2.0 * fastrand::f64() - 1.0);
            // `jitter` is a public field, so it may be >= 1.0 here.
            base.mul_f64((1.0 + spread).max(0.0))
        } else {
            base
        };

        let delay = jittered.min(self.policy.max_backoff).max(self.last);
        self.last = delay;
        self.attempt += 1;
        delay
    }

    /// Reset after a successful operation.
    ///
    /// The next failure will use the initial backoff duration again.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}

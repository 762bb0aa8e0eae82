use crate::error::Error;
use core::time::Duration;

/// Runtime limits of a [`Dispatcher`](crate::Dispatcher).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Deadline applied to calls opened without a timeout. `None` leaves such
    /// calls unbounded.
    pub default_timeout: Option<Duration>,

    /// Calls admitted concurrently. Further calls are refused with a
    /// `Cancelled` status until an in-flight call finishes.
    pub max_inflight_calls: usize,

    /// How long [`Dispatcher::shutdown`](crate::Dispatcher::shutdown) lets
    /// in-flight calls finish before cancelling them, and again how long it
    /// waits for the cancelled calls to settle.
    pub shutdown_timeout: Duration,
}

impl DispatcherConfig {
    pub const DEFAULT_MAX_INFLIGHT_CALLS: usize = 10_000;
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_max_inflight_calls(mut self, max: usize) -> Self {
        self.max_inflight_calls = max;
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// # Errors
    ///
    /// [`Error::Config`] if no call could ever be admitted or a zero default
    /// timeout would expire every call immediately.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_inflight_calls == 0 {
            return Err(Error::Config {
                reason: "max_inflight_calls must be greater than 0".to_string(),
            });
        }
        if self.default_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config {
                reason: "default_timeout must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            max_inflight_calls: Self::DEFAULT_MAX_INFLIGHT_CALLS,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

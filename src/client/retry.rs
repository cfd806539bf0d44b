//! Retry policy: an attempt budget, an interval function, a condition,
//! and hooks invoked before each retry.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::error::Error;

/// What the condition and hooks get to look at after a failed attempt.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Zero-based index of the attempt that just finished.
    pub attempt: u32,
    pub error: Option<&'a Error>,
    pub status: Option<StatusCode>,
}

/// Time to wait between attempts.
#[derive(Clone)]
pub enum RetryInterval {
    Fixed(Duration),
    /// Capped exponential backoff with jitter.
    Backoff { min: Duration, max: Duration },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for RetryInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Backoff { min, max } => f
                .debug_struct("Backoff")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl RetryInterval {
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(duration) => *duration,
            Self::Backoff { min, max } => {
                let base = min.saturating_mul(2u32.saturating_pow(attempt)).min(*max);
                // full jitter keeps herds apart
                let jitter_space = base.as_millis().max(1) as u64;
                let jitter = rand::random_range(0..jitter_space);
                (base / 2 + Duration::from_millis(jitter / 2)).min(*max)
            }
            Self::Custom(f) => f(attempt),
        }
    }
}

type Condition = Arc<dyn Fn(&RetryContext<'_>) -> bool + Send + Sync>;
type Hook = Arc<dyn Fn(&RetryContext<'_>) + Send + Sync>;

/// The retry policy attached to a client or a single request.
#[derive(Clone)]
pub struct RetryPolicy {
    count: u32,
    interval: RetryInterval,
    condition: Option<Condition>,
    hooks: Vec<Hook>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("count", &self.count)
            .field("interval", &self.interval)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl RetryPolicy {
    /// Up to `count` retries at a fixed interval.
    #[must_use]
    pub fn fixed(count: u32, interval: Duration) -> Self {
        Self {
            count,
            interval: RetryInterval::Fixed(interval),
            condition: None,
            hooks: Vec::new(),
        }
    }

    /// Up to `count` retries with capped exponential backoff.
    #[must_use]
    pub fn backoff(count: u32, min: Duration, max: Duration) -> Self {
        Self {
            count,
            interval: RetryInterval::Backoff { min, max },
            condition: None,
            hooks: Vec::new(),
        }
    }

    /// Replaces the interval function.
    #[must_use]
    pub fn with_interval<F>(mut self, interval: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.interval = RetryInterval::Custom(Arc::new(interval));
        self
    }

    /// Replaces the retry condition. The default retries transport
    /// errors only.
    #[must_use]
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Adds a hook invoked just before each retry sleep.
    #[must_use]
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryContext<'_>) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        self.interval.delay(attempt)
    }

    pub(crate) fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        match &self.condition {
            Some(condition) => condition(ctx),
            // default: transport errors only
            None => ctx.error.is_some_and(Error::is_retryable),
        }
    }

    pub(crate) fn run_hooks(&self, ctx: &RetryContext<'_>) {
        for hook in &self.hooks {
            hook(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_is_constant() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(5), Duration::from_millis(10));
        assert_eq!(policy.count(), 2);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::backoff(8, Duration::from_millis(100), Duration::from_secs(2));
        for attempt in 0..16 {
            assert!(policy.delay(attempt) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn default_condition_retries_transport_errors_only() {
        let policy = RetryPolicy::fixed(1, Duration::ZERO);

        let dial_err = Error::new_dial(crate::error::DialPhase::Connect, "refused");
        assert!(policy.should_retry(&RetryContext {
            attempt: 0,
            error: Some(&dial_err),
            status: None,
        }));

        assert!(!policy.should_retry(&RetryContext {
            attempt: 0,
            error: None,
            status: Some(StatusCode::INTERNAL_SERVER_ERROR),
        }));
    }

    #[test]
    fn custom_condition_can_retry_on_status() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO)
            .with_condition(|ctx| ctx.status == Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(policy.should_retry(&RetryContext {
            attempt: 0,
            error: None,
            status: Some(StatusCode::SERVICE_UNAVAILABLE),
        }));
    }
}

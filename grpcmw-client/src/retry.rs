//! Retry with exponential backoff for client calls.
//!
//! Backoff follows the [gRPC connection backoff specification][backoff]:
//! delays start at `base_delay`, grow by `multiplier`, are capped at
//! `max_delay`, and carry symmetric jitter.
//!
//! # Retryable Errors
//!
//! Only codes that are safe to retry are retried:
//! - [`Code::Unavailable`](grpcmw_core::Code::Unavailable) - service temporarily unavailable
//! - [`Code::ResourceExhausted`](grpcmw_core::Code::ResourceExhausted) - rate limited
//! - [`Code::Aborted`](grpcmw_core::Code::Aborted) - transaction aborted
//!
//! Everything else is returned on the first attempt.
//!
//! Each attempt runs with its own [`CallContext`] whose attempt counter is
//! the 1-based attempt number, sharing the caller's deadline and
//! cancellation token. A backoff sleep is cut short by cancellation, and
//! skipped when the deadline would pass before it ends; the last error is
//! returned in both cases.
//!
//! [backoff]: https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use grpcmw_core::{
    CallContext, ConfigError, Interceptor, RetryConfig, Status, UnaryFunc, UnaryRequest,
};

/// Defaults from the gRPC connection backoff spec.
pub mod defaults {
    use std::time::Duration;

    pub const BASE_DELAY: Duration = Duration::from_secs(1);

    pub const MULTIPLIER: f64 = 1.6;

    /// 0.2 means +/- 20%.
    pub const JITTER: f64 = 0.2;

    pub const MAX_DELAY: Duration = Duration::from_secs(120);

    /// Total attempts, the first one included.
    pub const MAX_ATTEMPTS: u32 = 3;
}

/// Retry behaviour.
///
/// ```
/// use grpcmw_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .max_attempts(5)
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(30));
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first. 1 disables retrying.
    pub max_attempts: u32,

    pub base_delay: Duration,

    /// Growth factor between consecutive delays. Must be >= 1.0.
    pub multiplier: f64,

    /// Jitter as a fraction of the delay, 0.0-1.0.
    pub jitter: f64,

    /// No delay exceeds this.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay: defaults::BASE_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            max_delay: defaults::MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_delay: config.max_delay(),
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Short delays for latency-sensitive calls: 50ms base, 1s cap,
    /// 6 attempts.
    pub fn aggressive() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_attempts: 6,
            ..Default::default()
        }
    }

    /// Long delays for background work: 2s base, 5min cap, 11 attempts.
    pub fn patient() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            max_attempts: 11,
            ..Default::default()
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::RetryPolicy("max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::RetryPolicy("base_delay must not exceed max_delay"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::RetryPolicy("multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::RetryPolicy("jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }

    /// Run `f` under this policy. See [`retry_with_policy`].
    pub async fn invoke<F, Fut, T>(&self, ctx: &CallContext, f: F) -> Result<T, Status>
    where
        F: Fn(CallContext) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        retry_with_policy(self, ctx, f).await
    }
}

/// Sleep durations between attempts.
///
/// The n-th delay is `base * multiplier^n`, capped at `max_delay`, with
/// jitter applied after the cap and the result capped again.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    /// Un-jittered delay of the next step, in seconds.
    current_delay_secs: f64,
    delays: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let current_delay_secs = policy.base_delay.as_secs_f64();
        Self {
            policy,
            current_delay_secs,
            delays: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_delay_secs = self.policy.base_delay.as_secs_f64();
        self.delays = 0;
    }

    /// Number of delays handed out so far.
    pub fn delays(&self) -> u32 {
        self.delays
    }

    pub fn next_delay(&mut self) -> Duration {
        let max = self.policy.max_delay.as_secs_f64();
        let delay = self.current_delay_secs;

        // delay * (1 + jitter * random(-1, 1))
        let jittered = if self.policy.jitter > 0.0 {
            let random_factor =
                rand::random::<f64>() * self.policy.jitter * 2.0 - self.policy.jitter;
            delay * (1.0 + random_factor)
        } else {
            delay
        };

        self.current_delay_secs = (self.current_delay_secs * self.policy.multiplier).min(max);
        self.delays += 1;

        Duration::from_secs_f64(jittered.min(max).max(0.0))
    }
}

/// Retry with the default policy.
pub async fn retry<F, Fut, T>(ctx: &CallContext, f: F) -> Result<T, Status>
where
    F: Fn(CallContext) -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    retry_with_policy(&RetryPolicy::default(), ctx, f).await
}

/// Retry `f` under `policy`.
///
/// `f` is called with a fresh context per attempt. An invalid policy fails
/// with `InvalidArgument` before the first attempt.
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    ctx: &CallContext,
    f: F,
) -> Result<T, Status>
where
    F: Fn(CallContext) -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    policy.validate()?;

    let mut backoff = policy.backoff();
    let mut attempt = 1;
    loop {
        let err = match f(ctx.clone().with_attempt(attempt)).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = backoff.next_delay();
        if ctx.remaining().is_some_and(|remaining| remaining <= delay) {
            tracing::debug!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "deadline passes before next attempt, giving up"
            );
            return Err(err);
        }
        tracing::debug!(
            error = %err,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after transient error"
        );
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Outermost client stage: retries unary calls under a [`RetryPolicy`].
///
/// Streamed calls pass through; a consumed request stream cannot be
/// replayed.
#[derive(Clone, Debug)]
pub struct RetryInterceptor {
    policy: Arc<RetryPolicy>,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let policy = self.policy.clone();
        Arc::new(move |ctx: CallContext, request: UnaryRequest| {
            let next = next.clone();
            let policy = policy.clone();
            Box::pin(async move {
                retry_with_policy(&policy, &ctx, |attempt_ctx| next(attempt_ctx, request.clone()))
                    .await
            })
        })
    }
}

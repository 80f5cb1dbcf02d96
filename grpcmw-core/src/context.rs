//! Per-call context.
//!
//! A [`CallContext`] is created when a call enters a chain and is passed by
//! value through every stage. Stages that need to change it (retry sets the
//! attempt, tracing sets the span) hand a modified copy inward; nothing about
//! one call is visible to another.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::descriptor::StreamKind;
use crate::error::Status;

/// Header carrying the caller's timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Which side of a call a chain runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a span in a distributed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
}

impl SpanContext {
    /// Render as a W3C `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }

    /// Parse a W3C `traceparent` header value (version `00` only).
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace = parts.next()?;
        let span = parts.next()?;
        let flags = parts.next()?;
        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace.len() != 32 || span.len() != 16 || flags.len() != 2 {
            return None;
        }
        let trace_id = u128::from_str_radix(trace, 16).ok()?;
        let span_id = u64::from_str_radix(span, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            sampled: flags & 0x01 == 1,
        })
    }
}

/// Everything a stage may know about the call it is handling.
#[derive(Clone)]
pub struct CallContext {
    service: Arc<str>,
    method: Arc<str>,
    kind: StreamKind,
    role: Role,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    span: Option<SpanContext>,
    attempt: u32,
}

impl CallContext {
    pub fn new(service: impl Into<Arc<str>>, method: impl Into<Arc<str>>, role: Role) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind: StreamKind::Unary,
            role,
            deadline: None,
            cancel: CancellationToken::new(),
            span: None,
            attempt: 1,
        }
    }

    pub fn with_kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set an absolute deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline `timeout` from now. An earlier existing deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_span(mut self, span: SpanContext) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `/<service>/<method>`
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn span(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    /// 1-based attempt number; always 1 outside the retry stage.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast when the call was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), Status> {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("call cancelled"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Status::deadline_exceeded("deadline exceeded"));
            }
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the call is cancelled, or the deadline
    /// passes, whichever happens first. `fut` is dropped on the latter two.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Status::cancelled("call cancelled")),
            _ = deadline => Err(Status::deadline_exceeded("deadline exceeded")),
            result = fut => result,
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("span", &self.span)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Parse a `grpc-timeout` header value: up to 8 digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Render a timeout for the `grpc-timeout` header, using the finest unit
/// whose value fits in 8 digits.
pub fn encode_grpc_timeout(timeout: Duration) -> String {
    const MAX: u128 = 99_999_999;
    let nanos = timeout.as_nanos();
    if nanos <= MAX {
        return format!("{nanos}n");
    }
    let micros = timeout.as_micros();
    if micros <= MAX {
        return format!("{micros}u");
    }
    let millis = timeout.as_millis();
    if millis <= MAX {
        return format!("{millis}m");
    }
    let secs = timeout.as_secs() as u128;
    if secs <= MAX {
        return format!("{secs}S");
    }
    let minutes = secs / 60;
    if minutes <= MAX {
        return format!("{minutes}M");
    }
    format!("{}H", (secs / 3600).min(MAX))
}

/// The smaller of a server-side limit and the caller's timeout.
pub fn compute_effective_timeout(
    server_timeout: Option<Duration>,
    client_timeout: Option<Duration>,
) -> Option<Duration> {
    match (server_timeout, client_timeout) {
        (Some(server), Some(client)) => Some(server.min(client)),
        (Some(server), None) => Some(server),
        (None, Some(client)) => Some(client),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    fn ctx() -> CallContext {
        CallContext::new("pkg.Greeter", "SayHello", Role::Server)
    }

    #[test]
    fn test_context_defaults() {
        let ctx = ctx();
        assert_eq!(ctx.service(), "pkg.Greeter");
        assert_eq!(ctx.method(), "SayHello");
        assert_eq!(ctx.full_method(), "/pkg.Greeter/SayHello");
        assert_eq!(ctx.role(), Role::Server);
        assert_eq!(ctx.kind(), StreamKind::Unary);
        assert_eq!(ctx.attempt(), 1);
        assert!(ctx.deadline().is_none());
        assert!(ctx.span().is_none());
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn test_with_deadline_keeps_earlier() {
        let now = Instant::now();
        let ctx = ctx()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_check_cancelled() {
        let token = CancellationToken::new();
        let ctx = ctx().with_cancellation(token.clone());
        token.cancel();
        assert_eq!(ctx.check().unwrap_err().code(), Code::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_deadline_exceeded() {
        let ctx = ctx().with_timeout(Duration::from_millis(10));
        assert!(ctx.check().is_ok());
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(ctx.check().unwrap_err().code(), Code::DeadlineExceeded);
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_run_completes() {
        let result = ctx().run(async { Ok::<_, Status>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_cuts_work_short() {
        let ctx = ctx().with_timeout(Duration::from_millis(50));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Status>(())
            })
            .await;
        assert_eq!(result.unwrap_err().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_run_cancellation_cuts_work_short() {
        let token = CancellationToken::new();
        let ctx = ctx().with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let result = ctx
            .run(std::future::pending::<Result<(), Status>>())
            .await;
        assert_eq!(result.unwrap_err().code(), Code::Canceled);
        canceller.await.unwrap();
    }

    #[test]
    fn test_traceparent_round_trip() {
        let span = SpanContext {
            trace_id: 0x4bf92f3577b34da6a3ce929d0e0e4736,
            span_id: 0x00f067aa0ba902b7,
            sampled: true,
        };
        let header = span.to_traceparent();
        assert_eq!(header, "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");
        assert_eq!(SpanContext::from_traceparent(&header), Some(span));
    }

    #[test]
    fn test_traceparent_rejects_invalid() {
        assert!(SpanContext::from_traceparent("").is_none());
        for invalid in [
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
        ] {
            assert!(SpanContext::from_traceparent(invalid).is_none(), "{invalid}");
        }
        assert!(SpanContext::from_traceparent("00-4bf92f35-00f067aa0ba902b7-01").is_none());
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("5u"), Some(Duration::from_micros(5)));
        assert_eq!(parse_grpc_timeout("7n"), Some(Duration::from_nanos(7)));
    }

    #[test]
    fn test_parse_grpc_timeout_invalid() {
        assert_eq!(parse_grpc_timeout(""), None);
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("10"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
    }

    #[test]
    fn test_encode_grpc_timeout() {
        assert_eq!(encode_grpc_timeout(Duration::from_nanos(500)), "500n");
        assert_eq!(encode_grpc_timeout(Duration::from_millis(250)), "250000u");
        assert_eq!(encode_grpc_timeout(Duration::from_secs(30)), "30000000u");
        assert_eq!(encode_grpc_timeout(Duration::from_secs(3600)), "3600000m");
        let encoded = encode_grpc_timeout(Duration::from_secs(86_400 * 365));
        assert!(parse_grpc_timeout(&encoded).is_some());
    }

    #[test]
    fn test_compute_effective_timeout() {
        let s = Some(Duration::from_secs(5));
        let c = Some(Duration::from_secs(2));
        assert_eq!(compute_effective_timeout(s, c), c);
        assert_eq!(compute_effective_timeout(s, None), s);
        assert_eq!(compute_effective_timeout(None, c), c);
        assert_eq!(compute_effective_timeout(None, None), None);
    }
}

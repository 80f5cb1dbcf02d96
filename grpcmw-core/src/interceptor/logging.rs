//! Structured call logging.
//!
//! One event per call (per attempt on the client), emitted when the outcome
//! is known. Streamed calls are logged when the response stream finishes,
//! so `grpc.time_ns` covers the whole stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{Interceptor, StreamingFunc, StreamingRequest, UnaryFunc, UnaryRequest, observe_stream};
use crate::context::CallContext;
use crate::error::Code;

macro_rules! call_event {
    ($level:ident, $ctx:expr, $code:expr, $elapsed:expr, $error:expr) => {
        tracing::$level!(
            grpc.service = $ctx.service(),
            grpc.method = $ctx.method(),
            grpc.role = $ctx.role().as_str(),
            grpc.kind = $ctx.kind().as_str(),
            grpc.attempt = $ctx.attempt(),
            grpc.code = $code.as_str(),
            grpc.time_ns = $elapsed.as_nanos() as u64,
            grpc.error = $error,
            "finished call"
        )
    };
}

/// Emit the per-call record. OK logs at `info`, request-side failures at
/// `warn`, server-side faults at `error`.
pub(crate) fn log_call(ctx: &CallContext, code: Code, elapsed: Duration, error: &str) {
    match code {
        Code::Ok => call_event!(info, ctx, code, elapsed, error),
        code if code.is_server_fault() => call_event!(error, ctx, code, elapsed, error),
        _ => call_event!(warn, ctx, code, elapsed, error),
    }
}

/// Logs every call passing through and races the inward call against the
/// context's cancellation and deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        Arc::new(move |ctx: CallContext, request: UnaryRequest| {
            let next = next.clone();
            Box::pin(async move {
                let start = Instant::now();
                let result = ctx.run(next(ctx.clone(), request)).await;
                match &result {
                    Ok(_) => log_call(&ctx, Code::Ok, start.elapsed(), ""),
                    Err(status) => log_call(
                        &ctx,
                        status.code(),
                        start.elapsed(),
                        status.message().unwrap_or_default(),
                    ),
                }
                result
            })
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        Arc::new(move |ctx: CallContext, request: StreamingRequest| {
            let next = next.clone();
            Box::pin(async move {
                let start = Instant::now();
                match ctx.run(next(ctx.clone(), request)).await {
                    Ok(mut response) => {
                        let ctx = ctx.clone();
                        response.messages = observe_stream(response.messages, move |code| {
                            log_call(&ctx, code, start.elapsed(), "")
                        });
                        Ok(response)
                    }
                    Err(status) => {
                        log_call(
                            &ctx,
                            status.code(),
                            start.elapsed(),
                            status.message().unwrap_or_default(),
                        );
                        Err(status)
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;
    use crate::error::Status;
    use crate::interceptor::{StreamingResponse, UnaryResponse, streaming_fn, unary_fn};
    use bytes::Bytes;
    use futures::StreamExt;
    use std::io;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        (captured, tracing::subscriber::set_default(subscriber))
    }

    fn ctx() -> CallContext {
        CallContext::new("pkg.Greeter", "SayHello", Role::Server)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unary_ok_logs_info() {
        let (captured, _guard) = capture();
        let call = LoggingInterceptor::new().wrap_unary(unary_fn(
            |_ctx, req: UnaryRequest| async move { Ok(UnaryResponse::new(req.message)) },
        ));

        call(ctx(), UnaryRequest::default()).await.unwrap();

        let text = captured.text();
        assert!(text.contains("INFO"), "{text}");
        assert!(text.contains("finished call"));
        assert!(text.contains("grpc.method"));
        assert!(text.contains("SayHello"));
        assert!(text.contains("grpc.time_ns"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unary_error_levels() {
        let (captured, _guard) = capture();
        let not_found = LoggingInterceptor.wrap_unary(unary_fn(|_ctx, _req| async move {
            Err(Status::not_found("no such greeting"))
        }));
        let internal = LoggingInterceptor.wrap_unary(unary_fn(|_ctx, _req| async move {
            Err(Status::internal("database on fire"))
        }));

        let err = not_found(ctx(), UnaryRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound, "errors pass through unchanged");
        internal(ctx(), UnaryRequest::default()).await.unwrap_err();

        let text = captured.text();
        let warn_line = text.lines().find(|l| l.contains("not_found")).unwrap();
        assert!(warn_line.contains("WARN"), "{warn_line}");
        let error_line = text.lines().find(|l| l.contains("database on fire")).unwrap();
        assert!(error_line.contains("ERROR"), "{error_line}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancelled_before_forwarding() {
        let token = CancellationToken::new();
        token.cancel();
        let call = LoggingInterceptor.wrap_unary(unary_fn(|_ctx, _req| async move {
            panic!("inner stage must not run for a cancelled call")
        }));

        let err = call(ctx().with_cancellation(token), UnaryRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Canceled);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_deadline_stops_abandoned_work() {
        let call = LoggingInterceptor.wrap_unary(unary_fn(|_ctx, _req| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(UnaryResponse::default())
        }));

        let err = call(
            ctx().with_timeout(Duration::from_millis(100)),
            UnaryRequest::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_streaming_logged_when_stream_ends() {
        let (captured, _guard) = capture();
        let call = LoggingInterceptor.wrap_streaming(streaming_fn(
            |_ctx, req: StreamingRequest| async move { Ok(StreamingResponse::new(req.messages)) },
        ));

        let messages = futures::stream::iter(vec![Ok(Bytes::from_static(b"one"))]).boxed();
        let response = call(ctx(), StreamingRequest::new(messages)).await.unwrap();
        assert!(!captured.text().contains("finished call"), "not logged before the stream ends");

        let items: Vec<_> = response.messages.collect().await;
        assert_eq!(items.len(), 1);
        assert!(captured.text().contains("finished call"));
    }
}

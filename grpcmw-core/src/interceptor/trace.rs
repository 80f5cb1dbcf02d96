//! Distributed tracing stage.
//!
//! The tracing backend is an external collaborator reached through the
//! [`Tracer`] capability. No tracer means no tracing stage at all; the chain
//! builders decide that when they are built, not per call.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use tokio::time::Instant;

use super::{
    FinishGuard, Interceptor, StreamingFunc, StreamingRequest, UnaryFunc, UnaryRequest,
    observe_stream,
};
use crate::context::{CallContext, Role, SpanContext};
use crate::error::Code;

/// Header used to propagate the active span across process boundaries.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Span factory provided by a tracing backend.
pub trait Tracer: Send + Sync + 'static {
    /// Open a span for the call described by `ctx`, as a child of `parent`
    /// when there is one.
    fn start_span(&self, ctx: &CallContext, parent: Option<&SpanContext>) -> SpanContext;

    /// Close a span with the call's outcome.
    fn finish_span(&self, span: &SpanContext, code: Code, elapsed: Duration);

    /// The backend's own registry service, if it exposes one over RPC.
    /// Server chains built for that service skip tracing by default.
    fn registry_service(&self) -> Option<&str> {
        None
    }
}

/// Wraps calls in spans from a [`Tracer`].
///
/// - server: always opens a span, continuing the caller's trace when the
///   request carries a `traceparent` header.
/// - client: opens a child span only when the context already carries an
///   active span, and propagates it in `traceparent`.
#[derive(Clone)]
pub struct TracingInterceptor {
    tracer: Arc<dyn Tracer>,
    role: Role,
}

impl TracingInterceptor {
    pub fn server(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            tracer,
            role: Role::Server,
        }
    }

    pub fn client(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            tracer,
            role: Role::Client,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl std::fmt::Debug for TracingInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingInterceptor")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Decide the span for a call, or `None` to forward it untraced.
fn open_span(
    tracer: &dyn Tracer,
    role: Role,
    ctx: &CallContext,
    metadata: &mut http::HeaderMap,
) -> Option<SpanContext> {
    match role {
        Role::Server => {
            let remote = metadata
                .get(TRACEPARENT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(SpanContext::from_traceparent);
            let parent = ctx.span().copied().or(remote);
            Some(tracer.start_span(ctx, parent.as_ref()))
        }
        Role::Client => {
            let parent = ctx.span()?;
            let span = tracer.start_span(ctx, Some(parent));
            if let Ok(value) = HeaderValue::from_str(&span.to_traceparent()) {
                metadata.insert(TRACEPARENT_HEADER, value);
            }
            Some(span)
        }
    }
}

/// Closes `span` when the call finishes or is abandoned.
fn closer(
    tracer: Arc<dyn Tracer>,
    span: SpanContext,
    ctx: CallContext,
) -> FinishGuard<impl FnOnce(Code) + Send + 'static> {
    let start = Instant::now();
    FinishGuard::new(ctx, move |code| tracer.finish_span(&span, code, start.elapsed()))
}

impl Interceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let tracer = self.tracer.clone();
        let role = self.role;
        Arc::new(move |ctx: CallContext, mut request: UnaryRequest| {
            let next = next.clone();
            let tracer = tracer.clone();
            Box::pin(async move {
                ctx.check()?;
                let Some(span) = open_span(tracer.as_ref(), role, &ctx, &mut request.metadata)
                else {
                    return next(ctx, request).await;
                };
                let guard = closer(tracer, span, ctx.clone());
                let result = next(ctx.with_span(span), request).await;
                guard.finish(result.as_ref().map_or_else(|s| s.code(), |_| Code::Ok));
                result
            })
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        let tracer = self.tracer.clone();
        let role = self.role;
        Arc::new(move |ctx: CallContext, mut request: StreamingRequest| {
            let next = next.clone();
            let tracer = tracer.clone();
            Box::pin(async move {
                ctx.check()?;
                let Some(span) = open_span(tracer.as_ref(), role, &ctx, &mut request.metadata)
                else {
                    return next(ctx, request).await;
                };
                let guard = closer(tracer, span, ctx.clone());
                match next(ctx.with_span(span), request).await {
                    Ok(mut response) => {
                        response.messages =
                            observe_stream(response.messages, move |code| guard.finish(code));
                        Ok(response)
                    }
                    Err(status) => {
                        guard.finish(status.code());
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
    use crate::error::Status;
    use crate::interceptor::{UnaryResponse, unary_fn};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingTracer {
        next_id: AtomicU64,
        started: Mutex<Vec<(String, Option<SpanContext>)>>,
        finished: Mutex<Vec<(SpanContext, Code)>>,
    }

    impl Tracer for RecordingTracer {
        fn start_span(&self, ctx: &CallContext, parent: Option<&SpanContext>) -> SpanContext {
            self.started
                .lock()
                .push((ctx.full_method(), parent.copied()));
            SpanContext {
                trace_id: parent.map_or(0xabc, |p| p.trace_id),
                span_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                sampled: true,
            }
        }

        fn finish_span(&self, span: &SpanContext, code: Code, _elapsed: Duration) {
            self.finished.lock().push((*span, code));
        }
    }

    fn ctx(role: Role) -> CallContext {
        CallContext::new("pkg.Greeter", "SayHello", role)
    }

    /// Echoes the span it was handed back in `x-span-id`.
    fn span_echo() -> UnaryFunc {
        unary_fn(|ctx: CallContext, req: UnaryRequest| async move {
            let mut response = UnaryResponse::new(req.message);
            if let Some(span) = ctx.span() {
                response
                    .metadata
                    .insert("x-span-id", HeaderValue::from(span.span_id));
            }
            if let Some(tp) = req.metadata.get(TRACEPARENT_HEADER) {
                response.metadata.insert(TRACEPARENT_HEADER, tp.clone());
            }
            Ok(response)
        })
    }

    #[tokio::test]
    async fn test_server_span_visible_to_handler() {
        let tracer = Arc::new(RecordingTracer::default());
        let call = TracingInterceptor::server(tracer.clone()).wrap_unary(span_echo());

        let response = call(ctx(Role::Server), UnaryRequest::default()).await.unwrap();
        assert_eq!(response.metadata.get("x-span-id").unwrap(), "1");
        assert_eq!(tracer.finished.lock().len(), 1);
        assert_eq!(tracer.finished.lock()[0].1, Code::Ok);
    }

    #[tokio::test]
    async fn test_server_continues_remote_trace() {
        let tracer = Arc::new(RecordingTracer::default());
        let call = TracingInterceptor::server(tracer.clone()).wrap_unary(span_echo());

        let remote = SpanContext {
            trace_id: 0x1234,
            span_id: 0x99,
            sampled: true,
        };
        let mut request = UnaryRequest::default();
        request.metadata.insert(
            TRACEPARENT_HEADER,
            HeaderValue::from_str(&remote.to_traceparent()).unwrap(),
        );
        call(ctx(Role::Server), request).await.unwrap();

        let started = tracer.started.lock();
        assert_eq!(started[0].1, Some(remote));
    }

    #[tokio::test]
    async fn test_server_records_error_outcome() {
        let tracer = Arc::new(RecordingTracer::default());
        let call = TracingInterceptor::server(tracer.clone()).wrap_unary(unary_fn(
            |_ctx, _req| async move { Err(Status::permission_denied("nope")) },
        ));

        let err = call(ctx(Role::Server), UnaryRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(tracer.finished.lock()[0].1, Code::PermissionDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_span_closed_when_deadline_abandons_call() {
        let tracer = Arc::new(RecordingTracer::default());
        let call = TracingInterceptor::server(tracer.clone()).wrap_unary(unary_fn(
            |_ctx, _req| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(UnaryResponse::default())
            },
        ));

        let expiring = ctx(Role::Server).with_timeout(Duration::from_millis(100));
        let err = expiring
            .run(call(expiring.clone(), UnaryRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);

        let finished = tracer.finished.lock();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].1, Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_client_without_active_span_is_untraced() {
        let tracer = Arc::new(RecordingTracer::default());
        let call = TracingInterceptor::client(tracer.clone()).wrap_unary(span_echo());

        let response = call(ctx(Role::Client), UnaryRequest::default()).await.unwrap();
        assert!(response.metadata.get(TRACEPARENT_HEADER).is_none());
        assert!(tracer.started.lock().is_empty());
    }

    #[tokio::test]
    async fn test_client_child_span_propagated() {
        let tracer = Arc::new(RecordingTracer::default());
        let call = TracingInterceptor::client(tracer.clone()).wrap_unary(span_echo());

        let parent = SpanContext {
            trace_id: 0x77,
            span_id: 0x10,
            sampled: true,
        };
        let response = call(ctx(Role::Client).with_span(parent), UnaryRequest::default())
            .await
            .unwrap();

        let propagated = response.metadata.get(TRACEPARENT_HEADER).unwrap();
        let child = SpanContext::from_traceparent(propagated.to_str().unwrap()).unwrap();
        assert_eq!(child.trace_id, 0x77);
        assert_ne!(child.span_id, parent.span_id);
        assert_eq!(tracer.started.lock()[0].1, Some(parent));
    }
}

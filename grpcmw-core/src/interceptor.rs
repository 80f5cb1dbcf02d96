//! The interceptor model shared by server and client chains.
//!
//! A call is a function from a [`CallContext`] and a request to a future of
//! a response. An [`Interceptor`] wraps such a function in another one of
//! the same shape; an [`InterceptorChain`] folds a list of interceptors
//! around an innermost function once, at construction time.
//!
//! Unary and streamed calls have separate entry points. The streamed entry
//! serves server-streaming, client-streaming and bidi methods alike; the
//! shape is carried on the context.
//!
//! # Example
//!
//! ```
//! use grpcmw_core::{
//!     CallContext, HeaderInterceptor, InterceptorChain, Role, UnaryRequest, UnaryResponse,
//!     unary_fn,
//! };
//! use std::sync::Arc;
//!
//! let mut chain = InterceptorChain::new();
//! chain.push(Arc::new(HeaderInterceptor::try_new("x-tenant", "blue").unwrap()));
//!
//! let call = chain.wrap_unary(unary_fn(|_ctx, req: UnaryRequest| async move {
//!     assert_eq!(req.metadata.get("x-tenant").unwrap(), "blue");
//!     Ok(UnaryResponse::new(req.message))
//! }));
//! # let _ = call;
//! ```

mod logging;
mod metrics;
mod trace;

pub use logging::LoggingInterceptor;
pub use metrics::{CallRecord, MethodStats, MetricsInterceptor, MetricsRegistry, MetricsSink};
pub use trace::{TRACEPARENT_HEADER, Tracer, TracingInterceptor};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::context::CallContext;
use crate::error::{Code, ConfigError, Status};

/// A stream of encoded messages.
pub type MessageStream = BoxStream<'static, Result<Bytes, Status>>;

/// A unary request: metadata plus one encoded message.
#[derive(Debug, Clone, Default)]
pub struct UnaryRequest {
    pub metadata: HeaderMap,
    pub message: Bytes,
}

impl UnaryRequest {
    pub fn new(message: Bytes) -> Self {
        Self {
            metadata: HeaderMap::new(),
            message,
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A unary response: metadata plus one encoded message.
#[derive(Debug, Clone, Default)]
pub struct UnaryResponse {
    pub metadata: HeaderMap,
    pub message: Bytes,
}

impl UnaryResponse {
    pub fn new(message: Bytes) -> Self {
        Self {
            metadata: HeaderMap::new(),
            message,
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A streamed request. Unary-request shapes (server streaming) carry a
/// single-element stream.
pub struct StreamingRequest {
    pub metadata: HeaderMap,
    pub messages: MessageStream,
}

impl StreamingRequest {
    pub fn new(messages: MessageStream) -> Self {
        Self {
            metadata: HeaderMap::new(),
            messages,
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Debug for StreamingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRequest")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A streamed response. The call's outcome is the first error yielded by
/// `messages`, or OK when it ends cleanly.
pub struct StreamingResponse {
    pub metadata: HeaderMap,
    pub messages: MessageStream,
}

impl StreamingResponse {
    pub fn new(messages: MessageStream) -> Self {
        Self {
            metadata: HeaderMap::new(),
            messages,
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// The signature of a unary call.
pub type UnaryFunc = Arc<
    dyn Fn(CallContext, UnaryRequest) -> BoxFuture<'static, Result<UnaryResponse, Status>>
        + Send
        + Sync,
>;

/// The signature of a streamed call.
pub type StreamingFunc = Arc<
    dyn Fn(CallContext, StreamingRequest) -> BoxFuture<'static, Result<StreamingResponse, Status>>
        + Send
        + Sync,
>;

/// Build a [`UnaryFunc`] from an async closure.
pub fn unary_fn<F, Fut>(f: F) -> UnaryFunc
where
    F: Fn(CallContext, UnaryRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnaryResponse, Status>> + Send + 'static,
{
    Arc::new(move |ctx: CallContext, req: UnaryRequest| {
        let fut: BoxFuture<'static, Result<UnaryResponse, Status>> = Box::pin(f(ctx, req));
        fut
    })
}

/// Build a [`StreamingFunc`] from an async closure.
pub fn streaming_fn<F, Fut>(f: F) -> StreamingFunc
where
    F: Fn(CallContext, StreamingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StreamingResponse, Status>> + Send + 'static,
{
    Arc::new(
        move |ctx: CallContext,
              req: StreamingRequest|
              -> BoxFuture<'static, Result<StreamingResponse, Status>> { Box::pin(f(ctx, req)) },
    )
}

/// A unary entry that answers every call with `Unimplemented`.
pub fn unimplemented_unary() -> UnaryFunc {
    unary_fn(|ctx: CallContext, _req| async move {
        Err(Status::unimplemented(format!(
            "{} has no unary handler",
            ctx.full_method()
        )))
    })
}

/// A streamed entry that answers every call with `Unimplemented`.
pub fn unimplemented_streaming() -> StreamingFunc {
    streaming_fn(|ctx: CallContext, _req| async move {
        Err(Status::unimplemented(format!(
            "{} has no streaming handler",
            ctx.full_method()
        )))
    })
}

/// A stage in a chain.
///
/// Both methods default to passing `next` through, so a stage that only
/// cares about one call shape implements one method.
pub trait Interceptor: Send + Sync {
    /// Short name used in logs and `Debug` output.
    fn name(&self) -> &'static str;

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        next
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        next
    }
}

/// An ordered list of stages, outermost first.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Append a stage inward of every stage already present.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Stage names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Wrap `next` with every stage. Applied in reverse so the first stage
    /// pushed is the first to see the call.
    pub fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |wrapped, interceptor| interceptor.wrap_unary(wrapped))
    }

    pub fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        self.interceptors
            .iter()
            .rev()
            .fold(next, |wrapped, interceptor| interceptor.wrap_streaming(wrapped))
    }
}

/// Sets one metadata entry on every outgoing request.
#[derive(Clone, Debug)]
pub struct HeaderInterceptor {
    name: HeaderName,
    value: HeaderValue,
}

impl HeaderInterceptor {
    pub fn try_new(name: &str, value: &str) -> Result<Self, ConfigError> {
        let name = name
            .parse()
            .map_err(|_| ConfigError::InvalidHeader(format!("invalid header name: {name}")))?;
        let value = value
            .parse()
            .map_err(|_| ConfigError::InvalidHeader(format!("invalid header value: {value}")))?;
        Ok(Self { name, value })
    }

    pub fn from_parts(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }
}

impl Interceptor for HeaderInterceptor {
    fn name(&self) -> &'static str {
        "header"
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let name = self.name.clone();
        let value = self.value.clone();
        Arc::new(move |ctx: CallContext, mut request: UnaryRequest| {
            request.metadata.insert(name.clone(), value.clone());
            next(ctx, request)
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        let name = self.name.clone();
        let value = self.value.clone();
        Arc::new(move |ctx: CallContext, mut request: StreamingRequest| {
            request.metadata.insert(name.clone(), value.clone());
            next(ctx, request)
        })
    }
}

/// Handle on the rest of a unary chain, given to [`FnInterceptor`] closures.
#[derive(Clone)]
pub struct UnaryNext {
    inner: UnaryFunc,
}

impl UnaryNext {
    pub async fn call(
        self,
        ctx: CallContext,
        request: UnaryRequest,
    ) -> Result<UnaryResponse, Status> {
        (self.inner)(ctx, request).await
    }
}

/// A unary stage built from a closure. Streamed calls pass through.
///
/// ```
/// use grpcmw_core::FnInterceptor;
///
/// let audit = FnInterceptor::unary("audit", |ctx, req, next| {
///     Box::pin(async move {
///         tracing::debug!(method = %ctx.full_method(), "audited");
///         next.call(ctx, req).await
///     })
/// });
/// # let _ = audit;
/// ```
pub struct FnInterceptor<F> {
    name: &'static str,
    func: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(CallContext, UnaryRequest, UnaryNext) -> BoxFuture<'static, Result<UnaryResponse, Status>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    pub fn unary(name: &'static str, func: F) -> Self {
        Self { name, func }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(CallContext, UnaryRequest, UnaryNext) -> BoxFuture<'static, Result<UnaryResponse, Status>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let func = self.func.clone();
        Arc::new(move |ctx: CallContext, request: UnaryRequest| {
            let next = UnaryNext {
                inner: next.clone(),
            };
            func(ctx, request, next)
        })
    }
}

/// Wrap a response stream so `on_finish` runs exactly once with the call's
/// outcome: OK at end of stream, the code of the first error, or
/// `Canceled` if the stream is dropped before either.
pub fn observe_stream<F>(messages: MessageStream, on_finish: F) -> MessageStream
where
    F: FnOnce(Code) + Send + 'static,
{
    Box::pin(ObservedStream {
        inner: messages,
        on_finish: Some(Box::new(on_finish)),
    })
}

struct ObservedStream {
    inner: MessageStream,
    on_finish: Option<Box<dyn FnOnce(Code) + Send>>,
}

impl ObservedStream {
    fn finish(&mut self, code: Code) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(code);
        }
    }
}

impl Stream for ObservedStream {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = match self.inner.as_mut().poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };
        match &item {
            None => self.finish(Code::Ok),
            Some(Err(status)) => self.finish(status.code()),
            Some(Ok(_)) => {}
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        self.finish(Code::Canceled);
    }
}

/// Runs `on_finish` once with a call's outcome. If the call's future is
/// dropped first, the outcome is read from the context: `DeadlineExceeded`
/// past the deadline, `Canceled` otherwise.
pub(crate) struct FinishGuard<F: FnOnce(Code)> {
    ctx: CallContext,
    on_finish: Option<F>,
}

impl<F: FnOnce(Code)> FinishGuard<F> {
    pub(crate) fn new(ctx: CallContext, on_finish: F) -> Self {
        Self {
            ctx,
            on_finish: Some(on_finish),
        }
    }

    pub(crate) fn finish(mut self, code: Code) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(code);
        }
    }
}

impl<F: FnOnce(Code)> Drop for FinishGuard<F> {
    fn drop(&mut self) {
        if let Some(on_finish) = self.on_finish.take() {
            let code = match self.ctx.check() {
                Err(status) => status.code(),
                Ok(()) => Code::Canceled,
            };
            on_finish(code);
        }
    }
}

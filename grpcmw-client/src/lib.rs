//! # grpcmw-client
//!
//! Client-side middleware for gRPC calls.
//!
//! [`ClientChainBuilder`] composes the standard client stages:
//!
//! - **Retry:** transient failures (`Unavailable`, `ResourceExhausted`,
//!   `Aborted`) are retried with capped, jittered exponential backoff.
//! - **Logging:** one `tracing` record per attempt.
//! - **Metrics:** per-attempt `(method, duration, outcome)` samples.
//! - **Tracing:** child spans propagated in `traceparent`, when a tracer is
//!   configured and the caller already has a span.
//!
//! A [`ClientChain`] is bound to a service and the host's transport with
//! [`ClientChain::connect`], which yields a [`Channel`]. The channel applies
//! the default timeout, compresses requests, sends `grpc-timeout` and
//! decodes responses.
//!
//! ## Example
//!
//! ```
//! use bytes::Bytes;
//! use grpcmw_client::{ClientChainBuilder, RetryPolicy, Status, UnaryResponse, unary_fn};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! # tokio_test();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test() {
//! let calls = Arc::new(AtomicU32::new(0));
//! let counter = calls.clone();
//! // Fails once, then echoes.
//! let transport = unary_fn(move |_ctx, req: grpcmw_client::UnaryRequest| {
//!     let n = counter.fetch_add(1, Ordering::SeqCst);
//!     async move {
//!         if n == 0 {
//!             return Err(Status::unavailable("warming up"));
//!         }
//!         Ok(UnaryResponse::new(req.message))
//!     }
//! });
//!
//! let channel = ClientChainBuilder::new()
//!     .retry_policy(RetryPolicy::new().base_delay(Duration::from_millis(1)).jitter(0.0))
//!     .build()
//!     .unwrap()
//!     .connect("pkg.Greeter", transport, grpcmw_client::grpcmw_core::unimplemented_streaming());
//!
//! let reply = channel.unary("SayHello", Bytes::from_static(b"hi")).await.unwrap();
//! assert_eq!(&reply[..], b"hi");
//! assert_eq!(calls.load(Ordering::SeqCst), 2);
//! # }
//! ```

pub mod chain;
pub mod channel;
pub mod retry;

pub use chain::{ClientChain, ClientChainBuilder};
pub use channel::Channel;
pub use retry::{ExponentialBackoff, RetryInterceptor, RetryPolicy, retry, retry_with_policy};

// Re-export the shared types so clients only depend on this crate.
pub use grpcmw_core::{
    CallContext, ClientOptions, Code, ConfigError, Interceptor, MetricsRegistry, MetricsSink,
    MiddlewareConfig, Role, SpanContext, Status, StreamKind, StreamingFunc, StreamingRequest,
    StreamingResponse, Tracer, UnaryFunc, UnaryRequest, UnaryResponse, streaming_fn, unary_fn,
};

pub use grpcmw_core;

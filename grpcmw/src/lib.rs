//! # grpcmw
//!
//! Server-side middleware for gRPC services.
//!
//! Given a [`ServiceDescriptor`], [`ServerChainBuilder`] composes the
//! standard server stages around a service's handlers:
//!
//! - **Recovery:** panics in handlers or inner stages become `Internal`
//!   with a structured error log, and never take other calls down.
//! - **Logging:** one `tracing` record per call.
//! - **Metrics:** per-call `(method, duration, outcome)` to a [`MetricsSink`].
//! - **Tracing:** spans from a [`Tracer`], when one is configured.
//!
//! Requests are decoded and responses encoded with the pooled codecs of
//! [`grpcmw_core::codec`], negotiated per call.
//!
//! The [`bridge`] module lets browsers reach the same services over
//! gRPC-Web, with CORS admission, as a tower layer.
//!
//! ## Getting Started
//!
//! ```
//! use grpcmw::{
//!     CallContext, Handlers, ServerChainBuilder, ServiceDescriptor, StreamKind, UnaryRequest,
//!     UnaryResponse, unary_fn,
//! };
//! use http::HeaderMap;
//!
//! # tokio_test();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test() {
//! let descriptor =
//!     ServiceDescriptor::new("pkg.Greeter").with_method("SayHello", StreamKind::Unary);
//! let entry = ServerChainBuilder::new(descriptor).build().serve(
//!     Handlers::new().unary(
//!         "SayHello",
//!         unary_fn(|_ctx: CallContext, req: UnaryRequest| async move {
//!             Ok(UnaryResponse::new(req.message))
//!         }),
//!     ),
//! );
//!
//! let ctx = entry.context("SayHello", &HeaderMap::new()).unwrap();
//! let response = entry.call_unary(ctx, UnaryRequest::default()).await.unwrap();
//! assert!(response.message.is_empty());
//! # }
//! ```

pub mod bridge;
pub mod chain;
pub mod recovery;
pub mod service;

pub use bridge::{
    CorsConfig, CorsDecision, CorsPolicy, GrpcWebBridgeLayer, GrpcWebBridgeService, RequestKind,
    classify, cors_decision, list_endpoints, rewrite_to_grpc,
};
pub use chain::{ServerChain, ServerChainBuilder};
pub use recovery::{PanicReport, RECOVERED_MESSAGE, RecoveryInterceptor};
pub use service::{Handlers, ServiceEntry};

// Re-export the shared types so servers only depend on this crate.
pub use grpcmw_core::{
    CallContext, Code, ConfigError, Interceptor, InterceptorChain, MetricsRegistry, MetricsSink,
    MiddlewareConfig, Role, ServerOptions, ServiceDescriptor, SpanContext, Status, StreamKind,
    StreamingFunc, StreamingRequest, StreamingResponse, Tracer, UnaryFunc, UnaryRequest,
    UnaryResponse, streaming_fn, unary_fn,
};

pub use grpcmw_core;

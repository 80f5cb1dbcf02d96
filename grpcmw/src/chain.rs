//! Server chain construction.
//!
//! Stage order, outermost first:
//!
//! 1. recovery
//! 2. logging
//! 3. metrics
//! 4. tracing, when a tracer is configured and the service is not excluded
//! 5. interceptors added with [`ServerChainBuilder::with_interceptor`]
//!
//! The chain is folded once in [`ServerChainBuilder::build`]; no stage is
//! decided per call.

use std::fmt;
use std::sync::Arc;

use grpcmw_core::{
    CodecRegistry, Interceptor, InterceptorChain, LoggingInterceptor, MetricsInterceptor,
    MetricsRegistry, MetricsSink, MiddlewareConfig, ServerOptions, ServiceDescriptor,
    StreamingFunc, Tracer, TracingInterceptor, UnaryFunc,
};

use crate::recovery::RecoveryInterceptor;
use crate::service::{Handlers, ServiceEntry, dispatch_streaming, dispatch_unary};

/// Builds the interceptor chain for one service.
///
/// ```
/// use grpcmw::{ServerChainBuilder, ServiceDescriptor, StreamKind};
///
/// let descriptor =
///     ServiceDescriptor::new("pkg.Greeter").with_method("SayHello", StreamKind::Unary);
/// let chain = ServerChainBuilder::new(descriptor).build();
///
/// assert_eq!(chain.names(), vec!["recovery", "logging", "metrics"]);
/// ```
pub struct ServerChainBuilder {
    descriptor: ServiceDescriptor,
    options: ServerOptions,
    codecs: CodecRegistry,
    tracer: Option<Arc<dyn Tracer>>,
    metrics: Arc<dyn MetricsSink>,
    excluded_services: Vec<String>,
    backtrace: bool,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ServerChainBuilder {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            options: ServerOptions::default(),
            codecs: CodecRegistry::default(),
            tracer: None,
            metrics: Arc::new(MetricsRegistry::new()),
            excluded_services: Vec::new(),
            backtrace: true,
            interceptors: Vec::new(),
        }
    }

    /// Take server options, compression and tracing exclusions from a
    /// resolved configuration.
    pub fn from_config(descriptor: ServiceDescriptor, config: &MiddlewareConfig) -> Self {
        let mut builder = Self::new(descriptor);
        builder.options = config.server.clone();
        builder.codecs = config.compression.registry();
        builder.excluded_services = config.tracing.excluded_services.clone();
        builder
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Replace the default in-memory [`MetricsRegistry`].
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Never trace `service`, in addition to the tracer's registry service.
    pub fn exclude_from_tracing(mut self, service: impl Into<String>) -> Self {
        self.excluded_services.push(service.into());
        self
    }

    /// Whether recovered panics are logged with a backtrace.
    pub fn capture_backtraces(mut self, enabled: bool) -> Self {
        self.backtrace = enabled;
        self
    }

    /// Add a stage inward of the built-in ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    fn traced(&self) -> Option<Arc<dyn Tracer>> {
        let tracer = self.tracer.as_ref()?;
        let service = self.descriptor.name();
        if tracer.registry_service() == Some(service)
            || self.excluded_services.iter().any(|s| s == service)
        {
            tracing::debug!(grpc.service = service, "tracing disabled for service");
            return None;
        }
        Some(tracer.clone())
    }

    pub fn build(self) -> ServerChain {
        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(
            RecoveryInterceptor::new().with_backtrace(self.backtrace),
        ));
        chain.push(Arc::new(LoggingInterceptor::new()));
        chain.push(Arc::new(MetricsInterceptor::new(self.metrics.clone())));
        if let Some(tracer) = self.traced() {
            chain.push(Arc::new(TracingInterceptor::server(tracer)));
        }
        for interceptor in self.interceptors {
            chain.push(interceptor);
        }

        ServerChain {
            descriptor: Arc::new(self.descriptor),
            options: self.options,
            codecs: Arc::new(self.codecs),
            chain,
        }
    }
}

impl fmt::Debug for ServerChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChainBuilder")
            .field("service", &self.descriptor.name())
            .field("traced", &self.tracer.is_some())
            .field("excluded_services", &self.excluded_services)
            .finish_non_exhaustive()
    }
}

/// A composed server chain for one service.
#[derive(Clone)]
pub struct ServerChain {
    descriptor: Arc<ServiceDescriptor>,
    options: ServerOptions,
    codecs: Arc<CodecRegistry>,
    chain: InterceptorChain,
}

impl ServerChain {
    /// Stage names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.chain.names()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Wrap a bare unary handler with every stage. No dispatch or codec
    /// handling is added.
    pub fn unary(&self, handler: UnaryFunc) -> UnaryFunc {
        self.chain.wrap_unary(handler)
    }

    pub fn streaming(&self, handler: StreamingFunc) -> StreamingFunc {
        self.chain.wrap_streaming(handler)
    }

    /// Wrap the dispatcher for `handlers` and return the service entry.
    pub fn serve(&self, handlers: Handlers) -> ServiceEntry {
        let limits = self.options.limits();
        let unary = dispatch_unary(&handlers, self.codecs.clone(), limits);
        let streaming = dispatch_streaming(&handlers, self.codecs.clone(), limits);
        ServiceEntry::new(
            self.descriptor.clone(),
            self.options.clone(),
            self.codecs.clone(),
            self.chain.wrap_unary(unary),
            self.chain.wrap_streaming(streaming),
        )
    }
}

impl fmt::Debug for ServerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChain")
            .field("service", &self.descriptor.name())
            .field("stages", &self.chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpcmw_core::{CallContext, Code, SpanContext, StreamKind};
    use std::time::Duration;

    struct RegistryTracer;

    impl Tracer for RegistryTracer {
        fn start_span(&self, _ctx: &CallContext, _parent: Option<&SpanContext>) -> SpanContext {
            SpanContext {
                trace_id: 1,
                span_id: 1,
                sampled: true,
            }
        }

        fn finish_span(&self, _span: &SpanContext, _code: Code, _elapsed: Duration) {}

        fn registry_service(&self) -> Option<&str> {
            Some("tracing.Registry")
        }
    }

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name).with_method("Call", StreamKind::Unary)
    }

    #[test]
    fn test_default_chain_has_no_tracing() {
        let chain = ServerChainBuilder::new(descriptor("pkg.Svc")).build();
        assert_eq!(chain.names(), vec!["recovery", "logging", "metrics"]);
    }

    #[test]
    fn test_tracing_added_with_tracer() {
        let chain = ServerChainBuilder::new(descriptor("pkg.Svc"))
            .tracer(Arc::new(RegistryTracer))
            .build();
        assert_eq!(
            chain.names(),
            vec!["recovery", "logging", "metrics", "tracing"]
        );
    }

    #[test]
    fn test_registry_service_not_traced() {
        let chain = ServerChainBuilder::new(descriptor("tracing.Registry"))
            .tracer(Arc::new(RegistryTracer))
            .build();
        assert_eq!(chain.names(), vec!["recovery", "logging", "metrics"]);
    }

    #[test]
    fn test_configured_exclusions() {
        let config = MiddlewareConfig::from_json_str(
            r#"{"tracing": {"excluded_services": ["grpc.health.v1.Health"]}}"#,
        )
        .unwrap();
        let chain = ServerChainBuilder::from_config(descriptor("grpc.health.v1.Health"), &config)
            .tracer(Arc::new(RegistryTracer))
            .build();
        assert_eq!(chain.names(), vec!["recovery", "logging", "metrics"]);

        let chain = ServerChainBuilder::new(descriptor("pkg.Svc"))
            .exclude_from_tracing("pkg.Svc")
            .tracer(Arc::new(RegistryTracer))
            .build();
        assert!(!chain.names().contains(&"tracing"));
    }

    #[test]
    fn test_custom_interceptors_are_innermost() {
        let header = grpcmw_core::HeaderInterceptor::try_new("x-tenant", "blue").unwrap();
        let chain = ServerChainBuilder::new(descriptor("pkg.Svc"))
            .with_interceptor(Arc::new(header))
            .tracer(Arc::new(RegistryTracer))
            .build();
        assert_eq!(
            chain.names(),
            vec!["recovery", "logging", "metrics", "tracing", "header"]
        );
    }
}

//! Client chain construction.
//!
//! Stage order, outermost first:
//!
//! 1. retry
//! 2. logging
//! 3. metrics
//! 4. tracing, when a tracer is configured
//! 5. interceptors added with [`ClientChainBuilder::with_interceptor`]
//!
//! Every retry attempt therefore gets its own log record, metrics sample
//! and child span.

use std::fmt;
use std::sync::Arc;

use grpcmw_core::{
    ClientOptions, CodecRegistry, ConfigError, Interceptor, InterceptorChain, LoggingInterceptor,
    MetricsInterceptor, MetricsRegistry, MetricsSink, MiddlewareConfig, StreamingFunc, Tracer,
    TracingInterceptor, UnaryFunc,
};

use crate::channel::Channel;
use crate::retry::{RetryInterceptor, RetryPolicy};

/// Builds the interceptor chain shared by a client's calls.
///
/// ```
/// use grpcmw_client::{ClientChainBuilder, RetryPolicy};
///
/// let chain = ClientChainBuilder::new()
///     .retry_policy(RetryPolicy::aggressive())
///     .build()
///     .unwrap();
///
/// assert_eq!(chain.names(), vec!["retry", "logging", "metrics"]);
/// ```
pub struct ClientChainBuilder {
    options: ClientOptions,
    codecs: CodecRegistry,
    retry: RetryPolicy,
    tracer: Option<Arc<dyn Tracer>>,
    metrics: Arc<dyn MetricsSink>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for ClientChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientChainBuilder {
    pub fn new() -> Self {
        Self {
            options: ClientOptions::default(),
            codecs: CodecRegistry::default(),
            retry: RetryPolicy::default(),
            tracer: None,
            metrics: Arc::new(MetricsRegistry::new()),
            interceptors: Vec::new(),
        }
    }

    /// Take client options, retry policy and compression from a resolved
    /// configuration.
    pub fn from_config(config: &MiddlewareConfig) -> Self {
        Self {
            options: config.client.clone(),
            codecs: config.compression.registry(),
            retry: RetryPolicy::from_config(&config.retry),
            ..Self::new()
        }
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
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

    /// Add a stage inward of the built-in ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Fails when the retry policy is invalid.
    pub fn build(self) -> Result<ClientChain, ConfigError> {
        self.retry.validate()?;

        let mut chain = InterceptorChain::new();
        chain.push(Arc::new(RetryInterceptor::new(self.retry)));
        chain.push(Arc::new(LoggingInterceptor::new()));
        chain.push(Arc::new(MetricsInterceptor::new(self.metrics)));
        if let Some(tracer) = self.tracer {
            chain.push(Arc::new(TracingInterceptor::client(tracer)));
        }
        for interceptor in self.interceptors {
            chain.push(interceptor);
        }

        Ok(ClientChain {
            options: self.options,
            codecs: Arc::new(self.codecs),
            chain,
        })
    }
}

impl fmt::Debug for ClientChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChainBuilder")
            .field("options", &self.options)
            .field("retry", &self.retry)
            .field("traced", &self.tracer.is_some())
            .finish_non_exhaustive()
    }
}

/// A composed client chain.
#[derive(Clone)]
pub struct ClientChain {
    options: ClientOptions,
    codecs: Arc<CodecRegistry>,
    chain: InterceptorChain,
}

impl ClientChain {
    /// Stage names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.chain.names()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Wrap a bare unary invoker with every stage. No codec or timeout
    /// header handling is added.
    pub fn unary(&self, invoker: UnaryFunc) -> UnaryFunc {
        self.chain.wrap_unary(invoker)
    }

    pub fn streaming(&self, invoker: StreamingFunc) -> StreamingFunc {
        self.chain.wrap_streaming(invoker)
    }

    /// Bind the chain to `service` over the host's transport.
    pub fn connect(
        &self,
        service: impl Into<Arc<str>>,
        unary: UnaryFunc,
        streaming: StreamingFunc,
    ) -> Channel {
        Channel::new(
            service.into(),
            self.options.clone(),
            self.codecs.clone(),
            &self.chain,
            unary,
            streaming,
        )
    }
}

impl fmt::Debug for ClientChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChain")
            .field("stages", &self.chain.names())
            .finish_non_exhaustive()
    }
}

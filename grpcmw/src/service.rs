//! Method dispatch: the innermost function of a server chain.
//!
//! The dispatcher routes a call to the handler registered for its method,
//! enforces message size limits, decodes request messages according to
//! `grpc-encoding` and encodes responses with the codec negotiated from
//! `grpc-accept-encoding`. Everything outward of it (recovery, logging,
//! metrics, tracing) sees encoded messages and the handler's outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use grpcmw_core::{
    BoxedCodec, CallContext, CodecRegistry, GRPC_ACCEPT_ENCODING, GRPC_ENCODING,
    GRPC_TIMEOUT_HEADER, IdentityCodec, MessageLimits, MessageStream, Role, ServerOptions,
    ServiceDescriptor, Status, StreamingFunc, StreamingRequest, StreamingResponse, UnaryFunc,
    UnaryRequest, UnaryResponse, compute_effective_timeout, parse_grpc_timeout,
};
use http::{HeaderMap, HeaderValue};

/// Handlers for one service, keyed by method name.
#[derive(Clone, Default)]
pub struct Handlers {
    unary: HashMap<String, UnaryFunc>,
    streaming: HashMap<String, StreamingFunc>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of a unary method, replacing any previous one.
    pub fn unary(mut self, method: impl Into<String>, handler: UnaryFunc) -> Self {
        self.unary.insert(method.into(), handler);
        self
    }

    /// Register the handler of a streamed method (any streaming shape).
    pub fn streaming(mut self, method: impl Into<String>, handler: StreamingFunc) -> Self {
        self.streaming.insert(method.into(), handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.unary.is_empty() && self.streaming.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut unary: Vec<_> = self.unary.keys().collect();
        let mut streaming: Vec<_> = self.streaming.keys().collect();
        unary.sort();
        streaming.sort();
        f.debug_struct("Handlers")
            .field("unary", &unary)
            .field("streaming", &streaming)
            .finish()
    }
}

fn header_str<'a>(metadata: &'a HeaderMap, name: &str) -> Option<&'a str> {
    metadata.get(name).and_then(|v| v.to_str().ok())
}

fn encoding_value(applied: &'static str) -> HeaderValue {
    HeaderValue::from_static(applied)
}

/// Innermost unary function: route, decode, call, encode.
pub(crate) fn dispatch_unary(
    handlers: &Handlers,
    codecs: Arc<CodecRegistry>,
    limits: MessageLimits,
) -> UnaryFunc {
    let handlers = Arc::new(handlers.unary.clone());
    Arc::new(move |ctx: CallContext, mut request: UnaryRequest| {
        let handler = handlers.get(ctx.method()).cloned();
        let codecs = codecs.clone();
        Box::pin(async move {
            let Some(handler) = handler else {
                return Err(Status::unimplemented(format!(
                    "unknown method {}",
                    ctx.full_method()
                )));
            };

            limits.check_size(request.message.len())?;
            let encoding = request.metadata.remove(GRPC_ENCODING);
            let encoding = encoding.as_ref().and_then(|v| v.to_str().ok());
            request.message = codecs.decode(encoding, request.message)?;
            limits.check_size(request.message.len())?;
            let codec = codecs.negotiate(header_str(&request.metadata, GRPC_ACCEPT_ENCODING));

            let mut response: UnaryResponse = handler(ctx, request).await?;
            limits.check_size(response.message.len())?;
            let (message, applied) = codecs.encode(&codec, response.message)?;
            response.message = message;
            response
                .metadata
                .insert(GRPC_ENCODING, encoding_value(applied));
            Ok(response)
        })
    })
}

fn decode_stream(
    messages: MessageStream,
    codecs: Arc<CodecRegistry>,
    encoding: Option<String>,
    limits: MessageLimits,
) -> MessageStream {
    messages
        .map(move |item| {
            let message = item?;
            limits.check_size(message.len())?;
            let message = codecs.decode(encoding.as_deref(), message)?;
            limits.check_size(message.len())?;
            Ok(message)
        })
        .boxed()
}

fn encode_stream(
    messages: MessageStream,
    codec: BoxedCodec,
    limits: MessageLimits,
) -> MessageStream {
    messages
        .map(move |item| {
            let message = item?;
            limits.check_size(message.len())?;
            if codec.is_identity() {
                return Ok(message);
            }
            Ok(codec.compress(&message)?)
        })
        .boxed()
}

/// Innermost streamed function: route, decode and encode message by message.
pub(crate) fn dispatch_streaming(
    handlers: &Handlers,
    codecs: Arc<CodecRegistry>,
    limits: MessageLimits,
) -> StreamingFunc {
    let handlers = Arc::new(handlers.streaming.clone());
    Arc::new(move |ctx: CallContext, mut request: StreamingRequest| {
        let handler = handlers.get(ctx.method()).cloned();
        let codecs = codecs.clone();
        Box::pin(async move {
            let Some(handler) = handler else {
                return Err(Status::unimplemented(format!(
                    "unknown method {}",
                    ctx.full_method()
                )));
            };

            let encoding = request
                .metadata
                .remove(GRPC_ENCODING)
                .and_then(|v| v.to_str().ok().map(str::to_owned));
            // Reject an unknown encoding before the handler runs.
            codecs.for_encoding(encoding.as_deref())?;
            // One encoding covers the whole response stream, so min_bytes
            // does not apply per message.
            let codec = if codecs.config().is_disabled() {
                BoxedCodec::new(IdentityCodec)
            } else {
                codecs.negotiate(header_str(&request.metadata, GRPC_ACCEPT_ENCODING))
            };
            request.messages = decode_stream(request.messages, codecs.clone(), encoding, limits);

            let mut response: StreamingResponse = handler(ctx, request).await?;
            response.messages = encode_stream(response.messages, codec.clone(), limits);
            response
                .metadata
                .insert(GRPC_ENCODING, encoding_value(codec.name()));
            Ok(response)
        })
    })
}

/// A service ready to take calls: the composed chain around its dispatcher.
///
/// Built by [`ServerChain::serve`](crate::ServerChain::serve).
#[derive(Clone)]
pub struct ServiceEntry {
    descriptor: Arc<ServiceDescriptor>,
    options: ServerOptions,
    codecs: Arc<CodecRegistry>,
    unary: UnaryFunc,
    streaming: StreamingFunc,
}

impl ServiceEntry {
    pub(crate) fn new(
        descriptor: Arc<ServiceDescriptor>,
        options: ServerOptions,
        codecs: Arc<CodecRegistry>,
        unary: UnaryFunc,
        streaming: StreamingFunc,
    ) -> Self {
        Self {
            descriptor,
            options,
            codecs,
            unary,
            streaming,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Value to advertise in `grpc-accept-encoding`.
    pub fn accept_encoding(&self) -> String {
        self.codecs.accept_encoding()
    }

    /// Build the context for a call to `method` from its request headers.
    ///
    /// The deadline is the shorter of the caller's `grpc-timeout` and the
    /// configured server timeout. Unknown methods are `Unimplemented`; a
    /// malformed `grpc-timeout` is `InvalidArgument`.
    pub fn context(&self, method: &str, headers: &HeaderMap) -> Result<CallContext, Status> {
        let Some(descriptor) = self.descriptor.method(method) else {
            return Err(Status::unimplemented(format!(
                "unknown method /{}/{}",
                self.descriptor.name(),
                method
            )));
        };

        let client_timeout = match header_str(headers, GRPC_TIMEOUT_HEADER) {
            None => None,
            Some(value) => Some(parse_grpc_timeout(value).ok_or_else(|| {
                Status::invalid_argument(format!("malformed grpc-timeout: {value}"))
            })?),
        };

        let ctx = CallContext::new(self.descriptor.name(), method, Role::Server)
            .with_kind(descriptor.kind);
        Ok(
            match compute_effective_timeout(self.options.server_timeout(), client_timeout) {
                Some(timeout) => ctx.with_timeout(timeout),
                None => ctx,
            },
        )
    }

    /// Run a unary call through the chain.
    pub async fn call_unary(
        &self,
        ctx: CallContext,
        request: UnaryRequest,
    ) -> Result<UnaryResponse, Status> {
        if !ctx.kind().is_unary() {
            return Err(Status::unimplemented(format!(
                "{} is a {} method",
                ctx.full_method(),
                ctx.kind()
            )));
        }
        (self.unary)(ctx, request).await
    }

    /// Run a streamed call through the chain.
    pub async fn call_streaming(
        &self,
        ctx: CallContext,
        request: StreamingRequest,
    ) -> Result<StreamingResponse, Status> {
        if ctx.kind().is_unary() {
            return Err(Status::unimplemented(format!(
                "{} is a unary method",
                ctx.full_method()
            )));
        }
        (self.streaming)(ctx, request).await
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("service", &self.descriptor.name())
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use grpcmw_core::{
        Code, CompressionConfig, DEFLATE, SNAPPY, StreamKind, streaming_fn, unary_fn,
    };
    use std::time::Duration;

    fn codecs() -> Arc<CodecRegistry> {
        Arc::new(CodecRegistry::default())
    }

    fn echo_handlers() -> Handlers {
        Handlers::new()
            .unary(
                "Echo",
                unary_fn(|_ctx, req: UnaryRequest| async move {
                    Ok(UnaryResponse::new(req.message))
                }),
            )
            .streaming(
                "EchoStream",
                streaming_fn(|_ctx, req: StreamingRequest| async move {
                    Ok(StreamingResponse::new(req.messages))
                }),
            )
    }

    fn ctx(method: &str) -> CallContext {
        CallContext::new("pkg.Echo", method, Role::Server)
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let call = dispatch_unary(&echo_handlers(), codecs(), MessageLimits::unlimited());
        let err = call(ctx("Missing"), UnaryRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        assert!(err.message().unwrap().contains("/pkg.Echo/Missing"));
    }

    #[tokio::test]
    async fn test_request_decoded_and_response_negotiated() {
        let registry = codecs();
        let call = dispatch_unary(&echo_handlers(), registry.clone(), MessageLimits::unlimited());

        let payload = Bytes::from(vec![b'z'; 4096]);
        let deflate = registry.get(DEFLATE).unwrap();
        let mut metadata = HeaderMap::new();
        metadata.insert(GRPC_ENCODING, HeaderValue::from_static("deflate"));
        metadata.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("deflate, identity"));
        let request =
            UnaryRequest::new(deflate.compress(&payload).unwrap()).with_metadata(metadata);

        let response = call(ctx("Echo"), request).await.unwrap();
        assert_eq!(response.metadata.get(GRPC_ENCODING).unwrap(), "deflate");
        assert_eq!(deflate.decompress(response.message).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_snappy_request_and_response() {
        let registry = codecs();
        let call = dispatch_unary(&echo_handlers(), registry.clone(), MessageLimits::unlimited());

        let payload = Bytes::from(b"snappy framed payload ".repeat(64));
        let snappy = registry.get(SNAPPY).unwrap();
        let mut metadata = HeaderMap::new();
        metadata.insert(GRPC_ENCODING, HeaderValue::from_static("snappy"));
        metadata.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("snappy"));
        let request =
            UnaryRequest::new(snappy.compress(&payload).unwrap()).with_metadata(metadata);

        let response = call(ctx("Echo"), request).await.unwrap();
        assert_eq!(response.metadata.get(GRPC_ENCODING).unwrap(), "snappy");
        assert_eq!(snappy.decompress(response.message).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_unknown_request_encoding_rejected() {
        let call = dispatch_unary(&echo_handlers(), codecs(), MessageLimits::unlimited());
        let mut metadata = HeaderMap::new();
        metadata.insert(GRPC_ENCODING, HeaderValue::from_static("lz4"));

        let err = call(ctx("Echo"), UnaryRequest::default().with_metadata(metadata))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_small_response_sent_as_identity() {
        let registry = Arc::new(CodecRegistry::with_config(CompressionConfig::new(1024)));
        let call = dispatch_unary(&echo_handlers(), registry, MessageLimits::unlimited());
        let mut metadata = HeaderMap::new();
        metadata.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("deflate"));

        let request = UnaryRequest::new(Bytes::from_static(b"tiny")).with_metadata(metadata);
        let response = call(ctx("Echo"), request).await.unwrap();
        assert_eq!(response.metadata.get(GRPC_ENCODING).unwrap(), "identity");
        assert_eq!(&response.message[..], b"tiny");
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let call = dispatch_unary(&echo_handlers(), codecs(), MessageLimits::new(8));
        let err = call(ctx("Echo"), UnaryRequest::new(Bytes::from_static(b"0123456789")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_streaming_messages_decoded_and_encoded() {
        let registry = codecs();
        let call =
            dispatch_streaming(&echo_handlers(), registry.clone(), MessageLimits::unlimited());
        let deflate = registry.get(DEFLATE).unwrap().clone();

        let payloads: Vec<Bytes> = vec![Bytes::from(vec![1; 512]), Bytes::from(vec![2; 512])];
        let encoded: Vec<_> = payloads
            .iter()
            .map(|p| Ok(deflate.compress(p).unwrap()))
            .collect();
        let mut metadata = HeaderMap::new();
        metadata.insert(GRPC_ENCODING, HeaderValue::from_static("deflate"));
        metadata.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("deflate"));
        let request =
            StreamingRequest::new(futures::stream::iter(encoded).boxed()).with_metadata(metadata);

        let response = call(ctx("EchoStream").with_kind(StreamKind::BidiStreaming), request)
            .await
            .unwrap();
        assert_eq!(response.metadata.get(GRPC_ENCODING).unwrap(), "deflate");

        let received: Vec<Bytes> = response
            .messages
            .map(|m| deflate.decompress(m.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(received, payloads);
    }

    fn entry(options: ServerOptions) -> ServiceEntry {
        let descriptor = ServiceDescriptor::new("pkg.Echo")
            .with_method("Echo", StreamKind::Unary)
            .with_method("EchoStream", StreamKind::BidiStreaming);
        let handlers = echo_handlers();
        let registry = codecs();
        ServiceEntry::new(
            Arc::new(descriptor),
            options,
            registry.clone(),
            dispatch_unary(&handlers, registry.clone(), MessageLimits::unlimited()),
            dispatch_streaming(&handlers, registry, MessageLimits::unlimited()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_is_shorter_timeout() {
        let entry = entry(ServerOptions {
            server_timeout_ms: Some(5_000),
            ..ServerOptions::default()
        });

        let mut headers = HeaderMap::new();
        headers.insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_static("2S"));
        let ctx = entry.context("Echo", &headers).unwrap();
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(2)));
        assert_eq!(ctx.kind(), StreamKind::Unary);

        let ctx = entry.context("EchoStream", &HeaderMap::new()).unwrap();
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(5)));
        assert_eq!(ctx.kind(), StreamKind::BidiStreaming);
    }

    #[test]
    fn test_context_rejects_bad_input() {
        let entry = entry(ServerOptions::default());
        assert_eq!(
            entry.context("Nope", &HeaderMap::new()).unwrap_err().code(),
            Code::Unimplemented
        );

        let mut headers = HeaderMap::new();
        headers.insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(
            entry.context("Echo", &headers).unwrap_err().code(),
            Code::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_entry_checks_call_shape() {
        let entry = entry(ServerOptions::default());
        let ctx = entry.context("EchoStream", &HeaderMap::new()).unwrap();
        let err = entry.call_unary(ctx, UnaryRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let ctx = entry.context("Echo", &HeaderMap::new()).unwrap();
        let response = entry
            .call_unary(ctx, UnaryRequest::new(Bytes::from_static(b"hi")))
            .await
            .unwrap();
        assert_eq!(&response.message[..], b"hi");
    }
}

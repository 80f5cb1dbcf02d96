//! A client channel: the composed chain bound to one service and the host's
//! transport.
//!
//! The transport is whatever actually moves bytes (an HTTP/2 client, an
//! in-process server). It is wrapped once, innermost, so that every attempt:
//!
//! - is refused once the call is cancelled or past its deadline,
//! - carries `grpc-timeout` with the time left at that moment,
//! - has its response decoded per the response `grpc-encoding`.
//!
//! Request messages are compressed once per call, before the chain.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use grpcmw_core::{
    BoxedCodec, CallContext, ClientOptions, CodecRegistry, ConfigError, GRPC_ACCEPT_ENCODING,
    GRPC_ENCODING, GRPC_TIMEOUT_HEADER, IdentityCodec, InterceptorChain, MessageLimits,
    MessageStream, Role, Status, StreamKind, StreamingFunc, StreamingRequest, StreamingResponse,
    UnaryFunc, UnaryRequest, UnaryResponse, encode_grpc_timeout,
};
use http::{HeaderMap, HeaderValue};

/// A service bound to a transport through a client chain.
///
/// Cheap to clone; clones share the chain and codecs.
#[derive(Clone)]
pub struct Channel {
    service: Arc<str>,
    options: ClientOptions,
    codecs: Arc<CodecRegistry>,
    send_codec: BoxedCodec,
    unary: UnaryFunc,
    streaming: StreamingFunc,
}

impl Channel {
    pub(crate) fn new(
        service: Arc<str>,
        options: ClientOptions,
        codecs: Arc<CodecRegistry>,
        chain: &InterceptorChain,
        unary: UnaryFunc,
        streaming: StreamingFunc,
    ) -> Self {
        let limits = options.limits();
        let unary = chain.wrap_unary(transport_unary(unary, codecs.clone(), limits));
        let streaming =
            chain.wrap_streaming(transport_streaming(streaming, codecs.clone(), limits));
        Self {
            service,
            options,
            codecs,
            send_codec: BoxedCodec::new(IdentityCodec),
            unary,
            streaming,
        }
    }

    /// Compress requests with the registered codec `name`.
    pub fn with_send_encoding(mut self, name: &str) -> Result<Self, ConfigError> {
        self.send_codec = self
            .codecs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEncoding(name.to_owned()))?;
        Ok(self)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn send_encoding(&self) -> &'static str {
        self.send_codec.name()
    }

    /// A fresh context for `method`, carrying the default timeout if one is
    /// configured.
    pub fn context(&self, method: &str, kind: StreamKind) -> CallContext {
        self.apply_default_timeout(CallContext::new(self.service.clone(), method, Role::Client))
            .with_kind(kind)
    }

    fn apply_default_timeout(&self, ctx: CallContext) -> CallContext {
        match self.options.default_timeout() {
            Some(timeout) if ctx.deadline().is_none() => ctx.with_timeout(timeout),
            _ => ctx,
        }
    }

    fn advertise(&self, metadata: &mut HeaderMap, applied: &'static str) {
        metadata.insert(GRPC_ENCODING, HeaderValue::from_static(applied));
        if let Ok(accept) = HeaderValue::from_str(&self.codecs.accept_encoding()) {
            metadata.insert(GRPC_ACCEPT_ENCODING, accept);
        }
    }

    /// Send one unary call through the chain.
    pub async fn call_unary(
        &self,
        ctx: CallContext,
        mut request: UnaryRequest,
    ) -> Result<UnaryResponse, Status> {
        let ctx = self.apply_default_timeout(ctx).with_kind(StreamKind::Unary);
        self.options.limits().check_size(request.message.len())?;

        let (message, applied) = self.codecs.encode(&self.send_codec, request.message)?;
        request.message = message;
        self.advertise(&mut request.metadata, applied);

        (self.unary)(ctx, request).await
    }

    /// Call `method` with a single message and return the response message.
    pub async fn unary(&self, method: &str, message: Bytes) -> Result<Bytes, Status> {
        let ctx = self.context(method, StreamKind::Unary);
        let response = self.call_unary(ctx, UnaryRequest::new(message)).await?;
        Ok(response.message)
    }

    /// Open a streamed call. A context still marked unary is treated as
    /// bidirectional.
    pub async fn call_streaming(
        &self,
        ctx: CallContext,
        mut request: StreamingRequest,
    ) -> Result<StreamingResponse, Status> {
        let mut ctx = self.apply_default_timeout(ctx);
        if ctx.kind().is_unary() {
            ctx = ctx.with_kind(StreamKind::BidiStreaming);
        }

        let codec = self.send_codec.clone();
        self.advertise(&mut request.metadata, codec.name());
        request.messages = compress_stream(request.messages, codec, self.options.limits());

        (self.streaming)(ctx, request).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("service", &self.service)
            .field("send_encoding", &self.send_codec.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn insert_timeout(ctx: &CallContext, metadata: &mut HeaderMap) {
    let Some(remaining) = ctx.remaining() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&encode_grpc_timeout(remaining)) {
        metadata.insert(GRPC_TIMEOUT_HEADER, value);
    }
}

fn response_encoding(metadata: &HeaderMap) -> Option<&str> {
    metadata.get(GRPC_ENCODING).and_then(|v| v.to_str().ok())
}

fn transport_unary(
    transport: UnaryFunc,
    codecs: Arc<CodecRegistry>,
    limits: MessageLimits,
) -> UnaryFunc {
    Arc::new(move |ctx: CallContext, mut request: UnaryRequest| {
        let transport = transport.clone();
        let codecs = codecs.clone();
        Box::pin(async move {
            insert_timeout(&ctx, &mut request.metadata);
            let mut response = ctx.run(transport(ctx.clone(), request)).await?;

            limits.check_size(response.message.len())?;
            let message = codecs.decode(response_encoding(&response.metadata), response.message)?;
            limits.check_size(message.len())?;
            response.message = message;
            Ok(response)
        })
    })
}

fn transport_streaming(
    transport: StreamingFunc,
    codecs: Arc<CodecRegistry>,
    limits: MessageLimits,
) -> StreamingFunc {
    Arc::new(move |ctx: CallContext, mut request: StreamingRequest| {
        let transport = transport.clone();
        let codecs = codecs.clone();
        Box::pin(async move {
            insert_timeout(&ctx, &mut request.metadata);
            let mut response = ctx.run(transport(ctx.clone(), request)).await?;

            let codec = codecs
                .for_encoding(response_encoding(&response.metadata))?
                .cloned();
            response.messages = decompress_stream(response.messages, codec, limits);
            Ok(response)
        })
    })
}

fn compress_stream(
    messages: MessageStream,
    codec: BoxedCodec,
    limits: MessageLimits,
) -> MessageStream {
    messages
        .map(move |message| {
            let message = message?;
            limits.check_size(message.len())?;
            if codec.is_identity() {
                return Ok(message);
            }
            Ok(codec.compress(&message)?)
        })
        .boxed()
}

fn decompress_stream(
    messages: MessageStream,
    codec: Option<BoxedCodec>,
    limits: MessageLimits,
) -> MessageStream {
    messages
        .map(move |message| {
            let message = message?;
            limits.check_size(message.len())?;
            let Some(codec) = &codec else {
                return Ok(message);
            };
            let message = codec.decompress(message)?;
            limits.check_size(message.len())?;
            Ok(message)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ClientChainBuilder;
    use crate::retry::RetryPolicy;
    use grpcmw_core::{Code, DEFLATE, parse_grpc_timeout, streaming_fn, unary_fn};
    use std::sync::Mutex;
    use std::time::Duration;

    fn echo_transport(seen: Arc<Mutex<Vec<HeaderMap>>>) -> UnaryFunc {
        unary_fn(move |_ctx: CallContext, request: UnaryRequest| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(request.metadata.clone());
                // Echo the payload with the encoding it arrived in.
                let mut metadata = HeaderMap::new();
                if let Some(encoding) = request.metadata.get(GRPC_ENCODING) {
                    metadata.insert(GRPC_ENCODING, encoding.clone());
                }
                Ok(UnaryResponse::new(request.message).with_metadata(metadata))
            }
        })
    }

    fn no_streaming() -> StreamingFunc {
        grpcmw_core::unimplemented_streaming()
    }

    fn channel(options: ClientOptions, seen: Arc<Mutex<Vec<HeaderMap>>>) -> Channel {
        ClientChainBuilder::new()
            .options(options)
            .retry_policy(RetryPolicy::no_retry())
            .build()
            .unwrap()
            .connect("pkg.Echo", echo_transport(seen), no_streaming())
    }

    #[tokio::test]
    async fn test_identity_round_trip() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let channel = channel(ClientOptions::default(), seen.clone());

        let reply = channel.unary("Echo", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(&reply[..], b"hello");

        let headers = &seen.lock().unwrap()[0];
        assert_eq!(headers[GRPC_ENCODING], "identity");
        assert_eq!(headers[GRPC_ACCEPT_ENCODING], "deflate, snappy, identity");
        assert!(headers.get(GRPC_TIMEOUT_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_deflate_request_and_response() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let channel = channel(ClientOptions::default(), seen.clone())
            .with_send_encoding(DEFLATE)
            .unwrap();
        assert_eq!(channel.send_encoding(), "deflate");

        let payload = Bytes::from(vec![b'z'; 4096]);
        let reply = channel.unary("Echo", payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
        assert_eq!(seen.lock().unwrap()[0][GRPC_ENCODING], "deflate");
    }

    #[test]
    fn test_unknown_send_encoding() {
        let channel = channel(ClientOptions::default(), Arc::default());
        let err = channel.with_send_encoding("br").unwrap_err();
        assert_eq!(err, ConfigError::UnknownEncoding("br".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_sent_as_grpc_timeout() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = ClientOptions {
            default_timeout_ms: Some(2_000),
            ..ClientOptions::default()
        };
        let channel = channel(options, seen.clone());
        channel.unary("Echo", Bytes::new()).await.unwrap();

        let header = seen.lock().unwrap()[0][GRPC_TIMEOUT_HEADER].clone();
        let timeout = parse_grpc_timeout(header.to_str().unwrap()).unwrap();
        assert!(timeout <= Duration::from_secs(2));
        assert!(timeout > Duration::from_millis(1_900));
    }

    #[tokio::test]
    async fn test_oversize_request_rejected_before_sending() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = ClientOptions {
            max_message_size: Some(8),
            ..ClientOptions::default()
        };
        let channel = channel(options, seen.clone());

        let err = channel
            .unary("Echo", Bytes::from_static(b"far too long"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_hits_deadline() {
        let slow = unary_fn(|_ctx, _req| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(UnaryResponse::default())
        });
        let channel = ClientChainBuilder::new()
            .retry_policy(RetryPolicy::no_retry())
            .build()
            .unwrap()
            .connect("pkg.Echo", slow, no_streaming());

        let ctx = channel
            .context("Echo", StreamKind::Unary)
            .with_timeout(Duration::from_millis(100));
        let err = channel.call_unary(ctx, UnaryRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_streaming_compression_both_ways() {
        let streaming = streaming_fn(|_ctx, request: StreamingRequest| async move {
            let encoding = request.metadata.get(GRPC_ENCODING).cloned();
            let mut metadata = HeaderMap::new();
            if let Some(encoding) = encoding {
                metadata.insert(GRPC_ENCODING, encoding);
            }
            Ok(StreamingResponse::new(request.messages).with_metadata(metadata))
        });
        let channel = ClientChainBuilder::new()
            .build()
            .unwrap()
            .connect("pkg.Echo", grpcmw_core::unimplemented_unary(), streaming)
            .with_send_encoding(DEFLATE)
            .unwrap();

        let messages = futures::stream::iter([&b"one"[..], &b"two"[..]])
            .map(|m| Ok(Bytes::from_static(m)))
            .boxed();
        let ctx = channel.context("Chat", StreamKind::BidiStreaming);
        let response = channel
            .call_streaming(ctx, StreamingRequest::new(messages))
            .await
            .unwrap();
        assert_eq!(response.metadata[GRPC_ENCODING], "deflate");

        let replies: Vec<Bytes> = response.messages.map(|m| m.unwrap()).collect().await;
        assert_eq!(replies, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }
}

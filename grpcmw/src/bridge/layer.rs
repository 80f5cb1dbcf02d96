//! The bridge as a tower layer.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use grpcmw_core::ServiceDescriptor;
use http::header::VARY;
use http::{HeaderMap, Request, Response, StatusCode};
use tower::{Layer, ServiceExt};
use tower_service::Service;

use super::cors::{CorsConfig, CorsPolicy, cors_decision};
use super::{RequestKind, classify, rewrite_to_grpc};

type BridgeFuture<B, E> = Pin<Box<dyn Future<Output = Result<Response<B>, E>> + Send>>;

/// Layer that puts the gRPC-Web bridge in front of an RPC service.
///
/// ```rust,ignore
/// use grpcmw::{CorsConfig, GrpcWebBridgeLayer};
/// use tower::ServiceBuilder;
///
/// let svc = ServiceBuilder::new()
///     .layer(GrpcWebBridgeLayer::new(CorsConfig::new(), &[descriptor]))
///     .service(grpc_service);
/// ```
#[derive(Debug, Clone)]
pub struct GrpcWebBridgeLayer {
    policy: CorsPolicy,
}

impl GrpcWebBridgeLayer {
    /// Bind `config` to the services reachable behind the bridge.
    pub fn new(config: CorsConfig, descriptors: &[ServiceDescriptor]) -> Self {
        Self {
            policy: CorsPolicy::new(config, descriptors),
        }
    }

    pub fn from_policy(policy: CorsPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CorsPolicy {
        &self.policy
    }
}

impl<S> Layer<S> for GrpcWebBridgeLayer {
    type Service = GrpcWebBridgeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcWebBridgeService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Service produced by [`GrpcWebBridgeLayer`].
#[derive(Debug, Clone)]
pub struct GrpcWebBridgeService<S> {
    inner: S,
    policy: CorsPolicy,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcWebBridgeService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: http_body::Body + Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BridgeFuture<ResBody, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let kind = classify(&req);
        let decision = match kind {
            RequestKind::Plain => None,
            RequestKind::BrowserPreflight | RequestKind::BrowserRpc => {
                Some(cors_decision(&self.policy, &req))
            }
        };

        if kind == RequestKind::BrowserPreflight {
            if let Some(decision) = decision.filter(|d| d.admissible) {
                tracing::debug!(path = req.uri().path(), "answering gRPC-Web preflight");
                let mut response = Response::new(ResBody::default());
                *response.status_mut() = StatusCode::NO_CONTENT;
                *response.headers_mut() = decision.headers;
                return Box::pin(async move { Ok(response) });
            }
            tracing::debug!(path = req.uri().path(), "gRPC-Web preflight not admitted");
            return self.forward(req, None);
        }

        if kind == RequestKind::BrowserRpc {
            rewrite_to_grpc(&mut req);
        }
        self.forward(req, decision.filter(|d| d.admissible).map(|d| d.headers))
    }
}

impl<S> GrpcWebBridgeService<S> {
    fn forward<ReqBody, ResBody>(
        &mut self,
        req: Request<ReqBody>,
        cors_headers: Option<HeaderMap>,
    ) -> BridgeFuture<ResBody, <S as Service<Request<ReqBody>>>::Error>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
        <S as Service<Request<ReqBody>>>::Error: Send + 'static,
        <S as Service<Request<ReqBody>>>::Future: Send + 'static,
        ReqBody: Send + 'static,
        ResBody: Send + 'static,
    {
        // The clone may not be ready; drive the one poll_ready was called on.
        let inner = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, inner);

        Box::pin(async move {
            let mut response = inner.oneshot(req).await?;
            if let Some(headers) = cors_headers {
                merge_cors_headers(response.headers_mut(), headers);
            }
            Ok(response)
        })
    }
}

/// Add CORS headers to a response. CORS values replace the service's own,
/// except `Vary`, whose values accumulate.
fn merge_cors_headers(target: &mut HeaderMap, cors: HeaderMap) {
    for name in cors.keys() {
        if name != VARY {
            target.remove(name);
        }
    }
    for (name, value) in &cors {
        target.append(name.clone(), value.clone());
    }
}

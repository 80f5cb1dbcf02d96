//! gRPC-Web bridge.
//!
//! Browsers cannot speak gRPC over HTTP/2 directly. They send gRPC-Web
//! (`application/grpc-web*`) over any HTTP version and preflight
//! cross-origin calls with `OPTIONS`. The bridge sorts incoming requests into
//! three kinds:
//!
//! - [`RequestKind::BrowserRpc`]: rewritten in place into a plain gRPC
//!   request with [`rewrite_to_grpc`] and handed to the RPC service.
//! - [`RequestKind::BrowserPreflight`]: answered by the bridge when the CORS
//!   policy admits it.
//! - [`RequestKind::Plain`]: passed through untouched.
//!
//! Nothing here is an error. A request the bridge does not claim goes to
//! the inner service unchanged.
//!
//! The pure functions ([`classify`], [`rewrite_to_grpc`], [`cors_decision`])
//! are usable from any HTTP stack; [`GrpcWebBridgeLayer`] packages them as a
//! tower layer.

mod cors;
mod layer;

pub use cors::{CorsConfig, CorsDecision, CorsPolicy, cors_decision};
pub use layer::{GrpcWebBridgeLayer, GrpcWebBridgeService};

use grpcmw_core::ServiceDescriptor;
use http::header::{ACCESS_CONTROL_REQUEST_HEADERS, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Version};

/// Content-type prefix of gRPC-Web requests.
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web";

/// Content-type prefix of plain gRPC requests.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Request header browsers list in their preflight for gRPC-Web calls.
pub const X_GRPC_WEB: &str = "x-grpc-web";

/// How the bridge treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Plain,
    BrowserRpc,
    BrowserPreflight,
}

/// Classify a request by method and headers.
///
/// - `POST` with a content-type starting with `application/grpc-web` is a
///   browser RPC.
/// - `OPTIONS` whose `Access-Control-Request-Headers` mentions
///   `x-grpc-web` (any case) is a browser preflight.
pub fn classify<B>(req: &Request<B>) -> RequestKind {
    let headers = req.headers();
    if req.method() == Method::POST {
        let grpc_web = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(GRPC_WEB_CONTENT_TYPE));
        if grpc_web {
            return RequestKind::BrowserRpc;
        }
    } else if req.method() == Method::OPTIONS {
        let wants_grpc_web = headers
            .get_all(ACCESS_CONTROL_REQUEST_HEADERS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains(X_GRPC_WEB));
        if wants_grpc_web {
            return RequestKind::BrowserPreflight;
        }
    }
    RequestKind::Plain
}

/// Turn a browser RPC into a plain gRPC request, in place.
///
/// Sets the version to HTTP/2 and replaces the first `application/grpc-web`
/// in the content-type with `application/grpc`, so
/// `application/grpc-web+proto` becomes `application/grpc+proto`. Applying
/// it twice is harmless: the result no longer classifies as a browser RPC.
pub fn rewrite_to_grpc<B>(req: &mut Request<B>) {
    *req.version_mut() = Version::HTTP_2;
    let rewritten = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| ct.contains(GRPC_WEB_CONTENT_TYPE))
        .map(|ct| ct.replacen(GRPC_WEB_CONTENT_TYPE, GRPC_CONTENT_TYPE, 1));
    if let Some(value) = rewritten.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        req.headers_mut().insert(CONTENT_TYPE, value);
    }
}

/// `/<service>/<method>` for every method of every descriptor, in order.
pub fn list_endpoints(descriptors: &[ServiceDescriptor]) -> Vec<String> {
    descriptors.iter().flat_map(|d| d.endpoints()).collect()
}

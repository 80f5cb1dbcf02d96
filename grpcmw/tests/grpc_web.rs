use std::convert::Infallible;

use bytes::Bytes;
use grpcmw::{
    CorsConfig, GrpcWebBridgeLayer, Handlers, ServerChainBuilder, ServiceDescriptor,
    ServiceEntry, StreamKind, UnaryRequest, UnaryResponse, unary_fn,
};
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS,
    CONTENT_TYPE, ORIGIN,
};
use http::{Method, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use tower::{ServiceBuilder, ServiceExt};

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("Service")
        .with_method("Foo", StreamKind::Unary)
        .with_method("Bar", StreamKind::Unary)
}

fn entry() -> ServiceEntry {
    ServerChainBuilder::new(descriptor()).build().serve(
        Handlers::new()
            .unary(
                "Foo",
                unary_fn(|_ctx, req: UnaryRequest| async move {
                    Ok(UnaryResponse::new(req.message))
                }),
            )
            .unary(
                "Bar",
                unary_fn(|_ctx, _req| async move {
                    Ok(UnaryResponse::new(Bytes::from_static(b"bar")))
                }),
            ),
    )
}

/// A minimal gRPC endpoint: only accepts HTTP/2 `application/grpc` requests
/// and reports the status in headers.
async fn grpc_endpoint(
    entry: ServiceEntry,
    req: Request<Full<Bytes>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let is_grpc = req.version() == Version::HTTP_2
        && req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| {
                ct.starts_with("application/grpc") && !ct.starts_with("application/grpc-web")
            });
    if !is_grpc {
        return Ok(Response::builder()
            .status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            .body(Full::default())
            .unwrap());
    }

    let (parts, body) = req.into_parts();
    let method = parts.uri.path().rsplit('/').next().unwrap_or_default().to_owned();
    let message = body.collect().await.unwrap().to_bytes();

    let result = match entry.context(&method, &parts.headers) {
        Ok(ctx) => {
            entry
                .call_unary(ctx, UnaryRequest::new(message).with_metadata(parts.headers))
                .await
        }
        Err(status) => Err(status),
    };
    let response = match result {
        Ok(response) => Response::builder()
            .header("grpc-status", "0")
            .body(Full::new(response.message)),
        Err(status) => Response::builder()
            .header("grpc-status", status.code().as_i32().to_string())
            .body(Full::default()),
    };
    Ok(response.unwrap())
}

fn stack(
    restricted: bool,
) -> impl tower::Service<Request<Full<Bytes>>, Response = Response<Full<Bytes>>, Error = Infallible>
+ Clone {
    let entry = entry();
    ServiceBuilder::new()
        .layer(GrpcWebBridgeLayer::new(
            CorsConfig::new()
                .allowed_origins(["https://app.example"])
                .registered_endpoints_only(restricted),
            &[descriptor()],
        ))
        .service_fn(move |req| grpc_endpoint(entry.clone(), req))
}

#[tokio::test]
async fn test_browser_call_reaches_grpc_service() {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/Service/Foo")
        .version(Version::HTTP_11)
        .header(CONTENT_TYPE, "application/grpc-web+proto")
        .header(ORIGIN, "https://app.example")
        .body(Full::new(Bytes::from_static(b"ping")))
        .unwrap();

    let resp = stack(false).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["grpc-status"], "0");
    assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ping");
}

#[tokio::test]
async fn test_without_bridge_browser_call_is_refused() {
    let entry = entry();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/Service/Foo")
        .header(CONTENT_TYPE, "application/grpc-web+proto")
        .body(Full::default())
        .unwrap();

    let resp = grpc_endpoint(entry, req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

fn preflight(path: &str, origin: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::OPTIONS)
        .uri(path)
        .header(ACCESS_CONTROL_REQUEST_HEADERS, "X-Grpc-Web, Content-Type")
        .header(ORIGIN, origin)
        .body(Full::default())
        .unwrap()
}

#[tokio::test]
async fn test_preflight_for_registered_method() {
    let resp = stack(true)
        .oneshot(preflight("/Service/Foo", "https://app.example"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
    assert!(resp.headers().contains_key(ACCESS_CONTROL_ALLOW_HEADERS));
}

#[tokio::test]
async fn test_preflight_for_unknown_method_passes_through() {
    let resp = stack(true)
        .oneshot(preflight("/Service/Baz", "https://app.example"))
        .await
        .unwrap();
    // Not claimed by the bridge: the gRPC endpoint sees a plain OPTIONS.
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_preflight_from_unknown_origin_passes_through() {
    let resp = stack(false)
        .oneshot(preflight("/Service/Foo", "https://evil.example"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
}

#[tokio::test]
async fn test_plain_grpc_still_served() {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/Service/Bar")
        .version(Version::HTTP_2)
        .header(CONTENT_TYPE, "application/grpc")
        .body(Full::default())
        .unwrap();

    let resp = stack(true).oneshot(req).await.unwrap();
    assert_eq!(resp.headers()["grpc-status"], "0");
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"bar");
}

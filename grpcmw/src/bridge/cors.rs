//! CORS admission for browser calls.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use grpcmw_core::{ConfigError, CorsSettings, GRPC_TIMEOUT_HEADER, ServiceDescriptor};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ORIGIN,
    VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, Request};

use super::{RequestKind, classify};

type OriginPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Headers every gRPC-Web client may send, on top of configured ones.
const GRPC_WEB_REQUEST_HEADERS: [&str; 5] = [
    "u-a",
    "x-grpc-web",
    "x-user-agent",
    "content-type",
    GRPC_TIMEOUT_HEADER,
];

/// Trailers-as-headers browsers need to read the call outcome.
const EXPOSED_HEADERS: &str = "grpc-status, grpc-message";

const ALLOWED_METHODS: &str = "POST, OPTIONS";

/// CORS settings for the bridge.
///
/// Defaults: every origin allowed, credentials allowed, preflights cached
/// for ten minutes, preflights admitted for any path.
#[derive(Clone)]
pub struct CorsConfig {
    origin: OriginPredicate,
    allowed_headers: Vec<HeaderName>,
    allow_credentials: bool,
    max_age: Duration,
    registered_endpoints_only: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin: Arc::new(|_| true),
            allowed_headers: GRPC_WEB_REQUEST_HEADERS
                .into_iter()
                .map(HeaderName::from_static)
                .collect(),
            allow_credentials: true,
            max_age: Duration::from_secs(600),
            registered_endpoints_only: false,
        }
    }
}

impl CorsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from resolved settings. An empty origin list allows every
    /// origin.
    pub fn from_settings(settings: &CorsSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let mut config = Self::new()
            .allow_credentials(settings.allow_credentials)
            .max_age(settings.max_age())
            .registered_endpoints_only(settings.registered_endpoints_only);
        if !settings.allowed_origins.is_empty() {
            config = config.allowed_origins(settings.allowed_origins.iter().cloned());
        }
        for header in &settings.allowed_headers {
            let name = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(header.clone()))?;
            config = config.allow_header(name);
        }
        Ok(config)
    }

    /// Decide origins with a predicate.
    pub fn allow_origin_fn<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.origin = Arc::new(predicate);
        self
    }

    /// Allow exactly the listed origins.
    pub fn allowed_origins<I, S>(self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let origins: HashSet<String> = origins.into_iter().map(Into::into).collect();
        self.allow_origin_fn(move |origin| origins.contains(origin))
    }

    pub fn allow_header(mut self, name: HeaderName) -> Self {
        if !self.allowed_headers.contains(&name) {
            self.allowed_headers.push(name);
        }
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Admit preflights only for paths naming a registered method.
    pub fn registered_endpoints_only(mut self, enabled: bool) -> Self {
        self.registered_endpoints_only = enabled;
        self
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        (self.origin)(origin)
    }

    pub fn allowed_headers(&self) -> &[HeaderName] {
        &self.allowed_headers
    }
}

impl fmt::Debug for CorsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsConfig")
            .field("allowed_headers", &self.allowed_headers)
            .field("allow_credentials", &self.allow_credentials)
            .field("max_age", &self.max_age)
            .field("registered_endpoints_only", &self.registered_endpoints_only)
            .finish_non_exhaustive()
    }
}

/// A [`CorsConfig`] bound to the services behind the bridge.
///
/// The endpoint set and the response header values are computed once here.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    config: CorsConfig,
    endpoints: Arc<HashSet<String>>,
    allow_headers: HeaderValue,
    max_age: HeaderValue,
}

impl CorsPolicy {
    pub fn new(config: CorsConfig, descriptors: &[ServiceDescriptor]) -> Self {
        let endpoints = super::list_endpoints(descriptors).into_iter().collect();
        let allow_headers = config
            .allowed_headers
            .iter()
            .map(HeaderName::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        // Header names are valid header values.
        let allow_headers =
            HeaderValue::from_str(&allow_headers).unwrap_or(HeaderValue::from_static("*"));
        let max_age = HeaderValue::from(config.max_age.as_secs());
        Self {
            config,
            endpoints: Arc::new(endpoints),
            allow_headers,
            max_age,
        }
    }

    pub fn config(&self) -> &CorsConfig {
        &self.config
    }

    /// Whether a preflight for `path` passes the endpoint restriction.
    pub fn is_path_admissible(&self, path: &str) -> bool {
        !self.config.registered_endpoints_only || self.endpoints.contains(path)
    }

    fn allowed_origin<'a>(&self, headers: &'a HeaderMap) -> Option<&'a HeaderValue> {
        let origin = headers.get(ORIGIN)?;
        let allowed = origin
            .to_str()
            .is_ok_and(|o| self.config.is_origin_allowed(o));
        allowed.then_some(origin)
    }

    fn origin_headers(&self, origin: &HeaderValue, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        if self.config.allow_credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
}

/// What the bridge should do with a request's CORS side.
#[derive(Debug, Clone, Default)]
pub struct CorsDecision {
    /// For preflights: whether the bridge answers it. For browser RPCs:
    /// whether the origin (if any) is allowed. Always false for plain
    /// requests.
    pub admissible: bool,
    /// Headers to put on the response.
    pub headers: HeaderMap,
}

/// Decide the CORS outcome of a request.
///
/// A preflight is admissible when its path passes the endpoint restriction
/// and its `Origin`, if present, is allowed. Browser RPCs get the
/// allow-origin headers when they carry an allowed `Origin`.
pub fn cors_decision<B>(policy: &CorsPolicy, req: &Request<B>) -> CorsDecision {
    let headers = req.headers();
    match classify(req) {
        RequestKind::Plain => CorsDecision::default(),
        RequestKind::BrowserPreflight => {
            let origin_ok =
                !headers.contains_key(ORIGIN) || policy.allowed_origin(headers).is_some();
            if !origin_ok || !policy.is_path_admissible(req.uri().path()) {
                return CorsDecision::default();
            }
            let mut out = HeaderMap::new();
            if let Some(origin) = policy.allowed_origin(headers) {
                policy.origin_headers(origin, &mut out);
            }
            out.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOWED_METHODS),
            );
            out.insert(ACCESS_CONTROL_ALLOW_HEADERS, policy.allow_headers.clone());
            out.insert(ACCESS_CONTROL_MAX_AGE, policy.max_age.clone());
            CorsDecision {
                admissible: true,
                headers: out,
            }
        }
        RequestKind::BrowserRpc => {
            if !headers.contains_key(ORIGIN) {
                return CorsDecision {
                    admissible: true,
                    headers: HeaderMap::new(),
                };
            }
            let Some(origin) = policy.allowed_origin(headers) else {
                return CorsDecision::default();
            };
            let mut out = HeaderMap::new();
            policy.origin_headers(origin, &mut out);
            out.insert(
                ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(EXPOSED_HEADERS),
            );
            CorsDecision {
                admissible: true,
                headers: out,
            }
        }
    }
}

//! Middleware configuration.
//!
//! [`MiddlewareConfig`] is resolved once at startup (parsed, defaulted and
//! validated) and handed to the chain and bridge builders. Nothing reads
//! configuration after that.
//!
//! Durations are stored as milliseconds so documents stay plain JSON.

use std::time::Duration;

use http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::compression::{CodecRegistry, CompressionConfig, CompressionLevel};
use crate::error::{ConfigError, Status};

/// Flow-control windows are configured in multiples of this.
pub const WINDOW_SIZE_UNIT: u32 = 64 * 1024;

/// Default per-stream flow-control window (2 MiB).
pub const DEFAULT_STREAM_WINDOW: u32 = 32 * WINDOW_SIZE_UNIT;

/// Default per-connection flow-control window (4 MiB).
pub const DEFAULT_CONNECTION_WINDOW: u32 = 64 * WINDOW_SIZE_UNIT;

/// Message size limits.
///
/// ```rust
/// use grpcmw_core::MessageLimits;
///
/// // Unlimited by default
/// assert_eq!(MessageLimits::default().max_message_size(), None);
///
/// let limits = MessageLimits::new(500 * 1024 * 1024);
/// assert!(limits.check_size(1024).is_ok());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageLimits {
    max_message_size: Option<usize>,
}

impl MessageLimits {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: Some(max_message_size),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            max_message_size: None,
        }
    }

    pub fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    /// `ResourceExhausted` when `size` is over the limit.
    pub fn check_size(&self, size: usize) -> Result<(), Status> {
        if let Some(max) = self.max_message_size {
            if size > max {
                return Err(Status::resource_exhausted(format!(
                    "message size {} bytes exceeds maximum allowed size of {} bytes",
                    size, max
                )));
            }
        }
        Ok(())
    }
}

/// Server connection tuning, applied by the host's transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// `None` means unlimited.
    pub max_message_size: Option<usize>,
    pub initial_stream_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_concurrent_streams: u32,
    /// Minimum interval between client keepalive pings the server tolerates.
    pub min_ping_interval_ms: u64,
    /// Accept keepalive pings on connections without active streams.
    pub permit_without_stream: bool,
    /// Close connections idle for this long.
    pub idle_timeout_ms: u64,
    /// Upper bound on any call's deadline; the caller's `grpc-timeout` may
    /// only shorten it.
    pub server_timeout_ms: Option<u64>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_message_size: None,
            initial_stream_window_size: DEFAULT_STREAM_WINDOW,
            initial_connection_window_size: DEFAULT_CONNECTION_WINDOW,
            max_concurrent_streams: 1000,
            min_ping_interval_ms: 10_000,
            permit_without_stream: true,
            idle_timeout_ms: 300_000,
            server_timeout_ms: None,
        }
    }
}

impl ServerOptions {
    pub fn limits(&self) -> MessageLimits {
        MessageLimits {
            max_message_size: self.max_message_size,
        }
    }

    pub fn min_ping_interval(&self) -> Duration {
        Duration::from_millis(self.min_ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn server_timeout(&self) -> Option<Duration> {
        self.server_timeout_ms.map(Duration::from_millis)
    }
}

/// Client connection tuning, applied by the host's transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub max_message_size: Option<usize>,
    pub initial_stream_window_size: u32,
    pub initial_connection_window_size: u32,
    /// Interval between keepalive pings.
    pub keepalive_interval_ms: u64,
    /// How long to wait for a ping ack before closing the connection.
    pub keepalive_timeout_ms: u64,
    pub permit_without_stream: bool,
    pub connect_timeout_ms: u64,
    /// Deadline applied to calls whose context has none.
    pub default_timeout_ms: Option<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_message_size: None,
            initial_stream_window_size: DEFAULT_STREAM_WINDOW,
            initial_connection_window_size: DEFAULT_CONNECTION_WINDOW,
            keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 20_000,
            permit_without_stream: true,
            connect_timeout_ms: 10_000,
            default_timeout_ms: None,
        }
    }
}

impl ClientOptions {
    pub fn limits(&self) -> MessageLimits {
        MessageLimits {
            max_message_size: self.max_message_size,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Retry settings, turned into a retry policy by the client crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay, 0.0-1.0.
    pub jitter: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 1.6,
            jitter: 0.2,
            max_delay_ms: 120_000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::RetryPolicy("max_attempts must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::RetryPolicy("base_delay must not exceed max_delay"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::RetryPolicy("multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::RetryPolicy("jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Browser (gRPC-Web) admission settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    /// Allowed `Origin` values; empty allows every origin.
    pub allowed_origins: Vec<String>,
    /// Extra request headers browsers may send.
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
    /// Only admit preflights addressed to a registered method.
    pub registered_endpoints_only: bool,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_headers: Vec::new(),
            allow_credentials: true,
            max_age_secs: 600,
            registered_endpoints_only: false,
        }
    }
}

impl CorsSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for header in &self.allowed_headers {
            HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(header.clone()))?;
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// When false only identity is registered.
    pub enabled: bool,
    pub min_bytes: usize,
    pub level: CompressionLevel,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bytes: 0,
            level: CompressionLevel::Default,
        }
    }
}

impl CompressionSettings {
    pub fn config(&self) -> CompressionConfig {
        if self.enabled {
            CompressionConfig::new(self.min_bytes).level(self.level)
        } else {
            CompressionConfig::disabled()
        }
    }

    pub fn registry(&self) -> CodecRegistry {
        if self.enabled {
            CodecRegistry::with_config(self.config())
        } else {
            CodecRegistry::identity_only()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingSettings {
    /// Services never traced, on top of the tracer's own registry service.
    pub excluded_services: Vec<String>,
}

/// Everything the middleware is configured with.
///
/// ```
/// use grpcmw_core::MiddlewareConfig;
///
/// let config = MiddlewareConfig::from_json_str(r#"{
///     "retry": { "max_attempts": 5 },
///     "cors": { "registered_endpoints_only": true }
/// }"#).unwrap();
///
/// assert_eq!(config.retry.max_attempts, 5);
/// assert_eq!(config.retry.multiplier, 1.6);
/// assert!(config.cors.registered_endpoints_only);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub server: ServerOptions,
    pub client: ClientOptions,
    pub retry: RetryConfig,
    pub cors: CorsSettings,
    pub compression: CompressionSettings,
    pub tracing: TracingSettings,
}

impl MiddlewareConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.cors.validate()?;
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

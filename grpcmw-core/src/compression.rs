//! Compression negotiation.
//!
//! - [`CodecRegistry`]: name token to codec lookup, plus `grpc-accept-encoding` negotiation
//! - [`CompressionLevel`]: compression quality settings
//! - [`CompressionConfig`]: when and how hard to compress outgoing messages

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{BoxedCodec, Codec, DeflateCodec, IDENTITY, IdentityCodec, SnappyCodec};
use crate::error::Status;

/// Header naming the encoding of a message.
pub const GRPC_ENCODING: &str = "grpc-encoding";

/// Header listing the encodings a peer accepts.
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";

/// Compression level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Fastest compression (lowest ratio).
    Fastest,
    /// Best compression (highest ratio, slowest).
    Best,
    #[default]
    Default,
    /// Precise zlib level, clamped to 0-9.
    Precise(u32),
}

impl CompressionLevel {
    pub fn precise(level: u32) -> Self {
        CompressionLevel::Precise(level)
    }

    /// The zlib level (0-9) this setting maps onto.
    ///
    /// - `Fastest` → 1
    /// - `Best` → 9
    /// - `Default` → 6
    /// - `Precise(n)` → n clamped to 0-9
    pub fn zlib_level(&self) -> u32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Best => 9,
            CompressionLevel::Default => 6,
            CompressionLevel::Precise(n) => (*n).min(9),
        }
    }
}

/// Compression configuration.
///
/// Used to configure compression behavior for both client and server.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Messages smaller than this threshold are sent uncompressed.
    pub min_bytes: usize,
    pub level: CompressionLevel,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_bytes: 0,
            level: CompressionLevel::Default,
        }
    }
}

impl CompressionConfig {
    pub fn new(min_bytes: usize) -> Self {
        Self {
            min_bytes,
            level: CompressionLevel::Default,
        }
    }

    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Disable compression by setting threshold to usize::MAX.
    pub fn disabled() -> Self {
        Self {
            min_bytes: usize::MAX,
            level: CompressionLevel::Default,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.min_bytes == usize::MAX
    }

    /// Whether a message of `len` bytes should be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        !self.is_disabled() && len >= self.min_bytes
    }
}

/// Registered codecs, keyed by their name token.
///
/// The identity codec is always present. [`CodecRegistry::default`] also
/// registers deflate at the configured level and snappy.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: BTreeMap<&'static str, BoxedCodec>,
    /// Client preference order used when advertising.
    order: Vec<&'static str>,
    config: CompressionConfig,
}

impl CodecRegistry {
    /// A registry holding only identity.
    pub fn identity_only() -> Self {
        let mut registry = Self {
            codecs: BTreeMap::new(),
            order: Vec::new(),
            config: CompressionConfig::default(),
        };
        registry.register(IdentityCodec);
        registry
    }

    /// Identity, deflate at `config.level`, and snappy.
    pub fn with_config(config: CompressionConfig) -> Self {
        let mut registry = Self::identity_only();
        registry.config = config;
        registry
            .register(DeflateCodec::with_level(config.level.zlib_level()))
            .register(SnappyCodec::new());
        registry
    }

    /// Register a codec under its own name, replacing any previous one.
    pub fn register<C: Codec>(&mut self, codec: C) -> &mut Self {
        let name = codec.name();
        if self.codecs.insert(name, BoxedCodec::new(codec)).is_none() {
            self.order.push(name);
        }
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn get(&self, name: &str) -> Option<&BoxedCodec> {
        self.codecs.get(name)
    }

    /// Resolve a `grpc-encoding` header value.
    ///
    /// Absent, empty and `identity` resolve to `None` (no compression);
    /// unregistered tokens are rejected with `Unimplemented`.
    pub fn for_encoding(&self, header: Option<&str>) -> Result<Option<&BoxedCodec>, Status> {
        match header.map(str::trim) {
            None | Some("") | Some(IDENTITY) => Ok(None),
            Some(name) => self.get(name).map(Some).ok_or_else(|| {
                Status::unimplemented(format!(
                    "unsupported compression \"{name}\": supported encodings are {}",
                    self.accept_encoding()
                ))
            }),
        }
    }

    /// Pick the response codec from a `grpc-accept-encoding` list.
    ///
    /// The first registered token in client preference order wins; `q=0`
    /// entries are skipped. Falls back to identity.
    pub fn negotiate(&self, accept: Option<&str>) -> BoxedCodec {
        let identity = || BoxedCodec::new(IdentityCodec);
        let Some(accept) = accept else {
            return identity();
        };

        for token in accept.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            // Parse "deflate;q=0.5" into encoding="deflate", q_value=Some("0.5")
            let (encoding, q_value) = match token.split_once(';') {
                Some((enc, params)) => {
                    let q = params.split(';').find_map(|p| p.trim().strip_prefix("q="));
                    (enc.trim(), q)
                }
                None => (token, None),
            };

            if let Some(q) = q_value {
                if q.trim().parse::<f32>().is_ok_and(|q| q == 0.0) {
                    continue;
                }
            }

            if let Some(codec) = self.get(encoding) {
                return codec.clone();
            }
        }

        identity()
    }

    /// Comma-separated registered tokens, for advertising in
    /// `grpc-accept-encoding`. Identity is listed last.
    pub fn accept_encoding(&self) -> String {
        let mut names: Vec<&str> = self
            .order
            .iter()
            .copied()
            .filter(|name| *name != IDENTITY)
            .collect();
        names.push(IDENTITY);
        names.join(", ")
    }

    /// Compress an outgoing message with `codec`, honouring `min_bytes`.
    ///
    /// Returns the bytes to send and the encoding actually applied.
    pub fn encode(
        &self,
        codec: &BoxedCodec,
        message: Bytes,
    ) -> Result<(Bytes, &'static str), Status> {
        if codec.is_identity() || !self.config.should_compress(message.len()) {
            return Ok((message, IDENTITY));
        }
        Ok((codec.compress(&message)?, codec.name()))
    }

    /// Decompress an incoming message according to its `grpc-encoding`.
    pub fn decode(&self, header: Option<&str>, message: Bytes) -> Result<Bytes, Status> {
        match self.for_encoding(header)? {
            None => Ok(message),
            Some(codec) => Ok(codec.decompress(message)?),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_config(CompressionConfig::default())
    }
}

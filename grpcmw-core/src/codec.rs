//! Message compression codecs.
//!
//! - [`DeflateCodec`]: zlib-framed deflate with pooled writer/reader state
//! - [`SnappyCodec`]: snappy framing format with pooled writer/reader state
//! - [`IdentityCodec`]: pass-through
//!
//! Codec state is expensive to allocate, so the compressing codecs keep
//! their encoders and decoders in a [`Pool`] and rebind them to the caller's
//! stream on every use.

use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use std::io::{self, Cursor, Read, Write};
use std::mem;
use std::sync::Arc;

use crate::pool::Pool;

/// Per-message compression codec.
///
/// A codec owns both directions, so a registered name always resolves to a
/// symmetric compressor/decompressor pair.
///
/// # Example
///
/// ```ignore
/// use grpcmw_core::Codec;
/// use bytes::Bytes;
/// use std::io::{self, Write};
///
/// struct Lz4Codec;
///
/// impl Codec for Lz4Codec {
///     fn name(&self) -> &'static str { "lz4" }
///
///     fn compress_to(&self, sink: &mut dyn Write, data: &[u8]) -> io::Result<()> {
///         // ... lz4 compression
///     }
///
///     fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
///         // ... lz4 decompression
///     }
/// }
/// ```
pub trait Codec: Send + Sync + 'static {
    /// The token carried in `grpc-encoding` (e.g. "deflate").
    fn name(&self) -> &'static str;

    /// Compress `data` as one complete stream into `sink`.
    fn compress_to(&self, sink: &mut dyn Write, data: &[u8]) -> io::Result<()>;

    /// Decompress a complete stream.
    fn decompress(&self, data: Bytes) -> io::Result<Bytes>;

    /// Compress into a new buffer.
    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut out = Vec::new();
        self.compress_to(&mut out, data)?;
        Ok(Bytes::from(out))
    }
}

/// A boxed codec for type-erased storage.
///
/// Use `Option<BoxedCodec>` where `None` represents identity (no compression).
#[derive(Clone)]
pub struct BoxedCodec(Arc<dyn Codec>);

impl BoxedCodec {
    pub fn new<C: Codec>(codec: C) -> Self {
        BoxedCodec(Arc::new(codec))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn is_identity(&self) -> bool {
        self.name() == IDENTITY
    }

    pub fn compress_to(&self, sink: &mut dyn Write, data: &[u8]) -> io::Result<()> {
        self.0.compress_to(sink, data)
    }

    pub fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.compress(data)
    }

    pub fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        self.0.decompress(data)
    }
}

impl std::fmt::Debug for BoxedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedCodec").field(&self.name()).finish()
    }
}

/// Name token of the identity codec.
pub const IDENTITY: &str = "identity";

/// Name token of the deflate codec.
pub const DEFLATE: &str = "deflate";

/// Name token of the snappy codec.
pub const SNAPPY: &str = "snappy";

/// Identity codec (no compression).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn name(&self) -> &'static str {
        IDENTITY
    }

    fn compress_to(&self, sink: &mut dyn Write, data: &[u8]) -> io::Result<()> {
        sink.write_all(data)
    }

    fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        Ok(data)
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Deflate codec (zlib framing, RFC 1950) with pooled stream state.
///
/// Every encoder handed out by the pool is rebound to a fresh output buffer
/// before the first byte is written, and every decoder is rebound to the
/// caller's input before the first byte is read. Decoders are detached from
/// that input again before going back to the pool.
pub struct DeflateCodec {
    level: u32,
    writers: Pool<ZlibEncoder<Vec<u8>>>,
    readers: Pool<ZlibDecoder<Cursor<Bytes>>>,
}

impl DeflateCodec {
    /// Level ranges from 0 (no compression) to 9 (best compression).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
            writers: Pool::new(),
            readers: Pool::new(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Number of idle encoders and decoders.
    pub fn idle_states(&self) -> (usize, usize) {
        (self.writers.idle(), self.readers.idle())
    }

    fn new_writer(&self) -> ZlibEncoder<Vec<u8>> {
        ZlibEncoder::new(Vec::new(), Compression::new(self.level))
    }

    fn new_reader() -> ZlibDecoder<Cursor<Bytes>> {
        ZlibDecoder::new(Cursor::new(Bytes::new()))
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::with_level(6)
    }
}

impl std::fmt::Debug for DeflateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateCodec")
            .field("level", &self.level)
            .field("writers", &self.writers)
            .field("readers", &self.readers)
            .finish()
    }
}

impl Codec for DeflateCodec {
    fn name(&self) -> &'static str {
        DEFLATE
    }

    fn compress_to(&self, sink: &mut dyn Write, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writers.acquire(|| self.new_writer());
        // Discards whatever a previous, possibly aborted, use left behind.
        writer.reset(Vec::new())?;
        writer.write_all(data)?;
        writer.try_finish()?;
        let out = writer.reset(Vec::new())?;
        sink.write_all(&out)
    }

    fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        let mut reader = self.readers.acquire(Self::new_reader);
        reader.reset(Cursor::new(data));
        let mut out = Vec::new();
        let result = reader.read_to_end(&mut out);
        reader.reset(Cursor::new(Bytes::new()));
        result?;
        Ok(Bytes::from(out))
    }
}

/// Leading chunk of every snappy framed stream.
const SNAPPY_STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";

/// Snappy codec (framing format) with pooled stream state.
///
/// An encoder writes the stream identifier only once in its lifetime, so
/// output from a reused encoder gets the identifier prepended. A decoder
/// that failed mid-stream is dropped rather than returned to the pool.
#[derive(Default)]
pub struct SnappyCodec {
    writers: Pool<FrameEncoder<Vec<u8>>>,
    readers: Pool<FrameDecoder<Cursor<Bytes>>>,
}

impl SnappyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of idle encoders and decoders.
    pub fn idle_states(&self) -> (usize, usize) {
        (self.writers.idle(), self.readers.idle())
    }

    fn new_writer() -> FrameEncoder<Vec<u8>> {
        FrameEncoder::new(Vec::new())
    }

    fn new_reader() -> FrameDecoder<Cursor<Bytes>> {
        FrameDecoder::new(Cursor::new(Bytes::new()))
    }
}

impl std::fmt::Debug for SnappyCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnappyCodec")
            .field("writers", &self.writers)
            .field("readers", &self.readers)
            .finish()
    }
}

impl Codec for SnappyCodec {
    fn name(&self) -> &'static str {
        SNAPPY
    }

    fn compress_to(&self, sink: &mut dyn Write, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writers.acquire(Self::new_writer);
        // Drain anything an aborted use left buffered, then drop it.
        writer.flush()?;
        writer.get_mut().clear();
        writer.write_all(data)?;
        writer.flush()?;
        let out = mem::take(writer.get_mut());
        if !out.starts_with(SNAPPY_STREAM_IDENTIFIER) {
            sink.write_all(SNAPPY_STREAM_IDENTIFIER)?;
        }
        sink.write_all(&out)
    }

    fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        // Reused decoders have already seen an identifier; hold every
        // stream to what a fresh decoder requires.
        if !data.is_empty() && !data.starts_with(SNAPPY_STREAM_IDENTIFIER) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "snappy stream identifier missing",
            ));
        }
        let mut reader = self.readers.acquire(Self::new_reader);
        *reader.get_mut() = Cursor::new(data);
        let mut out = Vec::new();
        if let Err(err) = reader.read_to_end(&mut out) {
            reader.discard();
            return Err(err);
        }
        *reader.get_mut() = Cursor::new(Bytes::new());
        Ok(Bytes::from(out))
    }
}

/// Compress bytes using the specified codec.
///
/// If `codec` is `None`, returns the input unchanged (identity).
pub fn compress_bytes(bytes: Bytes, codec: Option<&BoxedCodec>) -> io::Result<Bytes> {
    match codec {
        None => Ok(bytes),
        Some(c) => c.compress(&bytes),
    }
}

/// Decompress bytes using the specified codec.
///
/// If `codec` is `None`, returns the input unchanged (identity).
pub fn decompress_bytes(bytes: Bytes, codec: Option<&BoxedCodec>) -> io::Result<Bytes> {
    match codec {
        None => Ok(bytes),
        Some(c) => c.decompress(bytes),
    }
}

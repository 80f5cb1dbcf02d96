//! Core types shared by the `grpcmw` server and `grpcmw-client` crates.
//!
//! ## Modules
//!
//! - [`error`]: status codes and error types
//! - [`pool`]: object pool for reusable codec state
//! - [`codec`]: compression codecs
//! - [`compression`]: codec registry and encoding negotiation
//! - [`descriptor`]: service descriptors
//! - [`context`]: per-call context (deadline, cancellation, span, attempt)
//! - [`interceptor`]: the interceptor model and the logging, metrics and tracing stages
//! - [`config`]: middleware configuration

pub mod codec;
pub mod compression;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod interceptor;
pub mod pool;

pub use codec::*;
pub use compression::*;
pub use config::*;
pub use context::*;
pub use descriptor::*;
pub use error::*;
pub use interceptor::*;
pub use pool::{Pool, PoolGuard};

//! Network-facing half of the pipeline: SSE framing, event ingestion,
//! reconnect policy, and the default HTTP transport adapter.

pub mod http;
pub mod ingest;
pub mod retry;
pub mod sse;

use futures_util::future::BoxFuture;
use rill_types::{ByteStream, PipelineResult, RequestPayload};

/// Standard User-Agent header for rill requests.
pub const USER_AGENT: &str = concat!("rill/", env!("CARGO_PKG_VERSION"));

/// Transport capability: opens one streaming request and returns its byte
/// stream. Chunks arrive in order; dropping the stream aborts the read.
pub trait StreamOpener: Send + Sync + 'static {
    fn open(&self, payload: RequestPayload) -> BoxFuture<'static, PipelineResult<ByteStream>>;
}

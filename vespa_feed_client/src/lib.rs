//! Client side of the document feed pipeline
//!
//! Documents are handed to a [`Dispatcher`], which keeps operations on the same
//! [`DocumentId`] strictly ordered while feeding different ids concurrently through a
//! [`Feeder`], usually the HTTP [`FeedClient`]. Every finalized operation produces an
//! [`OperationResult`], which is folded into [`Stats`] and can be observed by a
//! [`Throttler`] and a [`CircuitBreaker`] to decide how fast to keep feeding.

mod circuit_breaker;
mod client;
mod dispatcher;
mod result;
mod stats;
mod throttler;
mod transport;

use reqwest::Method;
use vespa_feed_document::DocumentId;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{ClientOptions, Compression, FeedClient};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Feeder, MAX_ATTEMPTS};
pub use result::{OperationResult, Status};
pub use stats::{Stats, StatsCollector};
pub use throttler::Throttler;
pub use transport::{
    Authenticator, BearerToken, PreparedRequest, ReqwestTransport, Transport, TransportResponse,
};

/// Primary error type for the feed client
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dispatcher is closed")]
    DispatcherClosed,

    #[error("base URL error: {0}")]
    BaseUrl(#[source] url::ParseError),

    #[error("request URL error for {url}: {source}")]
    RequestUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("at least one connection is required")]
    NoConnections,

    #[error("feed client must be created within a tokio runtime: {0}")]
    Runtime(#[source] tokio::runtime::TryCurrentError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to compress request body: {0}")]
    Compression(#[source] std::io::Error),

    #[error("failed to authenticate request: {0}")]
    Authentication(String),

    #[error("request preparation pipeline has shut down")]
    PipelineClosed,

    #[error("failed to send {method} {url} request: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to read the response bytes: {0}")]
    ResponseBody(#[source] reqwest::Error),

    #[error("failed to decompress response body: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("decompressed response body exceeds {max_size} bytes")]
    ResponseTooLarge { max_size: u64 },

    #[error("failed to decode JSON response: {0}")]
    DecodeResponse(#[source] serde_json::Error),

    #[error("not sent, an earlier operation on {id} failed")]
    GroupFailed { id: DocumentId },

    #[error("dispatcher worker failed: {0}")]
    Worker(#[source] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn transport(
        method: Method,
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            method,
            url: url.into(),
            source: source.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

use std::{
    fmt::{Display, Write as _},
    io::{Read, Write},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Method,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;
use urlencoding::encode;
use vespa_feed_document::{Document, Location, Operation};
use vespa_feed_time::{SystemProvider, TimeProvider};

use crate::{
    Authenticator, Error, Feeder, OperationResult, PreparedRequest, ReqwestTransport, Result,
    Status, Transport, TransportResponse,
};

/// Client-side timeout used when no operation timeout is configured
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(190);

/// Bodies larger than this are compressed under [`Compression::Auto`]
const AUTO_COMPRESSION_THRESHOLD: usize = 512;

/// Upper bound on the size of a decompressed response body
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// Request body compression policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Compress bodies larger than 512 bytes
    #[default]
    Auto,
    /// Never compress
    None,
    /// Compress every non-empty body
    Gzip,
}

impl Compression {
    fn should_compress(self, len: usize) -> bool {
        match self {
            Self::Auto => len > AUTO_COMPRESSION_THRESHOLD,
            Self::None => false,
            Self::Gzip => len > 0,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            _ => Err(format!(
                "unrecognized compression '{s}', expected one of: auto, none, gzip"
            )),
        }
    }
}

/// Options applied to every request a [`FeedClient`] sends
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server-side operation timeout, also used to derive the client-side timeout
    pub timeout: Option<Duration>,
    pub route: Option<String>,
    /// Server-side trace level, `0` disables tracing
    pub trace_level: u8,
    /// Ask the server to accept operations without applying them
    pub speedtest: bool,
    pub compression: Compression,
    /// Extra headers sent with every request
    pub headers: HeaderMap,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Number of tasks encoding and compressing requests
    pub preparers: usize,
    /// Capacity of the queue of requests waiting for a preparer
    pub queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            route: None,
            trace_level: 0,
            speedtest: false,
            compression: Compression::Auto,
            headers: HeaderMap::new(),
            authenticator: None,
            preparers: num_cpus::get(),
            queue_capacity: 4096,
        }
    }
}

/// Sends documents to the `/document/v1` API over a fixed pool of connections
///
/// Each send goes to the connection with the fewest outstanding requests. Encoding and
/// compression happen on a set of preparer tasks, so a caller only waits for its own
/// request to be ready. Preparers exit once the client is dropped.
#[derive(Debug)]
pub struct FeedClient {
    connections: Vec<Connection>,
    next_connection: AtomicUsize,
    pending: mpsc::Sender<PendingRequest>,
    client_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

#[derive(Debug)]
struct Connection {
    index: usize,
    transport: Arc<dyn Transport>,
    inflight: AtomicI64,
}

/// Marks one request outstanding on a [`Connection`] until dropped
#[derive(Debug)]
struct ConnectionGuard<'a> {
    connection: &'a Connection,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.connection.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct PendingRequest {
    document: Document,
    response: oneshot::Sender<Result<PreparedRequest>>,
}

impl FeedClient {
    /// Create a client sending to `base_url` through the given connections
    ///
    /// Must be called from within a tokio runtime, which runs the preparer tasks.
    pub fn new(
        base_url: &str,
        transports: Vec<Arc<dyn Transport>>,
        options: ClientOptions,
    ) -> Result<Self> {
        if transports.is_empty() {
            return Err(Error::NoConnections);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(Error::Runtime)?;

        let base_url = parse_base_url(base_url)?;

        let client_timeout = options
            .timeout
            .map(|t| t * 11 / 10 + Duration::from_secs(1))
            .unwrap_or(DEFAULT_CLIENT_TIMEOUT);
        let preparers = options.preparers.max(1);
        let (pending, queue) = mpsc::channel(options.queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(queue));
        let factory = Arc::new(RequestFactory { base_url, options });
        for _ in 0..preparers {
            runtime.spawn(prepare_requests(Arc::clone(&factory), Arc::clone(&queue)));
        }

        let connections = transports
            .into_iter()
            .enumerate()
            .map(|(index, transport)| Connection {
                index,
                transport,
                inflight: AtomicI64::new(0),
            })
            .collect();

        Ok(Self {
            connections,
            next_connection: AtomicUsize::new(0),
            pending,
            client_timeout,
            time_provider: Arc::new(SystemProvider::new()),
        })
    }

    /// Create a client with `connections` independent HTTP connections to `base_url`
    pub fn connect(base_url: &str, connections: usize, options: ClientOptions) -> Result<Self> {
        let transports = (0..connections.max(1))
            .map(|_| ReqwestTransport::new().map(|t| Arc::new(t) as Arc<dyn Transport>))
            .collect::<Result<Vec<_>>>()?;
        Self::new(base_url, transports, options)
    }

    /// Measure latencies with the given clock
    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Timeout applied to each request on the client side
    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    /// Send one document, classifying the outcome
    ///
    /// Never fails outright: errors are carried in [`OperationResult::error`].
    pub async fn send(&self, document: &Document) -> OperationResult {
        let start = self.time_provider.now();
        let mut result = OperationResult::new(document.id().clone());

        match self.prepare(document).await {
            Ok(request) => {
                result.bytes_sent = request.body.len() as u64;
                let method = request.method.clone();
                let url = request.url.to_string();
                let connection = self.least_busy_connection();
                match connection
                    .connection
                    .transport
                    .execute(request, self.client_timeout)
                    .await
                {
                    Ok(response) => result = classify(result, response),
                    Err(e) => {
                        warn!(
                            %method,
                            %url,
                            connection = connection.connection.index,
                            error = %e,
                            "failed to send operation"
                        );
                        result = result.with_error(e);
                    }
                }
            }
            Err(e) => {
                warn!(id = %document.id(), error = %e, "failed to prepare request");
                result = result.with_error(e);
            }
        }

        result.latency = self.time_provider.now().saturating_duration_since(start);
        debug!(
            id = %result.id,
            status = %result.status,
            http_status = result.http_status,
            latency = ?result.latency,
            "operation completed"
        );
        result
    }

    async fn prepare(&self, document: &Document) -> Result<PreparedRequest> {
        let (response, prepared) = oneshot::channel();
        self.pending
            .send(PendingRequest {
                document: document.clone(),
                response,
            })
            .await
            .map_err(|_| Error::PipelineClosed)?;
        prepared.await.map_err(|_| Error::PipelineClosed)?
    }

    /// Pick the connection with the fewest outstanding requests, scanning from a rotating
    /// offset so ties are spread round-robin
    fn least_busy_connection(&self) -> ConnectionGuard<'_> {
        let n = self.connections.len();
        let start = self.next_connection.fetch_add(1, Ordering::Relaxed) % n;
        let mut best = &self.connections[start];
        let mut min = best.inflight.load(Ordering::SeqCst);
        for i in 1..n {
            let candidate = &self.connections[(start + i) % n];
            let inflight = candidate.inflight.load(Ordering::SeqCst);
            if inflight < min {
                best = candidate;
                min = inflight;
            }
        }
        best.inflight.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { connection: best }
    }
}

#[async_trait]
impl Feeder for FeedClient {
    async fn send(&self, document: &Document) -> OperationResult {
        Self::send(self, document).await
    }
}

/// Parse `base_url`, making sure relative paths are resolved below its path
fn parse_base_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(Error::BaseUrl)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

async fn prepare_requests(
    factory: Arc<RequestFactory>,
    queue: Arc<Mutex<mpsc::Receiver<PendingRequest>>>,
) {
    loop {
        let pending = queue.lock().await.recv().await;
        let Some(PendingRequest { document, response }) = pending else {
            break;
        };
        // the caller may have given up waiting
        let _ = response.send(factory.prepare(&document));
    }
}

/// Turns documents into [`PreparedRequest`]s
#[derive(Debug)]
struct RequestFactory {
    base_url: Url,
    options: ClientOptions,
}

impl RequestFactory {
    fn method_and_url(&self, document: &Document) -> Result<(Method, Url)> {
        let method = match document.operation() {
            Operation::Put => Method::POST,
            Operation::Update => Method::PUT,
            Operation::Remove => Method::DELETE,
        };

        let id = document.id();
        let mut path = format!(
            "document/v1/{}/{}/",
            encode(id.namespace()),
            encode(id.doc_type())
        );
        // writing to a String is infallible
        let _ = match id.location() {
            Some(Location::Number(n)) => write!(path, "number/{n}/"),
            Some(Location::Group(g)) => write!(path, "group/{}/", encode(g)),
            None => write!(path, "docid/"),
        };
        path.push_str(&encode(id.user_specific()));

        let mut url = self
            .base_url
            .join(&path)
            .map_err(|source| Error::RequestUrl { url: path, source })?;

        let options = &self.options;
        let mut query = Vec::new();
        if let Some(timeout) = options.timeout {
            query.push(("timeout", format!("{}ms", timeout.as_millis())));
        }
        if let Some(route) = &options.route {
            query.push(("route", route.clone()));
        }
        if options.trace_level > 0 {
            query.push(("tracelevel", options.trace_level.to_string()));
        }
        if options.speedtest {
            query.push(("dryRun", "true".to_string()));
        }
        if let Some(condition) = document.condition() {
            query.push(("condition", condition.to_string()));
        }
        if document.create() {
            query.push(("create", "true".to_string()));
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        Ok((method, url))
    }

    fn prepare(&self, document: &Document) -> Result<PreparedRequest> {
        let (method, url) = self.method_and_url(document)?;

        let mut headers = self.options.headers.clone();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let body = document.body();
        let body = if self.options.compression.should_compress(body.len()) {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            gzip(body)?
        } else {
            body.clone()
        };

        let mut request = PreparedRequest {
            method,
            url,
            headers,
            body,
        };
        if let Some(authenticator) = &self.options.authenticator {
            authenticator.authenticate(&mut request)?;
        }
        Ok(request)
    }
}

fn gzip(body: &[u8]) -> Result<Bytes> {
    let mut encoder = flate2::write::GzEncoder::new(
        Vec::with_capacity(body.len() / 2),
        flate2::Compression::fast(),
    );
    encoder.write_all(body).map_err(Error::Compression)?;
    let compressed = encoder.finish().map_err(Error::Compression)?;
    Ok(compressed.into())
}

fn gunzip(body: &[u8]) -> Result<Bytes> {
    // read one byte past the limit to tell a full body from a decompression bomb
    let mut decoder = flate2::read::GzDecoder::new(body).take(MAX_RESPONSE_SIZE + 1);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(Error::Decompression)?;
    if decoded.len() as u64 > MAX_RESPONSE_SIZE {
        return Err(Error::ResponseTooLarge {
            max_size: MAX_RESPONSE_SIZE,
        });
    }
    Ok(decoded.into())
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    trace: Option<Box<RawValue>>,
}

/// Fill in `result` from the HTTP response to its operation
fn classify(mut result: OperationResult, response: TransportResponse) -> OperationResult {
    result.http_status = response.status;
    result.status = match response.status {
        200 => Status::Success,
        412 => Status::ConditionNotMet,
        502 | 504 | 507 => Status::VespaFailure,
        _ => Status::TransportFailure,
    };
    result.bytes_recv = response.body.len() as u64;

    let gzipped = response
        .headers
        .get(CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));
    let body = if gzipped {
        match gunzip(&response.body) {
            Ok(body) => body,
            Err(e) => return result.with_error(e),
        }
    } else {
        response.body
    };

    // some proxies answer without a body
    if body.iter().all(u8::is_ascii_whitespace) {
        return result;
    }
    match serde_json::from_slice::<ResponseBody>(&body) {
        Ok(ResponseBody { message, trace }) => {
            result.message = message;
            if let Some(trace) = trace {
                result.trace = trace.get().to_string();
            }
            result
        }
        Err(e) => result.with_error(Error::DecodeResponse(e)),
    }
}

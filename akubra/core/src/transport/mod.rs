//! Replicating Fan-Out Transport
//!
//! Infrastructure for duplicating one inbound HTTP request to many storage
//! backends concurrently and reducing their responses to a single answer.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   RoundTrip      |  <-- Capability implemented by every transport variant
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  MultiTransport  |  <-- One dispatch task per backend, ceiling enforced
//! +--------+---------+
//!          |
//!    +-----+-----+
//!    |     |     |
//!    v     v     v
//! +----+ +----+ +----+
//! | b1 | | b2 | | b3 |  <-- Backend dispatches, bodies from the multiplexer
//! +----+ +----+ +----+
//!          |
//!          v
//! +------------------+
//! |  PickResponse    |  <-- Reduces result tuples, records divergence
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **No body buffering**: the client body is split by [`multiplex`] with
//!    one chunk of look-ahead per backend; the slowest backend paces the
//!    upload.
//! 2. **Per-tuple failure**: one backend failing never fails the round trip
//!    as long as another backend produced a usable response.
//! 3. **Bounded resources**: dial and read deadlines per backend, plus a
//!    process-wide in-flight ceiling with per-round eviction.

pub mod counter;
pub mod multi;
pub mod multiplex;
pub mod selector;
pub mod timeout;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

pub use counter::{ConnectionCounter, InFlightGuard};
pub use multi::{MultiTransport, SharedTransport};
pub use multiplex::{split_body, BodyIntegrity, BranchBody};
pub use selector::{FirstSuccessPicker, PickResponse};
pub use timeout::TimeoutBody;

/// Boxed stream of body chunks, used for both request and response bodies.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

// ============================================================================
// Request / Response
// ============================================================================

/// An inbound request in transit through the proxy.
///
/// The body is a stream that can be consumed exactly once; replication is
/// the job of the body multiplexer, not of this type.
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// URL path, e.g. `/bucket/key`. The routing hash key.
    pub path: String,
    /// Query string without the leading `?`, forwarded as-is.
    pub query: Option<String>,
    /// Client headers, forwarded verbatim apart from hop-by-hop fields.
    pub headers: HeaderMap,
    /// Streaming body, if the request carries one.
    pub body: Option<ByteStream>,
    /// `Content-Length` declared by the client, if any.
    pub content_length: Option<u64>,
}

impl ProxyRequest {
    /// Create a body-less request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: None,
            content_length: None,
        }
    }

    /// Attach a query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Attach headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a streaming body and its declared length.
    #[must_use]
    pub fn with_body(mut self, body: ByteStream, content_length: Option<u64>) -> Self {
        self.body = Some(body);
        self.content_length = content_length;
        self
    }

    /// Clone method, path and headers into a body-less retry request.
    ///
    /// A consumed streaming body cannot be replayed, so regression retries
    /// are reissued without one.
    #[must_use]
    pub fn retry_template(&self) -> ProxyRequest {
        ProxyRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: None,
            content_length: None,
        }
    }

    /// Path plus query string, the form sent to backends.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }
}

/// The response chosen for the client.
pub struct ProxyResponse {
    /// Status code of the chosen backend response.
    pub status: StatusCode,
    /// Headers of the chosen backend response.
    pub headers: HeaderMap,
    /// Streaming body, already wrapped with the read deadline.
    pub body: ByteStream,
    /// The backend that produced the response, when one did.
    pub backend: Option<Url>,
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .field("backend", &self.backend)
            .finish()
    }
}

/// A single backend's reply before selection.
pub struct BackendReply {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body stream.
    pub body: ByteStream,
}

/// The unit of work between dispatch and selection: one result per backend.
///
/// `result` carries either the reply or the error, never both.
pub struct BackendResult {
    /// The backend this result came from.
    pub backend: Url,
    /// Method of the dispatched request.
    pub method: Method,
    /// Path of the dispatched request.
    pub path: String,
    /// Reply or transport error.
    pub result: Result<BackendReply, TransportError>,
}

impl BackendResult {
    /// A result is a success when the backend replied with status < 400.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(reply) if reply.status.as_u16() < 400)
    }

    /// Short description of the outcome for divergence records.
    #[must_use]
    pub fn outcome(&self) -> String {
        match &self.result {
            Ok(reply) => reply.status.as_u16().to_string(),
            Err(e) => e.to_string(),
        }
    }
}

// ============================================================================
// Round-trip capability
// ============================================================================

/// Capability of sending one request and producing one response.
///
/// Implemented by [`MultiTransport`] (backend fan-out), by clusters and by
/// the sharding ring, so callers never need to know which variant they hold.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    /// Forward `request` and reduce the outcome to a single response.
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyResponse, TransportError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Per-dispatch transport errors.
///
/// Clonable so a single failure can be attached to many result tuples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// No chunk arrived within the configured inactivity deadline.
    Timeout,
    /// Declared and delivered body byte counts disagree.
    ContentLengthMismatch {
        /// Bytes announced in `Content-Length`.
        declared: u64,
        /// Bytes actually produced by the body.
        delivered: u64,
    },
    /// Backend skipped in this round because the connection ceiling was hit.
    Throttled {
        /// The evicted backend.
        backend: String,
    },
    /// Every body consumer went away before the upload finished.
    BrokenPipe,
    /// Dial or request transmission failure.
    Connect(String),
    /// Failure while streaming a body.
    Body(String),
    /// The transport has no backend to dispatch to.
    NoBackends,
    /// Request could not be mapped to a cluster.
    Routing(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "read timed out"),
            Self::ContentLengthMismatch {
                declared,
                delivered,
            } => write!(
                f,
                "body length mismatch: declared {declared} bytes, delivered {delivered}"
            ),
            Self::Throttled { backend } => {
                write!(f, "backend {backend} throttled by connection ceiling")
            }
            Self::BrokenPipe => write!(f, "all body readers closed"),
            Self::Connect(e) => write!(f, "connection error: {e}"),
            Self::Body(e) => write!(f, "body error: {e}"),
            Self::NoBackends => write!(f, "no backends available"),
            Self::Routing(e) => write!(f, "routing error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

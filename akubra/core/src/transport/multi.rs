//! Backend Fan-Out Transport
//!
//! [`MultiTransport`] sends one request to every backend of its set in
//! parallel and hands the per-backend result tuples to the selection policy.
//! The underlying [`SharedTransport`] (HTTP client, connection counter,
//! deadlines, header additions) is built once at startup and shared by every
//! fan-out instance, so connection pooling and the in-flight ceiling are
//! process-wide.
//!
//! # Guarantees
//!
//! - every backend of the set receives exactly one request with the same
//!   method, path and sanitised headers, or is explicitly evicted by the
//!   connection ceiling with a throttled tuple,
//! - a declared `Content-Length` is forwarded and enforced by the body
//!   multiplexer,
//! - the call returns as soon as the selector decided; losing responses
//!   keep draining in the background.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName};
use http::Method;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::config::{Config, ConfigError};

use super::counter::ConnectionCounter;
use super::multiplex::{split_body, BodyIntegrity, BranchBody};
use super::selector::PickResponse;
use super::timeout::TimeoutBody;
use super::{BackendReply, BackendResult, ProxyRequest, ProxyResponse, RoundTrip, TransportError};

// ============================================================================
// Shared HTTP core
// ============================================================================

/// Process-wide HTTP machinery shared by every [`MultiTransport`].
pub struct SharedTransport {
    client: reqwest::Client,
    counter: Arc<ConnectionCounter>,
    conn_limit: i64,
    response_timeout: Duration,
    extra_request_headers: HeaderMap,
}

impl SharedTransport {
    /// Assemble the shared core from explicit parts.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        conn_limit: i64,
        response_timeout: Duration,
        extra_request_headers: HeaderMap,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            counter: Arc::new(ConnectionCounter::new()),
            conn_limit,
            response_timeout,
            extra_request_headers,
        })
    }

    /// Build the shared core from configuration.
    ///
    /// The client never follows redirects: backends answer for themselves.
    pub fn from_config(config: &Config) -> Result<Arc<Self>, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connection_dial_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::Validation(format!("cannot build http client: {e}")))?;

        Ok(Self::new(
            client,
            config.conn_limit,
            config.connection_timeout,
            config.request_header_additions()?,
        ))
    }

    /// The process-wide in-flight counter.
    #[must_use]
    pub fn counter(&self) -> Arc<ConnectionCounter> {
        Arc::clone(&self.counter)
    }
}

// ============================================================================
// Multi-transport
// ============================================================================

/// Fan-out transport over a fixed backend set.
pub struct MultiTransport {
    label: String,
    backends: Vec<Url>,
    picker: Arc<dyn PickResponse>,
    shared: Arc<SharedTransport>,
}

impl MultiTransport {
    /// Create a fan-out transport.
    ///
    /// `label` names the transport in logs and divergence records, usually
    /// the owning cluster.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        backends: Vec<Url>,
        picker: Arc<dyn PickResponse>,
        shared: Arc<SharedTransport>,
    ) -> Self {
        Self {
            label: label.into(),
            backends,
            picker,
            shared,
        }
    }

    /// The backend set this transport dispatches to.
    #[must_use]
    pub fn backends(&self) -> &[Url] {
        &self.backends
    }

    /// Evict the busiest backend from this round when the ceiling is hit.
    fn apply_ceiling(&self, targets: &mut Vec<Url>) -> Option<Url> {
        let limit = self.shared.conn_limit;
        if limit <= 0 {
            return None;
        }
        let projected = self.shared.counter.total() + targets.len() as i64;
        if projected <= limit {
            return None;
        }
        let victim = self.shared.counter.busiest(targets.iter())?;
        warn!(
            transport = %self.label,
            backend = %victim,
            in_flight = self.shared.counter.in_flight(&victim),
            limit,
            "connection ceiling hit, skipping busiest backend this round"
        );
        targets.retain(|url| *url != victim);
        Some(victim)
    }
}

#[async_trait]
impl RoundTrip for MultiTransport {
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        let target = request.path_and_query();
        let ProxyRequest {
            method,
            path,
            headers,
            body,
            content_length,
            ..
        } = request;

        let mut targets = self.backends.clone();
        if targets.is_empty() {
            return Err(TransportError::NoBackends);
        }
        let evicted = self.apply_ceiling(&mut targets);

        let headers = sanitize_headers(&headers, &self.shared.extra_request_headers);

        let (branches, integrity) = match body {
            Some(stream) if !targets.is_empty() => {
                // The pump runs detached; its failures (length mismatch,
                // broken pipe) reach the tuples through the integrity slot.
                let (branches, integrity, _pump) =
                    split_body(stream, targets.len(), content_length);
                (branches.into_iter().map(Some).collect(), Some(integrity))
            }
            _ => (vec_of_none(targets.len()), None),
        };

        let capacity = (targets.len() + usize::from(evicted.is_some())).max(1);
        let (results_tx, results_rx) = mpsc::channel(capacity);

        if let Some(victim) = evicted {
            let throttled = BackendResult {
                backend: victim.clone(),
                method: method.clone(),
                path: path.clone(),
                result: Err(TransportError::Throttled {
                    backend: victim.to_string(),
                }),
            };
            let _ = results_tx.send(throttled).await;
        }

        for (backend, branch) in targets.into_iter().zip(branches) {
            tokio::spawn(dispatch(DispatchJob {
                client: self.shared.client.clone(),
                counter: self.shared.counter(),
                backend,
                method: method.clone(),
                path: path.clone(),
                target: target.clone(),
                headers: headers.clone(),
                branch,
                content_length,
                integrity: integrity.clone(),
                read_timeout: self.shared.response_timeout,
                results: results_tx.clone(),
            }));
        }
        drop(results_tx);

        let chosen = self
            .picker
            .pick(results_rx)
            .await
            .ok_or(TransportError::NoBackends)?;

        match chosen.result {
            Ok(reply) => Ok(ProxyResponse {
                status: reply.status,
                headers: reply.headers,
                body: reply.body,
                backend: Some(chosen.backend),
            }),
            Err(e) => Err(e),
        }
    }
}

fn vec_of_none(len: usize) -> Vec<Option<BranchBody>> {
    (0..len).map(|_| None).collect()
}

// ============================================================================
// Per-backend dispatch
// ============================================================================

struct DispatchJob {
    client: reqwest::Client,
    counter: Arc<ConnectionCounter>,
    backend: Url,
    method: Method,
    /// Plain path, the identity carried by the result tuple.
    path: String,
    /// Path plus query string, joined onto the backend URL.
    target: String,
    headers: HeaderMap,
    branch: Option<BranchBody>,
    content_length: Option<u64>,
    integrity: Option<BodyIntegrity>,
    read_timeout: Duration,
    results: mpsc::Sender<BackendResult>,
}

async fn dispatch(job: DispatchJob) {
    let DispatchJob {
        client,
        counter,
        backend,
        method,
        path,
        target,
        headers,
        branch,
        content_length,
        integrity,
        read_timeout,
        results,
    } = job;

    // A dropped receiver means the caller is gone; abandoning the send
    // drops the in-flight request, closes the body branch and releases
    // the counter guard.
    let mut result = tokio::select! {
        result = send_once(
            &client,
            &counter,
            &backend,
            method.clone(),
            &target,
            headers,
            branch,
            content_length,
            read_timeout,
        ) => result,
        () = results.closed() => return,
    };

    // A body integrity violation is the authoritative cause for this
    // round's failures. A length mismatch additionally taints tuples whose
    // backend still managed to reply; a broken pipe does not, since the
    // backend that answered without the full body is not at fault.
    if let Some(violation) = integrity.as_ref().and_then(BodyIntegrity::violation) {
        let taints_success = matches!(violation, TransportError::ContentLengthMismatch { .. });
        if result.is_err() || taints_success {
            result = Err(violation);
        }
    }

    let _ = results
        .send(BackendResult {
            backend,
            method,
            path,
            result,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn send_once(
    client: &reqwest::Client,
    counter: &Arc<ConnectionCounter>,
    backend: &Url,
    method: Method,
    target: &str,
    headers: HeaderMap,
    branch: Option<BranchBody>,
    content_length: Option<u64>,
    read_timeout: Duration,
) -> Result<BackendReply, TransportError> {
    let url = backend
        .join(target)
        .map_err(|e| TransportError::Connect(format!("invalid backend url: {e}")))?;

    let guard = counter.track(backend);

    let mut builder = client.request(method, url).headers(headers);
    if let Some(len) = content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    if let Some(branch) = branch {
        builder = builder.body(reqwest::Body::wrap_stream(branch));
    }

    let response = builder.send().await;
    drop(guard);

    match response {
        Ok(resp) => {
            let status = resp.status();
            let headers = resp.headers().clone();
            let raw = resp
                .bytes_stream()
                .map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout
                    } else {
                        TransportError::Body(e.to_string())
                    }
                })
                .boxed();
            Ok(BackendReply {
                status,
                headers,
                body: TimeoutBody::new(raw, read_timeout).boxed(),
            })
        }
        Err(e) if e.is_timeout() => Err(TransportError::Timeout),
        Err(e) if e.is_connect() => Err(TransportError::Connect(e.to_string())),
        Err(e) => Err(TransportError::Body(e.to_string())),
    }
}

// ============================================================================
// Header handling
// ============================================================================

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Drop hop-by-hop fields plus `Host` and `Content-Length`, then apply the
/// configured additions. `Host` is rewritten by the client from the backend
/// URL; `Content-Length` is set per dispatch from the declared value.
fn sanitize_headers(headers: &HeaderMap, additions: &HeaderMap) -> HeaderMap {
    let mut sanitized = headers.clone();
    sanitized.remove(header::HOST);
    sanitized.remove(header::CONTENT_LENGTH);
    for name in &HOP_BY_HOP {
        sanitized.remove(name);
    }
    sanitized.remove(HeaderName::from_static("keep-alive"));
    for (name, value) in additions {
        sanitized.insert(name.clone(), value.clone());
    }
    sanitized
}

// ============================================================================
// Tests
// ============================================================================

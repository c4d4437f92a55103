//! Black-box tests of the fan-out transport against live HTTP doubles.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::{stream, StreamExt};
use http::{Method, StatusCode};
use url::Url;

use akubra_core::{
    Config, FirstSuccessPicker, MultiTransport, ProxyRequest, ProxyResponse, RoundTrip,
    SharedTransport, SyncReporter, TransportError,
};

// ============================================================================
// Backend doubles
// ============================================================================

#[derive(Clone)]
struct Backend {
    status: StatusCode,
    body: &'static str,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl Backend {
    fn new(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            body,
            hits: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

async fn backend_handler(State(backend): State<Backend>, request: Request) -> Response {
    let bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    *backend.received.lock().unwrap() = bytes.to_vec();
    backend.hits.fetch_add(1, Ordering::SeqCst);
    (backend.status, backend.body).into_response()
}

async fn serve(backend: Backend) -> Url {
    serve_with(Router::new().fallback(backend_handler).with_state(backend)).await
}

async fn serve_with(app: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

// ============================================================================
// Transport helpers
// ============================================================================

fn multi(
    config: &Config,
    backends: Vec<Url>,
    reporter: SyncReporter,
) -> (MultiTransport, Arc<SharedTransport>) {
    let shared = SharedTransport::from_config(config).unwrap();
    let picker = Arc::new(FirstSuccessPicker::new(
        "cluster1",
        config.sync_methods().unwrap(),
        reporter,
    ));
    let transport = MultiTransport::new("cluster1", backends, picker, Arc::clone(&shared));
    (transport, shared)
}

fn streamed(payload: &'static str) -> akubra_core::ByteStream {
    let chunks: Vec<Result<Bytes, TransportError>> = payload
        .as_bytes()
        .chunks(5)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

async fn read_body(mut response: ProxyResponse) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::new();
    while let Some(chunk) = response.body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn request_is_replicated_to_every_backend() {
    let payload = "zażółć gęślą jaźń";
    let backends: Vec<Backend> = (0..3)
        .map(|_| Backend::new(StatusCode::OK, "stored"))
        .collect();
    let mut urls = Vec::new();
    for backend in &backends {
        urls.push(serve(backend.clone()).await);
    }

    let (transport, shared) = multi(&Config::default(), urls, SyncReporter::disabled());
    let request = ProxyRequest::new(Method::POST, "/index").with_body(
        streamed(payload),
        Some(payload.len() as u64),
    );

    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(read_body(response).await.unwrap(), b"stored");

    // Wait for the losing dispatches to finish reporting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for backend in &backends {
        assert_eq!(backend.hits(), 1, "backend hit count");
        assert_eq!(backend.received(), payload.as_bytes());
    }
    assert_eq!(shared.counter().total(), 0);
}

#[tokio::test]
async fn content_length_mismatch_fails_the_round_trip() {
    let payload = "some text";
    let backends: Vec<Backend> = (0..2)
        .map(|_| Backend::new(StatusCode::OK, "stored"))
        .collect();
    let mut urls = Vec::new();
    for backend in &backends {
        urls.push(serve(backend.clone()).await);
    }

    let (transport, _shared) = multi(&Config::default(), urls, SyncReporter::disabled());
    let request = ProxyRequest::new(Method::POST, "/index").with_body(
        streamed(payload),
        Some(payload.len() as u64 + 1),
    );

    let err = transport.round_trip(request).await.unwrap_err();
    assert!(
        matches!(err, TransportError::ContentLengthMismatch { declared: 10, delivered: 9 }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn first_usable_response_wins() {
    let failing = Backend::new(StatusCode::INTERNAL_SERVER_ERROR, "broken");
    let healthy = Backend::new(StatusCode::OK, "fine");
    let urls = vec![serve(failing.clone()).await, serve(healthy.clone()).await];

    let (transport, _shared) = multi(&Config::default(), urls, SyncReporter::disabled());
    let response = transport
        .round_trip(ProxyRequest::new(Method::GET, "/index/a"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(read_body(response).await.unwrap(), b"fine");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failing.hits(), 1);
    assert_eq!(healthy.hits(), 1);
}

#[tokio::test]
async fn connection_ceiling_skips_one_backend() {
    let backends: Vec<Backend> = (0..2)
        .map(|_| Backend::new(StatusCode::OK, "ok"))
        .collect();
    let mut urls = Vec::new();
    for backend in &backends {
        urls.push(serve(backend.clone()).await);
    }

    let mut config = Config::default();
    config.conn_limit = 1;
    let (reporter, mut sync_rx) = SyncReporter::new();
    let (transport, shared) = multi(&config, urls, reporter);

    let response = transport
        .round_trip(ProxyRequest::new(Method::PUT, "/index/a"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let total_hits: usize = backends.iter().map(Backend::hits).sum();
    assert_eq!(total_hits, 1, "evicted backend must not be dispatched");
    assert_eq!(shared.counter().total(), 0);

    // The throttled tuple diverges from the winning PUT and is recorded.
    let record = sync_rx.recv().await.unwrap();
    assert!(record.error.as_deref().unwrap_or_default().contains("throttled"));
}

#[tokio::test]
async fn stalled_response_body_times_out() {
    async fn stalling(_request: Request) -> Response {
        let chunks = stream::iter([Ok::<_, Infallible>(Bytes::from_static(b"begin"))])
            .chain(stream::pending());
        Response::new(Body::from_stream(chunks))
    }
    let url = serve_with(Router::new().fallback(stalling)).await;

    let mut config = Config::default();
    config.connection_timeout = Duration::from_millis(50);
    let (transport, _shared) = multi(&config, vec![url], SyncReporter::disabled());

    let response = transport
        .round_trip(ProxyRequest::new(Method::GET, "/index/a"))
        .await
        .unwrap();
    let err = read_body(response).await.unwrap_err();
    assert_eq!(err, TransportError::Timeout);
}

#[tokio::test]
async fn host_is_rewritten_and_additions_are_applied() {
    async fn echoing(request: Request) -> Response {
        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let injected = request
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        (StatusCode::OK, format!("{host}|{injected}")).into_response()
    }
    let url = serve_with(Router::new().fallback(echoing)).await;

    let mut config = Config::default();
    config
        .additional_request_headers
        .insert("Cache-Control".to_string(), "no-store".to_string());
    let (transport, _shared) = multi(&config, vec![url.clone()], SyncReporter::disabled());

    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::HOST,
        http::HeaderValue::from_static("proxy.example.com"),
    );
    let request = ProxyRequest::new(Method::GET, "/index/a").with_headers(headers);

    let response = transport.round_trip(request).await.unwrap();
    let body = String::from_utf8(read_body(response).await.unwrap()).unwrap();
    let expected_host = format!(
        "{}:{}",
        url.host_str().unwrap(),
        url.port().unwrap()
    );
    assert_eq!(body, format!("{expected_host}|no-store"));
}

#[tokio::test]
async fn empty_backend_set_is_an_error() {
    let (transport, _shared) = multi(&Config::default(), Vec::new(), SyncReporter::disabled());
    let err = transport
        .round_trip(ProxyRequest::new(Method::GET, "/index/a"))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::NoBackends);
}

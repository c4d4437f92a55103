//! Inbound HTTP Server
//!
//! A catch-all axum handler bridges every inbound request onto the sharding
//! ring: body as a stream, headers forwarded verbatim (the transport strips
//! hop-by-hop fields), responses passed back with the configured header
//! additions. One access-log line per request goes to `akubra::access`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use futures::{StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName};
use http::StatusCode;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use akubra_core::{
    spawn_writer, Config, ProxyRequest, ProxyResponse, RingFactory, RoundTrip, ShardsRing,
    SharedTransport, SyncReporter, TransportError,
};

/// Everything a request handler needs, built once at startup.
pub struct AppState {
    ring: ShardsRing,
    response_additions: HeaderMap,
}

/// Build the proxy router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(proxy).with_state(state)
}

/// Build the ring from configuration and serve until SIGTERM/SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (reporter, sync_rx) = SyncReporter::new();
    let _sync_writer = spawn_writer(sync_rx);

    let shared = SharedTransport::from_config(&config)?;
    let ring = RingFactory::new(config.clone(), shared, reporter).client_ring()?;
    let state = Arc::new(AppState {
        ring,
        response_additions: config.response_header_additions()?,
    });

    let listener = tokio::net::TcpListener::bind(config.listen.as_str())
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {e}", config.listen))?;
    info!(addr = %config.listen, "akubra listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
}

async fn proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    let content_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let chunked = parts.headers.contains_key(header::TRANSFER_ENCODING);
    let has_body = chunked || content_length.is_some_and(|len| len > 0);

    let mut proxy_request =
        ProxyRequest::new(method.clone(), path.clone()).with_headers(parts.headers);
    if let Some(query) = parts.uri.query() {
        proxy_request = proxy_request.with_query(query);
    }
    if has_body {
        let stream = body
            .into_data_stream()
            .map_err(|e| TransportError::Body(e.to_string()))
            .boxed();
        proxy_request = proxy_request.with_body(stream, content_length);
    }

    match state.ring.round_trip(proxy_request).await {
        Ok(response) => {
            let backend = response
                .backend
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string);
            info!(
                target: "akubra::access",
                method = %method,
                path = %path,
                backend = %backend,
                status = response.status.as_u16(),
                "request served"
            );
            into_client_response(response, &state.response_additions)
        }
        Err(e) => {
            let status = error_status(&e);
            info!(
                target: "akubra::access",
                method = %method,
                path = %path,
                backend = "-",
                status = status.as_u16(),
                error = %e,
                "request failed"
            );
            let mut response = Response::new(Body::from(format!("{e}\n")));
            *response.status_mut() = status;
            response
        }
    }
}

fn error_status(error: &TransportError) -> StatusCode {
    match error {
        TransportError::Routing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TransportError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

const STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TRAILER,
    header::UPGRADE,
];

fn into_client_response(response: ProxyResponse, additions: &HeaderMap) -> Response {
    let ProxyResponse {
        status,
        headers,
        body,
        ..
    } = response;

    let mut out = Response::new(Body::from_stream(body));
    *out.status_mut() = status;

    let out_headers = out.headers_mut();
    for (name, value) in &headers {
        if STRIPPED_RESPONSE_HEADERS.contains(name) {
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }
    for (name, value) in additions {
        out_headers.insert(name.clone(), value.clone());
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use futures::stream;
    use http::HeaderValue;

    use super::*;

    fn empty_response(status: StatusCode) -> ProxyResponse {
        ProxyResponse {
            status,
            headers: HeaderMap::new(),
            body: stream::empty().boxed(),
            backend: None,
        }
    }

    #[test]
    fn routing_errors_map_to_internal_error() {
        assert_eq!(
            error_status(&TransportError::Routing("no shard".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&TransportError::Timeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_status(&TransportError::NoBackends),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn response_additions_are_injected() {
        let mut additions = HeaderMap::new();
        additions.insert("x-served-by", HeaderValue::from_static("akubra"));

        let mut response = empty_response(StatusCode::OK);
        response
            .headers
            .insert(header::ETAG, HeaderValue::from_static("\"abc\""));
        response
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));

        let out = into_client_response(response, &additions);
        assert_eq!(out.status(), StatusCode::OK);
        assert_eq!(out.headers().get("x-served-by").unwrap(), "akubra");
        assert_eq!(out.headers().get(header::ETAG).unwrap(), "\"abc\"");
        assert!(out.headers().get(header::CONNECTION).is_none());
    }
}

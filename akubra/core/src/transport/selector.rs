//! Response Selection
//!
//! Reduces the stream of per-backend result tuples to the single tuple the
//! client will see. Selection is pluggable through [`PickResponse`]; the
//! default policy, [`FirstSuccessPicker`], is what cluster type
//! `replicator` binds to:
//!
//! 1. The first tuple with status < 400 and no error becomes the candidate;
//!    later tuples are still consumed but cannot displace it.
//! 2. If nothing qualifies by end-of-stream, the first tuple received wins.
//! 3. Every losing tuple that failed while the candidate did not, and whose
//!    method is in `SyncLogMethods`, produces one sync record.
//!
//! Losing response bodies are drained in the background; leaking them would
//! starve the shared connection pool.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::StreamExt;
use http::Method;
use tokio::sync::mpsc;
use tracing::debug;

use crate::synclog::{SyncRecord, SyncReporter};

use super::BackendResult;

/// Policy reducing a bounded stream of backend results to one.
#[async_trait]
pub trait PickResponse: Send + Sync {
    /// Consume every tuple from `results` and return the chosen one.
    ///
    /// Returns `None` only when the stream closes without a single tuple.
    async fn pick(&self, results: mpsc::Receiver<BackendResult>) -> Option<BackendResult>;
}

/// Default policy: first usable response wins, divergence is recorded.
pub struct FirstSuccessPicker {
    cluster: String,
    sync_methods: HashSet<Method>,
    reporter: SyncReporter,
}

impl FirstSuccessPicker {
    /// Create a picker for the named cluster.
    #[must_use]
    pub fn new(
        cluster: impl Into<String>,
        sync_methods: HashSet<Method>,
        reporter: SyncReporter,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            sync_methods,
            reporter,
        }
    }

    fn finish_loser(&self, winner: &BackendResult, loser: BackendResult) {
        let divergent = !loser.is_success() && winner.is_success();
        if divergent && self.sync_methods.contains(&loser.method) {
            let mut record = SyncRecord::new(
                loser.method.as_str(),
                loser.path.clone(),
                self.cluster.clone(),
            );
            record.backend = loser.backend.to_string();
            record.chosen_backend = winner.backend.to_string();
            match &loser.result {
                Ok(reply) => record.status = Some(reply.status.as_u16()),
                Err(e) => record.error = Some(e.to_string()),
            }
            self.reporter.report(record);
        }

        // Drain the body so the pooled connection can be reused.
        if let Ok(reply) = loser.result {
            tokio::spawn(async move {
                let mut body = reply.body;
                while let Some(chunk) = body.next().await {
                    if chunk.is_err() {
                        break;
                    }
                }
            });
        }
    }
}

#[async_trait]
impl PickResponse for FirstSuccessPicker {
    async fn pick(&self, mut results: mpsc::Receiver<BackendResult>) -> Option<BackendResult> {
        let mut winner: Option<BackendResult> = None;
        let mut first: Option<BackendResult> = None;
        let mut losers: Vec<BackendResult> = Vec::new();

        while let Some(tuple) = results.recv().await {
            if winner.is_none() && tuple.is_success() {
                winner = Some(tuple);
            } else if winner.is_none() && first.is_none() {
                first = Some(tuple);
            } else {
                losers.push(tuple);
            }
        }

        let chosen = match winner {
            Some(chosen) => {
                // A provisional first pick loses once a success arrived.
                if let Some(first) = first.take() {
                    losers.push(first);
                }
                chosen
            }
            None => {
                debug!(cluster = %self.cluster, "no backend succeeded, falling back to first response");
                first?
            }
        };

        for loser in losers {
            self.finish_loser(&chosen, loser);
        }
        Some(chosen)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use futures::stream;
    use http::{HeaderMap, StatusCode};
    use url::Url;

    use crate::transport::{BackendReply, TransportError};

    use super::*;

    fn reply(backend: &str, status: u16) -> BackendResult {
        BackendResult {
            backend: Url::parse(backend).unwrap(),
            method: Method::PUT,
            path: "/index/a".to_string(),
            result: Ok(BackendReply {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                body: stream::empty().boxed(),
            }),
        }
    }

    fn failure(backend: &str, error: TransportError) -> BackendResult {
        BackendResult {
            backend: Url::parse(backend).unwrap(),
            method: Method::PUT,
            path: "/index/a".to_string(),
            result: Err(error),
        }
    }

    fn picker() -> (FirstSuccessPicker, mpsc::UnboundedReceiver<SyncRecord>) {
        let (reporter, rx) = SyncReporter::new();
        let methods = [Method::PUT, Method::DELETE].into_iter().collect();
        (FirstSuccessPicker::new("cluster1", methods, reporter), rx)
    }

    async fn run(
        picker: &FirstSuccessPicker,
        tuples: Vec<BackendResult>,
    ) -> Option<BackendResult> {
        let (tx, rx) = mpsc::channel(tuples.len().max(1));
        for tuple in tuples {
            tx.send(tuple).await.unwrap();
        }
        drop(tx);
        picker.pick(rx).await
    }

    #[tokio::test]
    async fn first_success_wins() {
        let (picker, _rx) = picker();
        let chosen = run(
            &picker,
            vec![
                failure("http://a:9000", TransportError::Timeout),
                reply("http://b:9000", 200),
                reply("http://c:9000", 200),
            ],
        )
        .await
        .unwrap();

        assert_eq!(chosen.backend.as_str(), "http://b:9000/");
        assert!(chosen.is_success());
    }

    #[tokio::test]
    async fn later_success_cannot_displace_candidate() {
        let (picker, _rx) = picker();
        let chosen = run(
            &picker,
            vec![reply("http://a:9000", 200), reply("http://b:9000", 201)],
        )
        .await
        .unwrap();

        assert_eq!(chosen.backend.as_str(), "http://a:9000/");
    }

    #[tokio::test]
    async fn all_failed_returns_first_received() {
        let (picker, _rx) = picker();
        let chosen = run(
            &picker,
            vec![
                failure("http://a:9000", TransportError::Timeout),
                reply("http://b:9000", 503),
            ],
        )
        .await
        .unwrap();

        assert_eq!(chosen.backend.as_str(), "http://a:9000/");
        assert!(!chosen.is_success());
    }

    #[tokio::test]
    async fn empty_stream_yields_none() {
        let (picker, _rx) = picker();
        assert!(run(&picker, Vec::new()).await.is_none());
    }

    #[tokio::test]
    async fn divergent_loser_is_recorded() {
        let (picker, mut rx) = picker();
        let chosen = run(
            &picker,
            vec![reply("http://good:9000", 200), reply("http://bad:9000", 500)],
        )
        .await
        .unwrap();
        assert_eq!(chosen.backend.as_str(), "http://good:9000/");

        let record = rx.recv().await.unwrap();
        assert_eq!(record.method, "PUT");
        assert_eq!(record.cluster, "cluster1");
        assert_eq!(record.backend, "http://bad:9000/");
        assert_eq!(record.status, Some(500));
        assert_eq!(record.chosen_backend, "http://good:9000/");
    }

    #[tokio::test]
    async fn transport_error_divergence_carries_error_text() {
        let (picker, mut rx) = picker();
        run(
            &picker,
            vec![
                reply("http://good:9000", 200),
                failure("http://bad:9000", TransportError::Timeout),
            ],
        )
        .await
        .unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.status, None);
        assert_eq!(record.error.as_deref(), Some("read timed out"));
    }

    #[tokio::test]
    async fn method_outside_sync_set_is_not_recorded() {
        let (reporter, mut rx) = SyncReporter::new();
        let picker = FirstSuccessPicker::new(
            "cluster1",
            [Method::DELETE].into_iter().collect(),
            reporter,
        );

        run(
            &picker,
            vec![reply("http://good:9000", 200), reply("http://bad:9000", 500)],
        )
        .await
        .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn matching_failures_are_not_divergent() {
        let (picker, mut rx) = picker();
        run(
            &picker,
            vec![reply("http://a:9000", 500), reply("http://b:9000", 500)],
        )
        .await
        .unwrap();

        assert!(rx.try_recv().is_err());
    }
}

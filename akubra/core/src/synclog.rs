//! Divergence Records
//!
//! When one backend's outcome differs from the chosen one, the proxy emits a
//! sync record naming the stray backend so an out-of-band repair process can
//! reconcile it. Records travel over an unbounded channel: request paths
//! never block on logging. The daemon spawns [`spawn_writer`], which prints
//! one JSON line per record on the `akubra::sync` tracing target.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// One divergence, one line in the sync log.
#[derive(Clone, Debug, Serialize)]
pub struct SyncRecord {
    /// Emission time, RFC 3339.
    pub timestamp: String,
    /// Method of the diverged request.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Cluster the stray backend belongs to.
    pub cluster: String,
    /// The stray backend, when a specific one is known.
    pub backend: String,
    /// HTTP status of the stray outcome, if the backend replied at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Transport error of the stray outcome, if it never replied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Backend whose response the client received.
    pub chosen_backend: String,
}

impl SyncRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            method: method.into(),
            path: path.into(),
            cluster: cluster.into(),
            backend: String::new(),
            status: None,
            error: None,
            chosen_backend: String::new(),
        }
    }

    /// Serialise to the line-oriented wire format.
    #[must_use]
    pub fn to_line(&self) -> String {
        // A record is flat strings and numbers; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Cloneable handle emitting sync records.
///
/// A disabled reporter swallows records, which keeps transports usable in
/// tests and in tools that do not run the writer.
#[derive(Clone, Default)]
pub struct SyncReporter {
    tx: Option<mpsc::UnboundedSender<SyncRecord>>,
}

impl SyncReporter {
    /// Create a reporter and the receiving end for a writer task.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that drops every record.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit one record. Best effort: a missing or closed writer is ignored.
    pub fn report(&self, record: SyncRecord) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(record);
        }
    }
}

/// Consume records and print one JSON line each on `akubra::sync`.
pub fn spawn_writer(mut rx: mpsc::UnboundedReceiver<SyncRecord>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            info!(target: "akubra::sync", "{}", record.to_line());
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

//! Body Multiplexer
//!
//! Splits one streaming request body into N independent branch bodies, one
//! per backend dispatch. A pump task forwards every chunk to each still-open
//! branch before pulling the next chunk from the source, so at most one
//! chunk per branch is ever in flight and the slowest backend back-pressures
//! the client upload. The source is read exactly once regardless of N.
//!
//! Byte-count integrity is verified against the declared `Content-Length`:
//! on mismatch every branch fails with
//! [`TransportError::ContentLengthMismatch`] and the violation is published
//! through [`BodyIntegrity`] so each backend tuple can carry it. When every
//! branch has been dropped the writer side fails the same way, publishing
//! [`TransportError::BrokenPipe`].

use std::pin::Pin;
use std::sync::Arc;
use std::sync::OnceLock;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{ByteStream, TransportError};

/// One branch of a multiplexed body.
///
/// Yields the same chunks, in the same order, as every sibling branch.
/// Dropping a branch detaches it from the fan-out without stalling the rest.
pub struct BranchBody {
    rx: ReceiverStream<Result<Bytes, TransportError>>,
}

impl Stream for BranchBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// Shared slot recording a body integrity violation.
///
/// Set at most once by the pump; dispatch tasks consult it to override a
/// low-level send failure with the precise cause.
#[derive(Clone, Default)]
pub struct BodyIntegrity {
    slot: Arc<OnceLock<TransportError>>,
}

impl BodyIntegrity {
    /// The recorded violation, if the pump detected one.
    #[must_use]
    pub fn violation(&self) -> Option<TransportError> {
        self.slot.get().cloned()
    }

    fn record(&self, error: TransportError) {
        let _ = self.slot.set(error);
    }
}

/// Split `source` into `branches` independent bodies.
///
/// Returns the branch bodies, the integrity slot, and the pump task handle.
/// The pump runs until the source is exhausted, an integrity violation is
/// detected, or every branch has been dropped.
#[must_use]
pub fn split_body(
    source: ByteStream,
    branches: usize,
    declared: Option<u64>,
) -> (Vec<BranchBody>, BodyIntegrity, JoinHandle<()>) {
    let mut senders = Vec::with_capacity(branches);
    let mut bodies = Vec::with_capacity(branches);
    for _ in 0..branches {
        // Capacity 1: one chunk of look-ahead per branch, nothing more.
        let (tx, rx) = mpsc::channel(1);
        senders.push(Some(tx));
        bodies.push(BranchBody {
            rx: ReceiverStream::new(rx),
        });
    }

    let integrity = BodyIntegrity::default();
    let pump_integrity = integrity.clone();
    let task = tokio::spawn(pump(source, senders, declared, pump_integrity));

    (bodies, integrity, task)
}

type BranchSender = mpsc::Sender<Result<Bytes, TransportError>>;

async fn pump(
    mut source: ByteStream,
    mut senders: Vec<Option<BranchSender>>,
    declared: Option<u64>,
    integrity: BodyIntegrity,
) {
    let mut delivered: u64 = 0;

    while let Some(item) = source.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                fail_branches(&mut senders, &e).await;
                return;
            }
        };

        delivered += chunk.len() as u64;
        if let Some(total) = declared {
            if delivered > total {
                let mismatch = TransportError::ContentLengthMismatch {
                    declared: total,
                    delivered,
                };
                integrity.record(mismatch.clone());
                fail_branches(&mut senders, &mismatch).await;
                return;
            }
        }

        let mut open = 0usize;
        for slot in &mut senders {
            if let Some(tx) = slot {
                if tx.send(Ok(chunk.clone())).await.is_err() {
                    *slot = None;
                } else {
                    open += 1;
                }
            }
        }
        if open == 0 {
            // Nobody left to write to: the writer side fails.
            integrity.record(TransportError::BrokenPipe);
            debug!("body fan-out stopped: all branches closed");
            return;
        }
    }

    if let Some(total) = declared {
        if delivered != total {
            let mismatch = TransportError::ContentLengthMismatch {
                declared: total,
                delivered,
            };
            integrity.record(mismatch.clone());
            fail_branches(&mut senders, &mismatch).await;
        }
    }
    // Dropping the senders signals end-of-body to the surviving branches.
}

async fn fail_branches(senders: &mut Vec<Option<BranchSender>>, error: &TransportError) {
    for slot in senders.iter_mut() {
        if let Some(tx) = slot.take() {
            let _ = tx.send(Err(error.clone())).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

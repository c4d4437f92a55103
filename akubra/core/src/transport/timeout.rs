//! Read Deadline for Body Streams
//!
//! Wraps a body stream with an inactivity deadline: whenever a poll interval
//! passes without a chunk arriving, the stream yields
//! [`TransportError::Timeout`] and ends. Applied to backend response bodies
//! so a stalled backend cannot hold a connection slot indefinitely.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::time::Sleep;

use super::TransportError;

/// A body stream with an inactivity deadline on each read.
pub struct TimeoutBody<S> {
    inner: S,
    deadline: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutBody<S> {
    /// Wrap `inner`, failing any read that stays idle longer than `deadline`.
    pub fn new(inner: S, deadline: Duration) -> Self {
        Self {
            inner,
            deadline,
            sleep: None,
        }
    }
}

impl<S> Stream for TimeoutBody<S>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    type Item = Result<Bytes, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(item) => {
                // Activity: the deadline restarts on the next pending read.
                this.sleep = None;
                Poll::Ready(item)
            }
            Poll::Pending => {
                let deadline = this.deadline;
                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(deadline)));
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.sleep = None;
                        Poll::Ready(Some(Err(TransportError::Timeout)))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Constant-interval retry with an observable message stream.
//!
//! Readiness waits and the CRD bootstrap poll cluster state until it
//! converges. Rather than returning only the final error, the retrier
//! emits a message per attempt so callers can log intermediate failures,
//! and it honors cancellation at every suspension point.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: Display + Debug> {
    /// The stop token fired before the operation succeeded.
    #[error("timed out waiting for operation to finish")]
    TimedOut,
    /// The most recent attempt failed with this error.
    #[error("{0}")]
    Failed(E),
}

/// One message from a retry loop.
///
/// Failed attempts arrive as `{done: false, error: Some(..)}`; the
/// terminal message has `done: true` with `error: None` on success, after
/// which the channel closes.
#[derive(Debug)]
pub struct Message<E: Display + Debug> {
    /// Whether the operation has finished retrying.
    pub done: bool,
    /// The error of the attempt, if any.
    pub error: Option<RetryError<E>>,
}

/// Retry `operation` at a constant interval until it succeeds or `stop`
/// fires, reporting each attempt on the returned channel.
///
/// The first attempt runs immediately. All sleeps select against the stop
/// token, so cancellation is never delayed by a full interval.
pub fn retry<F, Fut, E>(
    interval: Duration,
    stop: CancellationToken,
    mut operation: F,
) -> mpsc::Receiver<Message<E>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Display + Debug + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            if stop.is_cancelled() {
                let _ = tx
                    .send(Message {
                        done: true,
                        error: Some(RetryError::TimedOut),
                    })
                    .await;
                return;
            }
            match operation().await {
                Ok(()) => {
                    let _ = tx.send(Message { done: true, error: None }).await;
                    return;
                }
                Err(err) => {
                    // Attempt reports are best-effort; a slow consumer must
                    // not stall the retry loop.
                    let _ = tx.try_send(Message {
                        done: false,
                        error: Some(RetryError::Failed(err)),
                    });
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.cancelled() => {
                    let _ = tx
                        .send(Message {
                            done: true,
                            error: Some(RetryError::TimedOut),
                        })
                        .await;
                    return;
                }
            }
        }
    });
    rx
}

/// Derive a stop token that also fires after `after` elapses.
///
/// Cancelling the parent cancels the returned token immediately, so a
/// bounded wait still shuts down promptly on operator exit.
pub fn deadline(parent: &CancellationToken, after: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

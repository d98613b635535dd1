//! Load-adaptive admission control
//!
//! A single coordinator task owns the count of free tokens. Callers never see
//! the count; they send acquire, release and duration requests over channels
//! and the coordinator services whichever becomes ready first.
//!
//! The duration handed out shrinks linearly as tokens run out:
//! `d(n) = (n + 1) * timeout / (total + 1)`. An idle system grants the full
//! timeout, a saturated one still grants `timeout / (total + 1)`.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Admission errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission coordinator stopped")]
    Closed,
    #[error("admission capacity must be at least 1")]
    ZeroCapacity,
}

/// Grace period for a new connection when `free` of `total` tokens are free
pub fn grace_period(free: usize, total: usize, timeout: Duration) -> Duration {
    let free = free.min(total);
    let numerator = timeout.as_nanos() * (free as u128 + 1);
    let nanos = numerator / (total as u128 + 1);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// A borrowed admission token. Dropping it returns the token.
#[derive(Debug)]
pub struct Token {
    release: mpsc::UnboundedSender<()>,
}

impl Drop for Token {
    fn drop(&mut self) {
        // coordinator gone means the pool is gone too
        let _ = self.release.send(());
    }
}

/// Cloneable handle to the coordinator
#[derive(Clone, Debug)]
pub struct Admission {
    acquire: mpsc::Sender<oneshot::Sender<Token>>,
    duration: mpsc::Sender<oneshot::Sender<Duration>>,
}

impl Admission {
    /// Start a coordinator with `total` tokens.
    ///
    /// The coordinator exits when `shutdown` fires, or once every handle has
    /// been dropped and every token returned.
    pub fn spawn(
        total: usize,
        timeout: Duration,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<Self, AdmissionError> {
        if total == 0 {
            return Err(AdmissionError::ZeroCapacity);
        }

        let (acquire_tx, acquire_rx) = mpsc::channel(1);
        let (duration_tx, duration_rx) = mpsc::channel(1);
        let (release_tx, release_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            free: total,
            total,
            timeout,
            acquire: acquire_rx,
            duration: duration_rx,
            release: release_rx,
            release_tx,
        };
        tokio::spawn(coordinator.run(shutdown));

        Ok(Self {
            acquire: acquire_tx,
            duration: duration_tx,
        })
    }

    /// Wait for a free token.
    ///
    /// Cancelling this future while it waits does not leak a token.
    pub async fn acquire(&self) -> Result<Token, AdmissionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.acquire
            .send(reply_tx)
            .await
            .map_err(|_| AdmissionError::Closed)?;
        reply_rx.await.map_err(|_| AdmissionError::Closed)
    }

    /// Current grace period, derived from the free token count
    pub async fn duration(&self) -> Result<Duration, AdmissionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.duration
            .send(reply_tx)
            .await
            .map_err(|_| AdmissionError::Closed)?;
        reply_rx.await.map_err(|_| AdmissionError::Closed)
    }
}

struct Coordinator {
    free: usize,
    total: usize,
    timeout: Duration,
    acquire: mpsc::Receiver<oneshot::Sender<Token>>,
    duration: mpsc::Receiver<oneshot::Sender<Duration>>,
    release: mpsc::UnboundedReceiver<()>,
    release_tx: mpsc::UnboundedSender<()>,
}

impl Coordinator {
    async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut acquire_open = true;
        let mut duration_open = true;

        loop {
            tokio::select! {
                request = self.acquire.recv(), if acquire_open && self.free > 0 => match request {
                    Some(reply) => {
                        self.free -= 1;
                        // a requester that went away hands the token straight
                        // back through Drop
                        let _ = reply.send(Token { release: self.release_tx.clone() });
                    }
                    None => acquire_open = false,
                },
                Some(()) = self.release.recv(), if self.free < self.total => {
                    self.free += 1;
                }
                request = self.duration.recv(), if duration_open => match request {
                    Some(reply) => {
                        let _ = reply.send(grace_period(self.free, self.total, self.timeout));
                    }
                    None => duration_open = false,
                },
                _ = &mut shutdown => {
                    debug!("admission coordinator shutting down ({} of {} free)", self.free, self.total);
                    break;
                }
            }

            // no handles left and every token returned
            if !acquire_open && !duration_open && self.free == self.total {
                debug!("admission coordinator idle with no handles, exiting");
                break;
            }
        }
    }
}

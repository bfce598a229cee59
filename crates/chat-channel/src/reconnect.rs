//! Explicit, cancellable reconnection
//!
//! A failure schedules at most one retry: a spawned task that sleeps, then
//! runs the reconnect future. The handle remembers the session epoch it was
//! scheduled under; the session ignores a timer whose epoch is stale, and
//! `cancel()` aborts one that has not fired yet.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Delays for the two retry classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// After a rejected handshake that renewal recovered
    pub auth_retry_delay: Duration,
    /// After an unexpected transport close; `None` disables
    pub close_retry_delay: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auth_retry_delay: Duration::from_millis(300),
            close_retry_delay: Some(Duration::from_secs(3)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    AuthRenewed,
    TransportClosed,
}

impl ReconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRenewed => "auth_renewed",
            Self::TransportClosed => "transport_closed",
        }
    }
}

/// A scheduled retry.
#[derive(Debug)]
pub struct ReconnectHandle {
    epoch: u64,
    reason: ReconnectReason,
    task: JoinHandle<()>,
}

impl ReconnectHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn reason(&self) -> ReconnectReason {
        self.reason
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the timer. No effect once the retry is running.
    pub fn cancel(self) {
        debug!(epoch = self.epoch, reason = self.reason.as_str(), "reconnect cancelled");
        self.task.abort();
    }
}

/// Spawn `retry` after `delay`.
pub fn schedule<F>(delay: Duration, epoch: u64, reason: ReconnectReason, retry: F) -> ReconnectHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    metrics::counter!("chat_reconnects_scheduled_total", "reason" => reason.as_str()).increment(1);
    debug!(epoch, reason = reason.as_str(), delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        retry.await;
    });
    ReconnectHandle {
        epoch,
        reason,
        task,
    }
}

//! Subscription lifecycle with capped exponential backoff.
//!
//! ```text
//! Idle → Connecting → Connected ─(error)→ Backoff(n) → Connecting → … → Failed
//! ```
//!
//! Attempt `n` waits `base × 2^(n−1)`. A successful connect resets the
//! attempt counter. After `max_attempts` consecutive failures the supervisor
//! stops for good and reports `Failed`; only a process restart recovers.

use std::sync::Arc;
use std::time::Duration;

use hirebridge_core::FeedMessage;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ListenerError;
use crate::listener::{ChangeListener, Enqueued, ForwardEnd};
use crate::metrics;

/// Retry schedule for lost or failed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor)
    }

    /// The full retry schedule.
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|n| self.delay_for(n)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Backoff { attempt: u32, delay_ms: u64 },
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Consecutive failed attempts since the last successful connect.
    pub retry_count: u32,
    pub max_attempts: u32,
    /// Successful connects after the first one.
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub last_connected_at: Option<String>,
}

impl SupervisorStatus {
    fn new(max_attempts: u32) -> Self {
        Self {
            state: SupervisorState::Idle,
            retry_count: 0,
            max_attempts,
            reconnects: 0,
            last_error: None,
            last_connected_at: None,
        }
    }
}

pub struct ConnectionSupervisor {
    listener: Arc<ChangeListener>,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    status: watch::Sender<SupervisorStatus>,
}

impl ConnectionSupervisor {
    pub fn new(listener: Arc<ChangeListener>, policy: BackoffPolicy, connect_timeout: Duration) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::new(policy.max_attempts));
        Self {
            listener,
            policy,
            connect_timeout,
            status,
        }
    }

    pub fn listener(&self) -> &Arc<ChangeListener> {
        &self.listener
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Runs until cancelled, until the consumer goes away, or until retries
    /// are exhausted.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        let mut connected_before = false;

        loop {
            self.status
                .send_modify(|s| s.state = SupervisorState::Connecting { attempt: attempt + 1 });

            let connect = tokio::time::timeout(self.connect_timeout, self.listener.connect());
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                connected = connect => connected,
            };

            let failure = match connected {
                Ok(Ok(stream)) => {
                    attempt = 0;
                    let reconnect = connected_before;
                    connected_before = true;
                    self.status.send_modify(|s| {
                        s.state = SupervisorState::Connected;
                        s.retry_count = 0;
                        s.last_connected_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
                        if reconnect {
                            s.reconnects += 1;
                        }
                    });

                    if reconnect {
                        metrics::record_reconnect();
                        info!("Change feed re-established, requesting full invalidation");
                        // Anything missed while disconnected is unknown.
                        if self.listener.enqueue(FeedMessage::Resubscribed).await == Enqueued::Closed {
                            break;
                        }
                    }

                    match self.listener.forward(stream, &cancel).await {
                        Ok(ForwardEnd::Cancelled) => break,
                        Ok(ForwardEnd::ConsumerGone) => {
                            info!("Invalidation queue closed, stopping change feed");
                            break;
                        }
                        Err(e) => e,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    self.listener.mark_disconnected();
                    ListenerError::Timeout(self.connect_timeout)
                }
            };

            metrics::record_connect_failure();
            attempt += 1;
            if attempt > self.policy.max_attempts {
                error!(
                    error = %failure,
                    attempts = self.policy.max_attempts,
                    "Change feed retries exhausted, giving up"
                );
                self.status.send_modify(|s| {
                    s.state = SupervisorState::Failed;
                    s.last_error = Some(failure.to_string());
                });
                return;
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                error = %failure,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Change feed lost, retrying"
            );
            self.status.send_modify(|s| {
                s.state = SupervisorState::Backoff {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                };
                s.retry_count = attempt;
                s.last_error = Some(failure.to_string());
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.listener.mark_disconnected();
        self.status
            .send_modify(|s| s.state = SupervisorState::Stopped);
        info!("Change feed supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let delays: Vec<u64> = BackoffPolicy::default()
            .delays()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max_attempts: 100,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert!(policy.delay_for(100) >= policy.delay_for(40));
    }

    #[test]
    fn test_status_serializes_tagged_state() {
        let mut status = SupervisorStatus::new(5);
        status.state = SupervisorState::Backoff {
            attempt: 2,
            delay_ms: 2000,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"]["state"], "backoff");
        assert_eq!(json["state"]["delay_ms"], 2000);
        assert_eq!(json["maxAttempts"], 5);
    }
}

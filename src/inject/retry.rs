//! Cancellable retry with exponential backoff and mutation-triggered re-attempts.
//!
//! Used for both script execution and re-establishing elements after
//! navigation. One cycle owns one timer and one mutation subscription; both are
//! dropped when the cycle ends, whatever the reason.

use crate::core::config::RetryConfig;
use crate::errors::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub debounce: Duration,
}

impl RetryPolicy {
    /// Delay scheduled after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            debounce: config.debounce(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32, last_error: Option<String> },
    Cancelled { attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Handle to a spawned retry cycle.
pub struct RetryTask {
    token: CancellationToken,
    handle: JoinHandle<RetryOutcome>,
}

impl RetryTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn outcome(self) -> RetryOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("retry task ended abnormally: {}", e);
                RetryOutcome::Cancelled { attempts: 0 }
            }
        }
    }
}

/// Spawn [`run_retry`] on the runtime.
pub fn spawn_retry<T, A, Fut, S>(
    label: impl Into<String>,
    policy: RetryPolicy,
    attempt: A,
    is_success: S,
    mutations: Option<broadcast::Receiver<()>>,
) -> RetryTask
where
    T: Send + 'static,
    A: FnMut(u32) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    S: Fn(&T) -> bool + Send + 'static,
{
    let token = CancellationToken::new();
    let label = label.into();
    let child = token.clone();
    let handle = tokio::spawn(async move {
        run_retry(&label, &policy, attempt, is_success, mutations, child).await
    });
    RetryTask { token, handle }
}

/// Run `attempt` until `is_success` accepts its value, the attempts run out,
/// or `cancel` fires.
///
/// An attempt that returns `Err` is a failure like any other. Between attempts
/// the cycle waits for whichever comes first: the backoff timer, a debounced
/// burst of DOM mutations, or cancellation.
pub async fn run_retry<T, A, Fut, S>(
    label: &str,
    policy: &RetryPolicy,
    mut attempt: A,
    is_success: S,
    mut mutations: Option<broadcast::Receiver<()>>,
    cancel: CancellationToken,
) -> RetryOutcome
where
    A: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    S: Fn(&T) -> bool,
{
    let mut attempts = 0;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            debug!("{}: cancelled after {} attempts", label, attempts);
            return RetryOutcome::Cancelled { attempts };
        }

        attempts += 1;
        match attempt(attempts).await {
            Ok(value) if is_success(&value) => {
                debug!("{}: succeeded on attempt {}", label, attempts);
                return RetryOutcome::Succeeded { attempts };
            }
            Ok(_) => {
                last_error = Some("success check failed".to_string());
            }
            Err(e) => {
                last_error = Some(e.to_string());
            }
        }

        if attempts >= policy.max_attempts {
            warn!(
                "{}: giving up after {} attempts ({})",
                label,
                attempts,
                last_error.as_deref().unwrap_or("unknown")
            );
            return RetryOutcome::Exhausted {
                attempts,
                last_error,
            };
        }

        let delay = policy.delay_after(attempts);
        debug!(
            "{}: attempt {} failed, retrying in {:?} or on DOM change",
            label, attempts, delay
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{}: cancelled after {} attempts", label, attempts);
                return RetryOutcome::Cancelled { attempts };
            }
            _ = tokio::time::sleep(delay) => {}
            _ = next_mutation_burst(&mut mutations, policy.debounce) => {
                debug!("{}: DOM changed, retrying early", label);
            }
        }
    }
}

/// Resolve once a burst of mutations has gone quiet for `debounce`.
/// Never resolves without a subscription.
async fn next_mutation_burst(mutations: &mut Option<broadcast::Receiver<()>>, debounce: Duration) {
    let Some(rx) = mutations.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => break,
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }

    loop {
        match tokio::time::timeout(debounce, rx.recv()).await {
            Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
}

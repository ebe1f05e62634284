use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::PushError;
use crate::git::VersionControl;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub remote_name: String,
    pub branches: Vec<String>,
}

/// Bounded retry for a single push target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub remote: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl PushReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Push one target, retrying with exponential backoff.
pub async fn push_with_retry<V: VersionControl>(
    vcs: &V,
    target: &PublishTarget,
    policy: RetryPolicy,
) -> Result<u32, PushError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match vcs.push(&target.remote_name, &target.branches).await {
            Ok(()) => return Ok(attempt),
            Err(source) if attempt >= attempts => {
                return Err(PushError {
                    remote: target.remote_name.clone(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    "Push to {} failed (attempt {}/{}), retrying in {:?}: {}",
                    target.remote_name, attempt, attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Push every target concurrently. One unreachable remote never holds up
/// or fails the others.
pub async fn publish_all<V: VersionControl>(
    vcs: &V,
    targets: &[PublishTarget],
    policy: RetryPolicy,
) -> Vec<PushReport> {
    let pushes = targets.iter().map(|target| async move {
        match push_with_retry(vcs, target, policy).await {
            Ok(attempts) => {
                info!(
                    "Pushed {:?} to {} ({} attempt(s))",
                    target.branches, target.remote_name, attempts
                );
                PushReport {
                    remote: target.remote_name.clone(),
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{}", e);
                PushReport {
                    remote: e.remote.clone(),
                    attempts: e.attempts,
                    error: Some(e.source.to_string()),
                }
            }
        }
    });
    join_all(pushes).await
}

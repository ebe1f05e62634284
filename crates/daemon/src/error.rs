use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Malformed interval configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid duration '{0}': expected e.g. 90, 3m5s, 1h or 1d")]
    InvalidDuration(String),

    #[error("commit interval must be greater than zero")]
    ZeroPeriod,

    #[error("commit offset {offset:?} must be smaller than the interval {period:?}")]
    OffsetOutOfRange { offset: Duration, period: Duration },

    #[error("peer timeout {timeout:?} must be shorter than the interval {period:?}")]
    PeerTimeoutTooLong { timeout: Duration, period: Duration },
}

/// Failure of a single peer notary. Never escalates beyond that peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed or unverifiable reply: {0}")]
    Malformed(String),
}

/// Failure of the legacy mail notary. Soft: logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    #[error("mail authentication failed: {0}")]
    Auth(String),

    #[error("mail transport error: {0}")]
    Transport(String),

    #[error("no correlated reply before {window_end}")]
    Expired { window_end: DateTime<Utc> },

    #[error("reply signature not acceptable: {0}")]
    Unverifiable(String),
}

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("unexpected git output: {0}")]
    InvalidOutput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A push target that still failed after every retry.
#[derive(Debug, Error)]
#[error("push to '{remote}' failed after {attempts} attempt(s): {source}")]
pub struct PushError {
    pub remote: String,
    pub attempts: u32,
    #[source]
    pub source: VcsError,
}

/// Errors that end one scheduling cycle. The loop moves on to the next trigger.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("could not read repository state: {0}")]
    Snapshot(#[source] VcsError),

    #[error("commit creation failed: {0}")]
    CommitCreation(#[source] VcsError),
}

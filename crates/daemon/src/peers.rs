use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::stamp::{valid_branch_name, StampRequest};

/// A peer notary and the branch its stamps are recorded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub branch_name: String,
    pub endpoint: Url,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerListError {
    #[error("peer entry '{0}' is not of the form branch=URL")]
    MissingSeparator(String),

    #[error("peer branch name '{0}' is not valid")]
    InvalidBranch(String),

    #[error("peer URL '{url}' is not valid: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("peer branch '{0}' is configured more than once")]
    DuplicateBranch(String),
}

/// Parse `branch=URL` entries. Entries may also be packed into one string
/// separated by whitespace or commas.
pub fn parse_peer_list(entries: &[String]) -> Result<Vec<PeerDescriptor>, PeerListError> {
    let mut peers = Vec::new();
    let mut seen = HashSet::new();

    for entry in entries
        .iter()
        .flat_map(|e| e.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|e| !e.is_empty())
    {
        let (branch, url) = entry
            .split_once('=')
            .ok_or_else(|| PeerListError::MissingSeparator(entry.to_string()))?;

        if !valid_branch_name(branch) {
            return Err(PeerListError::InvalidBranch(branch.to_string()));
        }

        let endpoint = Url::parse(url).map_err(|e| PeerListError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(endpoint.scheme(), "https" | "http") {
            return Err(PeerListError::InvalidUrl {
                url: url.to_string(),
                reason: "scheme must be https".to_string(),
            });
        }

        if !seen.insert(branch.to_string()) {
            return Err(PeerListError::DuplicateBranch(branch.to_string()));
        }

        peers.push(PeerDescriptor {
            branch_name: branch.to_string(),
            endpoint,
        });
    }

    Ok(peers)
}

/// Something that can stamp a commit and hand back the raw signed reply.
pub trait PeerNotary: Send + Sync {
    fn stamp(
        &self,
        peer: &PeerDescriptor,
        request: &StampRequest,
    ) -> impl Future<Output = Result<String, PeerError>> + Send;
}

/// `stamp-branch-v1` over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpNotary {
    client: reqwest::Client,
}

impl HttpNotary {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("zeitgitterd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl PeerNotary for HttpNotary {
    async fn stamp(
        &self,
        peer: &PeerDescriptor,
        request: &StampRequest,
    ) -> Result<String, PeerError> {
        let response = self
            .client
            .post(peer.endpoint.clone())
            .form(&request.form())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PeerError::Timeout(Duration::ZERO)
                } else {
                    PeerError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(PeerError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        Ok(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorroborationOutcome {
    Success,
    Timeout,
    Rejected,
    TransportError,
}

impl From<&PeerError> for CorroborationOutcome {
    fn from(err: &PeerError) -> Self {
        match err {
            PeerError::Timeout(_) => CorroborationOutcome::Timeout,
            PeerError::Rejected { .. } => CorroborationOutcome::Rejected,
            // Unverifiable replies count the same as a broken connection
            PeerError::Transport(_) | PeerError::Malformed(_) => {
                CorroborationOutcome::TransportError
            }
        }
    }
}

/// One peer's contribution to one cycle.
#[derive(Debug, Clone)]
pub struct CorroborationRecord {
    pub peer: PeerDescriptor,
    pub request: StampRequest,
    pub signed_reply: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub outcome: CorroborationOutcome,
    pub error: Option<PeerError>,
    /// Object id of the reply once it has been written and verified.
    pub stamp_commit: Option<String>,
}

impl CorroborationRecord {
    pub fn failed(peer: PeerDescriptor, request: StampRequest, error: PeerError) -> Self {
        Self {
            outcome: CorroborationOutcome::from(&error),
            peer,
            request,
            signed_reply: None,
            received_at: None,
            error: Some(error),
            stamp_commit: None,
        }
    }

    /// Downgrade a reply that failed validation after it arrived.
    pub fn reject(&mut self, error: PeerError) {
        self.outcome = CorroborationOutcome::from(&error);
        self.error = Some(error);
        self.stamp_commit = None;
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CorroborationOutcome::Success
    }
}

/// Ask every peer concurrently and collect whatever arrives before
/// `timeout` elapses.
///
/// Replies are kept as they arrive; peers still outstanding at the deadline
/// are recorded as timed out and their requests are dropped, so a late
/// answer can never reach the commit. The returned records follow the order
/// of `requests`.
pub async fn gather_corroborations<N: PeerNotary>(
    notary: &N,
    requests: Vec<(PeerDescriptor, StampRequest)>,
    timeout: Duration,
) -> Vec<CorroborationRecord> {
    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<CorroborationRecord>> = vec![None; requests.len()];

    let mut in_flight: FuturesUnordered<_> = requests
        .iter()
        .enumerate()
        .map(|(idx, (peer, request))| async move {
            debug!("Requesting timestamp from {} ({})", peer.branch_name, peer.endpoint);
            (idx, notary.stamp(peer, request).await)
        })
        .collect();

    loop {
        match tokio::time::timeout_at(deadline, in_flight.next()).await {
            Ok(Some((idx, result))) => {
                let (peer, request) = requests[idx].clone();
                let record = match result {
                    Ok(reply) => {
                        info!("Peer {} replied", peer.branch_name);
                        CorroborationRecord {
                            peer,
                            request,
                            signed_reply: Some(reply),
                            received_at: Some(Utc::now()),
                            outcome: CorroborationOutcome::Success,
                            error: None,
                            stamp_commit: None,
                        }
                    }
                    Err(PeerError::Timeout(_)) => {
                        warn!("Peer {} timed out", peer.branch_name);
                        CorroborationRecord::failed(peer, request, PeerError::Timeout(timeout))
                    }
                    Err(e) => {
                        warn!("Peer {} failed: {}", peer.branch_name, e);
                        CorroborationRecord::failed(peer, request, e)
                    }
                };
                slots[idx] = Some(record);
            }
            Ok(None) => break,
            Err(_) => {
                let outstanding = slots.iter().filter(|s| s.is_none()).count();
                warn!(
                    "Peer deadline of {:?} passed with {} peer(s) outstanding",
                    timeout, outstanding
                );
                break;
            }
        }
    }
    drop(in_flight);

    slots
        .into_iter()
        .zip(requests)
        .map(|(slot, (peer, request))| {
            slot.unwrap_or_else(|| {
                CorroborationRecord::failed(peer, request, PeerError::Timeout(timeout))
            })
        })
        .collect()
}

//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use zeitgitter_daemon::clock::{Clock, ManualClock};
use zeitgitter_daemon::error::{MailError, PeerError, VcsError};
use zeitgitter_daemon::git::{CommitContent, RepoDigest, VersionControl};
use zeitgitter_daemon::mail::{InboundMessage, MailQuery, MailTransport, OutboundMessage};
use zeitgitter_daemon::orchestrator::OrchestratorSettings;
use zeitgitter_daemon::peers::{PeerDescriptor, PeerNotary};
use zeitgitter_daemon::publish::{PublishTarget, RetryPolicy};
use zeitgitter_daemon::signature::SignatureVerifier;
use zeitgitter_daemon::stamp::StampRequest;

pub const STAMPER_KEY: &str = "A1B2C3D4E5F60718293A4B5C6D7E8F9070B61F81";
pub const STAMPER_KEYID: &str = "70B61F81";
pub const STAMPER_FROM: &str = "mailer@stamper.itconsult.co.uk";

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap()
}

pub fn hex_id(n: u64) -> String {
    format!("{:040x}", n)
}

pub fn peer(name: &str) -> PeerDescriptor {
    PeerDescriptor {
        branch_name: name.to_string(),
        endpoint: Url::parse(&format!("https://{}.example.net", name)).unwrap(),
    }
}

pub fn settings(peers: &[&str], remotes: &[&str]) -> OrchestratorSettings {
    let peers: Vec<PeerDescriptor> = peers.iter().map(|p| peer(p)).collect();
    let mut branches = vec!["main".to_string()];
    branches.extend(peers.iter().map(|p| p.branch_name.clone()));
    OrchestratorSettings {
        commit_branch: "main".to_string(),
        targets: remotes
            .iter()
            .map(|r| PublishTarget {
                remote_name: r.to_string(),
                branches: branches.clone(),
            })
            .collect(),
        peers,
        peer_timeout: Duration::from_secs(60),
        force_after_intervals: 6,
        retry: RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_secs(5),
        },
        mail_every_intervals: None,
        status_file: None,
    }
}

/// A commit object as a peer would return it.
pub fn signed_reply(request: &StampRequest, signer: &str) -> String {
    let mut obj = format!("tree {}\n", request.tree);
    for parent in request.expected_parents() {
        obj.push_str(&format!("parent {}\n", parent));
    }
    obj.push_str(&format!(
        "author {0} <{0}@example.net> 1717243385 +0000\ncommitter {0} <{0}@example.net> 1717243385 +0000\n",
        signer
    ));
    obj.push_str("gpgsig -----BEGIN PGP SIGNATURE-----\n \n iQEzBAABCAAdFiEE\n -----END PGP SIGNATURE-----\n");
    obj.push_str(&format!("\nhttps://{}.example.net timestamp\n", signer));
    obj
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub id: String,
    pub message: String,
    pub parents: Vec<String>,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct VcsState {
    next_id: u64,
    /// commit id -> tree id
    pub trees: HashMap<String, String>,
    pub branches: HashMap<String, String>,
    pub commits: Vec<RecordedCommit>,
    pub stamp_objects: Vec<String>,
    pub branch_updates: Vec<(String, String)>,
    pub push_attempts: HashMap<String, u32>,
    pub failing_remotes: HashSet<String>,
    pub fail_commits: bool,
}

impl VcsState {
    fn mint(&mut self) -> String {
        self.next_id += 1;
        let id = hex_id(self.next_id);
        self.trees.insert(id.clone(), hex_id(0xffff_0000 + self.next_id));
        id
    }
}

/// Repository stand-in that records every write.
#[derive(Debug, Clone)]
pub struct FakeVcs {
    workdir: PathBuf,
    state: Arc<Mutex<VcsState>>,
}

impl FakeVcs {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            state: Arc::new(Mutex::new(VcsState::default())),
        }
    }

    /// Give `branch` an initial commit and return its id.
    pub fn seed(&self, branch: &str) -> String {
        let mut state = self.state();
        let id = state.mint();
        state.branches.insert(branch.to_string(), id.clone());
        id
    }

    pub fn fail_remote(&self, remote: &str) {
        self.state().failing_remotes.insert(remote.to_string());
    }

    pub fn state(&self) -> MutexGuard<'_, VcsState> {
        self.state.lock().unwrap()
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.state().branches.get(branch).cloned()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state().commits.clone()
    }

    pub fn pushes(&self, remote: &str) -> u32 {
        self.state().push_attempts.get(remote).copied().unwrap_or(0)
    }
}

impl VersionControl for FakeVcs {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn current_digest(&self, branch: &str) -> Result<Option<RepoDigest>, VcsError> {
        let state = self.state();
        Ok(state.branches.get(branch).map(|commit| RepoDigest {
            commit: commit.clone(),
            tree: state.trees[commit].clone(),
        }))
    }

    async fn branch_head(&self, branch: &str) -> Result<Option<String>, VcsError> {
        Ok(self.head(branch))
    }

    async fn write_commit_object(&self, raw: &str) -> Result<String, VcsError> {
        let mut state = self.state();
        let id = state.mint();
        state.stamp_objects.push(raw.to_string());
        Ok(id)
    }

    async fn verify_commit(&self, _id: &str) -> Result<(), VcsError> {
        Ok(())
    }

    async fn create_commit(
        &self,
        content: &CommitContent,
        parents: &[String],
    ) -> Result<String, VcsError> {
        let mut state = self.state();
        if state.fail_commits {
            return Err(VcsError::Command {
                command: "git commit-tree".to_string(),
                status: "exit status: 128".to_string(),
                stderr: "fatal: unable to write object".to_string(),
            });
        }
        let id = state.mint();
        state.commits.push(RecordedCommit {
            id: id.clone(),
            message: content.message.clone(),
            parents: parents.to_vec(),
            paths: content.paths.clone(),
        });
        Ok(id)
    }

    async fn update_branch(&self, branch: &str, commit: &str) -> Result<(), VcsError> {
        let mut state = self.state();
        state.branches.insert(branch.to_string(), commit.to_string());
        state
            .branch_updates
            .push((branch.to_string(), commit.to_string()));
        Ok(())
    }

    async fn push(&self, remote: &str, _branches: &[String]) -> Result<(), VcsError> {
        let mut state = self.state();
        *state.push_attempts.entry(remote.to_string()).or_default() += 1;
        if state.failing_remotes.contains(remote) {
            return Err(VcsError::Command {
                command: format!("git push {}", remote),
                status: "exit status: 128".to_string(),
                stderr: "fatal: unable to access remote".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum PeerBehaviour {
    Sign,
    SignAfter(Duration),
    Fail(PeerError),
    Unsigned,
    Hang,
}

/// Peer notary stand-in with per-branch behaviour. Unknown peers sign.
#[derive(Clone, Default)]
pub struct FakeNotary {
    behaviours: Arc<Mutex<HashMap<String, PeerBehaviour>>>,
    calls: Arc<Mutex<Vec<(String, StampRequest)>>>,
    stall: Arc<Mutex<Option<(Arc<ManualClock>, chrono::Duration)>>>,
}

impl FakeNotary {
    pub fn new(behaviours: &[(&str, PeerBehaviour)]) -> Self {
        let notary = Self::default();
        for (name, behaviour) in behaviours {
            notary.set(name, behaviour.clone());
        }
        notary
    }

    pub fn set(&self, peer: &str, behaviour: PeerBehaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(peer.to_string(), behaviour);
    }

    /// Make the next request move `clock` forward, as if the cycle took
    /// that long.
    pub fn stall_next_call(&self, clock: Arc<ManualClock>, by: chrono::Duration) {
        *self.stall.lock().unwrap() = Some((clock, by));
    }

    pub fn calls(&self) -> Vec<(String, StampRequest)> {
        self.calls.lock().unwrap().clone()
    }
}

impl PeerNotary for FakeNotary {
    async fn stamp(
        &self,
        peer: &PeerDescriptor,
        request: &StampRequest,
    ) -> Result<String, PeerError> {
        self.calls
            .lock()
            .unwrap()
            .push((peer.branch_name.clone(), request.clone()));
        let stall = self.stall.lock().unwrap().take();
        if let Some((clock, by)) = stall {
            clock.advance(by);
        }
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&peer.branch_name)
            .cloned()
            .unwrap_or(PeerBehaviour::Sign);

        match behaviour {
            PeerBehaviour::Sign => Ok(signed_reply(request, &peer.branch_name)),
            PeerBehaviour::SignAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(signed_reply(request, &peer.branch_name))
            }
            PeerBehaviour::Fail(e) => Err(e),
            PeerBehaviour::Unsigned => Ok(signed_reply(request, &peer.branch_name)
                .lines()
                .filter(|l| !l.starts_with("gpgsig") && !l.starts_with(' '))
                .collect::<Vec<_>>()
                .join("\n")),
            PeerBehaviour::Hang => Ok(std::future::pending::<String>().await),
        }
    }
}

/// Mailbox stand-in. Replies become visible once the clock reaches their
/// arrival time. With `dovecot_bug` set, a search that includes the final
/// character of the sender address matches nothing.
pub struct FakeMailbox {
    clock: Arc<ManualClock>,
    pub dovecot_bug: bool,
    pub auth_fails: bool,
    /// Blow up inside the search, as a broken server library might
    pub search_panics: bool,
    /// Have the stamper answer every request after this delay
    pub auto_reply_after: Option<chrono::Duration>,
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub inbox: Mutex<Vec<InboundMessage>>,
    pub queries: Mutex<Vec<MailQuery>>,
}

impl FakeMailbox {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            dovecot_bug: false,
            auth_fails: false,
            search_panics: false,
            auto_reply_after: None,
            sent: Mutex::new(vec![]),
            inbox: Mutex::new(vec![]),
            queries: Mutex::new(vec![]),
        }
    }

    pub fn deliver(&self, message: InboundMessage) {
        self.inbox.lock().unwrap().push(message);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

/// Shared handle so tests can keep inspecting the mailbox after handing it
/// to the notary.
#[derive(Clone)]
pub struct SharedMailbox(pub Arc<FakeMailbox>);

impl MailTransport for SharedMailbox {
    async fn send(&self, message: &OutboundMessage) -> Result<(), MailError> {
        self.0.sent.lock().unwrap().push(message.clone());
        if let Some(delay) = self.0.auto_reply_after {
            let reply = stamper_reply(message.body.trim(), self.0.clock.now() + delay);
            self.0.deliver(reply);
        }
        Ok(())
    }

    async fn search(&self, query: &MailQuery) -> Result<Vec<InboundMessage>, MailError> {
        let mailbox = &self.0;
        if mailbox.search_panics {
            panic!("mailbox search blew up");
        }
        if mailbox.auth_fails {
            return Err(MailError::Auth("LOGIN rejected".to_string()));
        }
        mailbox.queries.lock().unwrap().push(query.clone());
        let now = mailbox.clock.now();
        let query_from = query.from.to_ascii_lowercase();
        Ok(mailbox
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.received_at <= now)
            .filter(|m| {
                let from = m.from.to_ascii_lowercase();
                if mailbox.dovecot_bug && query_from.len() >= from.len() {
                    return false;
                }
                from.contains(&query_from)
            })
            .cloned()
            .collect())
    }
}

/// Accepts any clear-signed text as signed by the stamper key.
#[derive(Debug, Clone, Default)]
pub struct FakeVerifier;

impl SignatureVerifier for FakeVerifier {
    async fn verify(&self, signed_text: &str) -> Result<String, MailError> {
        if signed_text.contains("-----BEGIN PGP SIGNED MESSAGE-----") {
            Ok(STAMPER_KEY.to_string())
        } else {
            Err(MailError::Unverifiable("no signature found".to_string()))
        }
    }
}

pub fn stamper_reply(digest: &str, received_at: DateTime<Utc>) -> InboundMessage {
    stamper_reply_from(STAMPER_FROM, digest, received_at)
}

pub fn stamper_reply_from(from: &str, digest: &str, received_at: DateTime<Utc>) -> InboundMessage {
    InboundMessage {
        from: from.to_string(),
        subject: format!("Re: Timestamp {}", digest),
        in_reply_to: None,
        received_at,
        body: format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n{}\nTimestamped by the stamping service\n-----BEGIN PGP SIGNATURE-----\niQEz\n-----END PGP SIGNATURE-----\n",
            digest
        ),
    }
}

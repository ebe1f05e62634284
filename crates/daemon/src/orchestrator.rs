use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{CycleError, PeerError};
use crate::force::{ForceCounter, ForceDecision};
use crate::git::{CommitContent, RepoDigest, VersionControl};
use crate::mail::notary::MailCorroboration;
use crate::peers::{gather_corroborations, CorroborationRecord, PeerDescriptor, PeerNotary};
use crate::publish::{publish_all, PublishTarget, PushReport, RetryPolicy};
use crate::stamp::{validate_stamp_reply, StampRequest};
use crate::status::{save_report, CycleKind, CycleReport, PeerSummary};
use crate::worktree::{rotate_hashes, write_mail_receipt, MAIL_RECEIPT};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub commit_branch: String,
    pub peers: Vec<PeerDescriptor>,
    pub peer_timeout: Duration,
    pub force_after_intervals: u32,
    pub targets: Vec<PublishTarget>,
    pub retry: RetryPolicy,
    /// Request a mail timestamp every N cycles in addition to forced commits
    pub mail_every_intervals: Option<u32>,
    pub status_file: Option<PathBuf>,
}

/// Runs one scheduling cycle: snapshot, corroborate, commit, push.
///
/// Every repository write goes through `run_cycle`, which takes `&mut self`,
/// so two cycles can never interleave their commits.
pub struct Orchestrator<V, N> {
    vcs: V,
    notary: N,
    mail: Option<Box<dyn MailCorroboration>>,
    settings: OrchestratorSettings,
    force: ForceCounter,
    consecutive_forced: u32,
    cycles: u64,
    /// A periodic mail timestamp fell due and no commit has carried it yet
    mail_owed: bool,
    /// Whether `hashes.log` in the work tree is already part of a commit
    hashes_committed: bool,
}

impl<V: VersionControl, N: PeerNotary> Orchestrator<V, N> {
    pub fn new(vcs: V, notary: N, settings: OrchestratorSettings) -> Self {
        Self {
            force: ForceCounter::new(settings.force_after_intervals),
            vcs,
            notary,
            mail: None,
            settings,
            consecutive_forced: 0,
            cycles: 0,
            mail_owed: false,
            hashes_committed: true,
        }
    }

    pub fn with_mail(mut self, mail: Box<dyn MailCorroboration>) -> Self {
        self.mail = Some(mail);
        self
    }

    /// Continue counting from a report written before a restart.
    pub fn resume_from(&mut self, report: &CycleReport) {
        self.force = ForceCounter::resume(self.settings.force_after_intervals, report.force_elapsed);
        self.consecutive_forced = report.consecutive_forced;
        info!(
            "Resumed force counter at {}/{} from last cycle ({})",
            self.force.elapsed(),
            self.force.threshold(),
            report.trigger
        );
    }

    pub fn force_counter(&self) -> &ForceCounter {
        &self.force
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Run the cycle scheduled for `trigger`. Never fails: problems are
    /// logged and recorded in the returned report.
    pub async fn run_cycle(&mut self, trigger: DateTime<Utc>) -> CycleReport {
        let started_at = Utc::now();
        self.cycles += 1;
        if self.periodic_mail_due() {
            self.mail_owed = true;
        }
        info!("Starting timestamp cycle for {}", trigger);

        let mut report = CycleReport {
            trigger,
            started_at,
            finished_at: started_at,
            kind: CycleKind::Failed,
            commit: None,
            corroborations: vec![],
            pushes: vec![],
            force_elapsed: 0,
            consecutive_forced: 0,
            mail_requested: false,
            error: None,
        };

        if let Err(e) = self.execute(trigger, &mut report).await {
            error!("Cycle for {} aborted: {}", trigger, e);
            report.kind = CycleKind::Failed;
            report.error = Some(e.to_string());
        }

        report.finished_at = Utc::now();
        report.force_elapsed = self.force.elapsed();
        report.consecutive_forced = self.consecutive_forced;

        if let Some(path) = &self.settings.status_file {
            if let Err(e) = save_report(&report, path) {
                warn!("Could not persist cycle report: {:#}", e);
            }
        }

        info!(
            "Cycle for {} finished as {:?} in {:.1}s",
            trigger,
            report.kind,
            (report.finished_at - started_at).num_milliseconds() as f64 / 1000.0
        );
        report
    }

    async fn execute(
        &mut self,
        trigger: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let branch = self.settings.commit_branch.clone();
        let digest = self
            .vcs
            .current_digest(&branch)
            .await
            .map_err(CycleError::Snapshot)?;

        let Some(digest) = digest else {
            info!("Branch {} has no commits yet, creating the first one", branch);
            let commit = self
                .commit(trigger, None, &[], CycleKind::Bootstrap, &[])
                .await?;
            report.kind = CycleKind::Bootstrap;
            report.commit = Some(commit);
            report.pushes = self.publish().await;
            return Ok(());
        };
        debug!("Snapshot of {}: commit {} tree {}", branch, digest.commit, digest.tree);

        let records = self.corroborate(&digest).await;
        report.corroborations = records.iter().map(PeerSummary::from).collect();
        let stamps: Vec<String> = records
            .iter()
            .filter_map(|r| r.stamp_commit.clone())
            .collect();

        let kind = if self.settings.peers.is_empty() {
            CycleKind::Uncorroborated
        } else {
            match self.force.decide(!stamps.is_empty()) {
                ForceDecision::Corroborated => {
                    info!(
                        "{}/{} peer(s) corroborated {}",
                        stamps.len(),
                        records.len(),
                        digest.commit
                    );
                    CycleKind::Corroborated
                }
                ForceDecision::Forced { after_intervals } => {
                    let in_a_row = self.consecutive_forced + 1;
                    if in_a_row >= 2 {
                        error!(
                            "Forcing commit: no peer reachable for {} interval(s), {} forced commits in a row",
                            after_intervals, in_a_row
                        );
                    } else {
                        warn!(
                            "Forcing commit: no peer reachable for {} interval(s)",
                            after_intervals
                        );
                    }
                    CycleKind::Forced
                }
                ForceDecision::Skip { remaining } => {
                    info!(
                        "No peer corroborated {}; commit forced in {} more interval(s)",
                        digest.commit, remaining
                    );
                    self.force.missed();
                    report.kind = CycleKind::Skipped;
                    return Ok(());
                }
            }
        };

        let commit = match self
            .commit(trigger, Some(&digest), &stamps, kind, &records)
            .await
        {
            Ok(commit) => commit,
            Err(e) => {
                // The interval still counts as one without a commit
                if !self.settings.peers.is_empty() {
                    self.force.missed();
                }
                return Err(e);
            }
        };
        self.force.committed();
        self.consecutive_forced = match kind {
            CycleKind::Forced => self.consecutive_forced + 1,
            _ => 0,
        };
        report.kind = kind;
        report.commit = Some(commit.clone());

        if let Some(mail) = &self.mail {
            if kind == CycleKind::Forced || self.mail_owed {
                report.mail_requested = mail.request(&commit);
                if report.mail_requested {
                    self.mail_owed = false;
                }
            }
        }

        report.pushes = self.publish().await;
        Ok(())
    }

    /// Fan out to peers, then fold the replies that arrived in time into
    /// their branches. Repository writes only start after the join.
    async fn corroborate(&self, digest: &RepoDigest) -> Vec<CorroborationRecord> {
        let mut requests = Vec::with_capacity(self.settings.peers.len());
        let mut unavailable = Vec::new();
        for peer in &self.settings.peers {
            match self.vcs.branch_head(&peer.branch_name).await {
                Ok(parent) => requests.push((
                    peer.clone(),
                    StampRequest {
                        commit: digest.commit.clone(),
                        tree: digest.tree.clone(),
                        parent,
                    },
                )),
                Err(e) => {
                    // Without the branch head the reply could not be linear
                    warn!("Cannot read branch {}: {}", peer.branch_name, e);
                    unavailable.push(CorroborationRecord::failed(
                        peer.clone(),
                        StampRequest {
                            commit: digest.commit.clone(),
                            tree: digest.tree.clone(),
                            parent: None,
                        },
                        PeerError::Transport(e.to_string()),
                    ));
                }
            }
        }

        let mut records =
            gather_corroborations(&self.notary, requests, self.settings.peer_timeout).await;

        for record in records.iter_mut().filter(|r| r.is_success()) {
            match self.fold(record).await {
                Ok(id) => {
                    info!("Recorded stamp {} on branch {}", id, record.peer.branch_name);
                    record.stamp_commit = Some(id);
                }
                Err(e) => {
                    warn!("Discarding reply from {}: {}", record.peer.branch_name, e);
                    record.reject(e);
                }
            }
        }

        records.extend(unavailable);
        records
    }

    async fn fold(&self, record: &CorroborationRecord) -> Result<String, PeerError> {
        let reply = record
            .signed_reply
            .as_deref()
            .ok_or_else(|| PeerError::Malformed("empty reply".to_string()))?;
        validate_stamp_reply(&record.request, reply)?;

        let id = self
            .vcs
            .write_commit_object(reply)
            .await
            .map_err(|e| PeerError::Malformed(e.to_string()))?;
        self.vcs
            .verify_commit(&id)
            .await
            .map_err(|e| PeerError::Malformed(format!("signature check failed: {}", e)))?;
        self.vcs
            .update_branch(&record.peer.branch_name, &id)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;
        Ok(id)
    }

    async fn commit(
        &mut self,
        trigger: DateTime<Utc>,
        digest: Option<&RepoDigest>,
        stamps: &[String],
        kind: CycleKind,
        records: &[CorroborationRecord],
    ) -> Result<String, CycleError> {
        let workdir = self.vcs.workdir().to_path_buf();
        let io_err = |e: std::io::Error| CycleError::CommitCreation(e.into());

        let (log_path, recorded) = rotate_hashes(&workdir, !self.hashes_committed).map_err(io_err)?;
        self.hashes_committed = false;
        let mut paths = vec![log_path];

        if let Some(mail) = &self.mail {
            if let Some(receipt) = mail.receipt() {
                write_mail_receipt(&workdir, &receipt).map_err(io_err)?;
                mail.acknowledge(&receipt);
            }
        }
        if workdir.join(MAIL_RECEIPT).exists() {
            paths.push(PathBuf::from(MAIL_RECEIPT));
        }

        let message = commit_message(trigger, kind, recorded, records, self.settings.force_after_intervals);
        let mut parents: Vec<String> = digest.map(|d| d.commit.clone()).into_iter().collect();
        parents.extend(stamps.iter().cloned());

        let id = self
            .vcs
            .create_commit(&CommitContent { message, paths }, &parents)
            .await
            .map_err(CycleError::CommitCreation)?;
        self.vcs
            .update_branch(&self.settings.commit_branch, &id)
            .await
            .map_err(CycleError::CommitCreation)?;
        self.hashes_committed = true;

        info!(
            "Committed {} on {} ({:?}, {} stamped id(s), {} corroboration(s))",
            id,
            self.settings.commit_branch,
            kind,
            recorded,
            stamps.len()
        );
        Ok(id)
    }

    async fn publish(&self) -> Vec<PushReport> {
        if self.settings.targets.is_empty() {
            return vec![];
        }
        publish_all(&self.vcs, &self.settings.targets, self.settings.retry).await
    }

    fn periodic_mail_due(&self) -> bool {
        self.mail.is_some()
            && self
                .settings
                .mail_every_intervals
                .map(|n| n > 0 && self.cycles % u64::from(n) == 0)
                .unwrap_or(false)
    }
}

fn commit_message(
    trigger: DateTime<Utc>,
    kind: CycleKind,
    recorded: usize,
    records: &[CorroborationRecord],
    force_after: u32,
) -> String {
    let mut message = format!(
        "Timestamp {}\n\nRecorded {} stamped commit id(s) in this interval.\n",
        trigger.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        recorded
    );
    match kind {
        CycleKind::Forced => message.push_str(&format!(
            "Forced after {} interval(s) without peer corroboration.\n",
            force_after
        )),
        CycleKind::Bootstrap => message.push_str("Initial commit.\n"),
        _ => {}
    }

    if !records.is_empty() {
        message.push('\n');
        for record in records {
            match &record.stamp_commit {
                Some(id) => message.push_str(&format!(
                    "Corroborated-by: {} {}\n",
                    record.peer.branch_name, id
                )),
                None => message.push_str(&format!(
                    "Not-corroborated-by: {} ({:?})\n",
                    record.peer.branch_name, record.outcome
                )),
            }
        }
    }
    message
}

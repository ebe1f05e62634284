use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DaemonConfig;
use crate::git::{GitCli, Identity, VersionControl};
use crate::interval::Schedule;
use crate::mail::{MailNotary, MailSettings, SmtpImapTransport};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::peers::{HttpNotary, PeerNotary};
use crate::publish::RetryPolicy;
use crate::signature::GpgVerifier;
use crate::status::{load_report, CycleReport};

/// Drives the orchestrator along the commit grid.
///
/// The next trigger is owned by the loop and always derived from the
/// previous trigger, never from accumulated sleeps, so late wake-ups do not
/// shift the grid.
pub struct SchedulerLoop<V, N, C> {
    schedule: Schedule,
    orchestrator: Orchestrator<V, N>,
    clock: Arc<C>,
    next: DateTime<Utc>,
}

impl<V, N, C> SchedulerLoop<V, N, C>
where
    V: VersionControl,
    N: PeerNotary,
    C: Clock,
{
    pub fn new(schedule: Schedule, orchestrator: Orchestrator<V, N>, clock: Arc<C>) -> Self {
        let next = schedule.next_trigger(clock.now());
        Self {
            schedule,
            orchestrator,
            clock,
            next,
        }
    }

    pub fn next_trigger(&self) -> DateTime<Utc> {
        self.next
    }

    pub fn orchestrator(&self) -> &Orchestrator<V, N> {
        &self.orchestrator
    }

    /// Sleep until the next trigger and run one cycle.
    pub async fn step(&mut self) -> CycleReport {
        self.clock.sleep_until(self.next).await;
        self.fire().await
    }

    /// Run cycles until `shutdown` resolves. A running cycle is always
    /// finished; shutdown only takes effect while waiting for the next one.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            info!("Next timestamp cycle at {}", self.next);
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping scheduler");
                    return;
                }
                _ = self.clock.sleep_until(self.next) => {}
            }
            self.fire().await;
        }
    }

    async fn fire(&mut self) -> CycleReport {
        let trigger = self.next;
        let report = self.orchestrator.run_cycle(trigger).await;
        self.next = self.advance(trigger);
        report
    }

    fn advance(&self, trigger: DateTime<Utc>) -> DateTime<Utc> {
        let (next, skipped) = next_after(&self.schedule, trigger, self.clock.now());
        if let Some(skipped) = skipped {
            warn!(
                "Cycle for {} overran; skipping {} interval(s) and running once now",
                trigger, skipped
            );
        }
        next
    }
}

/// The trigger following `trigger` as seen at `now`, plus the number of
/// grid points given up when the cycle overran. A grid point that is due
/// right now is on time. Otherwise the loop fires once at `now`, which
/// stands in for one of the missed points; the following computation
/// realigns to the grid.
fn next_after(
    schedule: &Schedule,
    trigger: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Option<u64>) {
    let scheduled = schedule.next_trigger(trigger);
    if scheduled >= now {
        return (scheduled, None);
    }
    let missed = schedule.intervals_between(scheduled, now);
    (now, Some(missed.saturating_sub(1)))
}

/// Build the production collaborators from `config` and run until
/// `shutdown` resolves.
pub async fn run_daemon_loop<F>(config: DaemonConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let schedule = config.schedule()?;
    let peers = config.peers()?;
    info!(
        "Commit interval {:?} at offset {:?}, {} peer(s), force after {} interval(s)",
        schedule.period(),
        schedule.offset(),
        peers.len(),
        config.force_after_intervals
    );

    let vcs = GitCli::new(
        config.repository.clone(),
        Identity {
            name: config.identity_name.clone(),
            email: config.identity_email.clone(),
            keyid: config.keyid.clone(),
        },
        Duration::from_secs(config.git_timeout_secs),
    );
    let notary = HttpNotary::new(config.peer_timeout()).context("Failed to build HTTP client")?;

    let settings = OrchestratorSettings {
        commit_branch: config.commit_branch.clone(),
        targets: config.publish_targets(&peers),
        peers,
        peer_timeout: config.peer_timeout(),
        force_after_intervals: config.force_after_intervals,
        retry: RetryPolicy {
            attempts: config.push_attempts,
            initial_backoff: Duration::from_secs(config.push_backoff_secs),
        },
        mail_every_intervals: config.active_stamper().and_then(|s| s.every_intervals),
        status_file: Some(config.status_file.clone()),
    };
    let mut orchestrator = Orchestrator::new(vcs, notary, settings);

    if let Some(stamper) = config.active_stamper() {
        let transport = SmtpImapTransport::from_config(stamper)?;
        let mail = MailNotary::new(
            transport,
            GpgVerifier::default(),
            Arc::new(SystemClock),
            MailSettings::from(stamper),
        );
        info!("Mail notary enabled via {}", stamper.to);
        orchestrator = orchestrator.with_mail(Box::new(mail));
    } else {
        info!("Mail notary not configured");
    }

    if let Some(report) = load_report(&config.status_file)? {
        orchestrator.resume_from(&report);
    }

    let mut scheduler = SchedulerLoop::new(schedule, orchestrator, Arc::new(SystemClock));
    scheduler.run_until(shutdown).await;
    Ok(())
}

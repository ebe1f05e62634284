use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::interval::{parse_duration, Schedule};
use crate::peers::{parse_peer_list, PeerDescriptor};
use crate::publish::PublishTarget;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub identity_name: String,
    pub identity_email: String,
    /// tracing `EnvFilter` directive, e.g. `info,zeitgitter_daemon::peers=debug`
    pub debug_level: String,
    pub repository: PathBuf,
    pub commit_branch: String,
    /// GnuPG key used to sign the daemon's own commits
    pub keyid: Option<String>,
    pub commit_interval: String,
    pub commit_offset: Option<String>,
    pub force_after_intervals: u32,
    pub push_repository: Vec<String>,
    pub push_branch: Vec<String>,
    /// `branch=URL` pairs
    pub upstream_timestamp: Vec<String>,
    pub peer_timeout_secs: u64,
    pub push_attempts: u32,
    pub push_backoff_secs: u64,
    pub git_timeout_secs: u64,
    pub status_file: PathBuf,
    pub stamper: Option<StamperConfig>,
}

/// Legacy mail notary credentials. Every field is needed to activate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StamperConfig {
    pub own_address: String,
    pub keyid: String,
    pub to: String,
    pub from: String,
    pub imap_server: String,
    pub smtp_server: String,
    pub username: String,
    pub password: String,
    pub dovecot_bug_workaround: bool,
    pub window_secs: u64,
    pub poll_secs: u64,
    /// Also request a mail timestamp every N cycles, not only on force-commits
    pub every_intervals: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity_name: "Zeitgitter Timestamper".to_string(),
            identity_email: "timestamper@localhost".to_string(),
            debug_level: "info".to_string(),
            repository: PathBuf::from("/var/lib/zeitgitter/repo"),
            commit_branch: "main".to_string(),
            keyid: None,
            commit_interval: "1h".to_string(),
            commit_offset: None,
            force_after_intervals: 6,
            push_repository: vec![],
            push_branch: vec!["*".to_string()],
            upstream_timestamp: vec![],
            peer_timeout_secs: 60,
            push_attempts: 3,
            push_backoff_secs: 5,
            git_timeout_secs: 120,
            status_file: PathBuf::from("/var/lib/zeitgitter/status.json"),
            stamper: None,
        }
    }
}

impl Default for StamperConfig {
    fn default() -> Self {
        Self {
            own_address: String::new(),
            keyid: "70B61F81".to_string(),
            to: "clock@stamper.itconsult.co.uk".to_string(),
            from: "mailer@stamper.itconsult.co.uk".to_string(),
            imap_server: String::new(),
            smtp_server: String::new(),
            username: String::new(),
            password: String::new(),
            dovecot_bug_workaround: true,
            window_secs: 15 * 60,
            poll_secs: 60,
            every_intervals: None,
        }
    }
}

impl DaemonConfig {
    pub fn schedule(&self) -> Result<Schedule> {
        let period = parse_duration(&self.commit_interval)?;
        let offset = self
            .commit_offset
            .as_deref()
            .map(parse_duration)
            .transpose()?;
        Ok(Schedule::new(period, offset)?)
    }

    pub fn peers(&self) -> Result<Vec<PeerDescriptor>> {
        Ok(parse_peer_list(&self.upstream_timestamp)?)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    /// One target per remote, each carrying the full branch list. `*`
    /// expands to the commit branch plus every peer branch.
    pub fn publish_targets(&self, peers: &[PeerDescriptor]) -> Vec<PublishTarget> {
        let mut branches: Vec<String> = Vec::new();
        for branch in &self.push_branch {
            if branch == "*" {
                branches.push(self.commit_branch.clone());
                branches.extend(peers.iter().map(|p| p.branch_name.clone()));
            } else {
                branches.push(branch.clone());
            }
        }
        let mut seen = std::collections::HashSet::new();
        branches.retain(|b| seen.insert(b.clone()));

        self.push_repository
            .iter()
            .map(|remote| PublishTarget {
                remote_name: remote.clone(),
                branches: branches.clone(),
            })
            .collect()
    }

    /// The stamper section, only when it carries a complete credential set.
    pub fn active_stamper(&self) -> Option<&StamperConfig> {
        self.stamper.as_ref().filter(|s| s.is_complete())
    }
}

impl StamperConfig {
    pub fn is_complete(&self) -> bool {
        [
            &self.own_address,
            &self.keyid,
            &self.to,
            &self.from,
            &self.imap_server,
            &self.smtp_server,
            &self.username,
            &self.password,
        ]
        .iter()
        .all(|field| !field.trim().is_empty())
    }
}

/// Values coming from the command line or environment. Anything set here
/// wins over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub identity_name: Option<String>,
    pub identity_email: Option<String>,
    pub debug_level: Option<String>,
    pub repository: Option<PathBuf>,
    pub commit_branch: Option<String>,
    pub keyid: Option<String>,
    pub commit_interval: Option<String>,
    pub commit_offset: Option<String>,
    pub force_after_intervals: Option<u32>,
    pub push_repository: Vec<String>,
    pub push_branch: Vec<String>,
    pub upstream_timestamp: Vec<String>,
    pub peer_timeout_secs: Option<u64>,
    pub push_attempts: Option<u32>,
    pub push_backoff_secs: Option<u64>,
    pub git_timeout_secs: Option<u64>,
    pub status_file: Option<PathBuf>,
    pub stamper_own_address: Option<String>,
    pub stamper_keyid: Option<String>,
    pub stamper_to: Option<String>,
    pub stamper_from: Option<String>,
    pub stamper_imap_server: Option<String>,
    pub stamper_smtp_server: Option<String>,
    pub stamper_username: Option<String>,
    pub stamper_password: Option<String>,
    pub no_dovecot_bug_workaround: bool,
}

pub fn apply_overrides(config: &mut DaemonConfig, overrides: ConfigOverrides) {
    fn set<T>(target: &mut T, value: Option<T>) {
        if let Some(value) = value {
            *target = value;
        }
    }

    set(&mut config.identity_name, overrides.identity_name);
    set(&mut config.identity_email, overrides.identity_email);
    set(&mut config.debug_level, overrides.debug_level);
    set(&mut config.repository, overrides.repository);
    set(&mut config.commit_branch, overrides.commit_branch);
    set(&mut config.commit_interval, overrides.commit_interval);
    set(&mut config.force_after_intervals, overrides.force_after_intervals);
    set(&mut config.peer_timeout_secs, overrides.peer_timeout_secs);
    set(&mut config.push_attempts, overrides.push_attempts);
    set(&mut config.push_backoff_secs, overrides.push_backoff_secs);
    set(&mut config.git_timeout_secs, overrides.git_timeout_secs);
    set(&mut config.status_file, overrides.status_file);
    if overrides.keyid.is_some() {
        config.keyid = overrides.keyid;
    }
    if overrides.commit_offset.is_some() {
        config.commit_offset = overrides.commit_offset;
    }
    if !overrides.push_repository.is_empty() {
        config.push_repository = overrides.push_repository;
    }
    if !overrides.push_branch.is_empty() {
        config.push_branch = overrides.push_branch;
    }
    if !overrides.upstream_timestamp.is_empty() {
        config.upstream_timestamp = overrides.upstream_timestamp;
    }

    let stamper_given = overrides.stamper_own_address.is_some()
        || overrides.stamper_keyid.is_some()
        || overrides.stamper_to.is_some()
        || overrides.stamper_from.is_some()
        || overrides.stamper_imap_server.is_some()
        || overrides.stamper_smtp_server.is_some()
        || overrides.stamper_username.is_some()
        || overrides.stamper_password.is_some()
        || overrides.no_dovecot_bug_workaround;
    if stamper_given {
        let stamper = config.stamper.get_or_insert_with(StamperConfig::default);
        set(&mut stamper.own_address, overrides.stamper_own_address);
        set(&mut stamper.keyid, overrides.stamper_keyid);
        set(&mut stamper.to, overrides.stamper_to);
        set(&mut stamper.from, overrides.stamper_from);
        set(&mut stamper.imap_server, overrides.stamper_imap_server);
        set(&mut stamper.smtp_server, overrides.stamper_smtp_server);
        set(&mut stamper.username, overrides.stamper_username);
        set(&mut stamper.password, overrides.stamper_password);
        if overrides.no_dovecot_bug_workaround {
            stamper.dovecot_bug_workaround = false;
        }
    }
}

pub fn load_config(path: Option<&std::path::Path>) -> Result<DaemonConfig> {
    let config = if let Some(config_path) = path {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

            toml::from_str::<DaemonConfig>(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?
        } else {
            #[cfg(not(test))]
            tracing::warn!("Config file not found at {:?}, using defaults", config_path);
            DaemonConfig::default()
        }
    } else {
        #[cfg(not(test))]
        tracing::info!("No config path provided, using defaults");
        DaemonConfig::default()
    };

    Ok(config)
}

/// Load the file, layer the overrides on top, then validate the result.
pub fn resolve_config(
    path: Option<&std::path::Path>,
    overrides: ConfigOverrides,
) -> Result<DaemonConfig> {
    let mut config = load_config(path)?;
    apply_overrides(&mut config, overrides);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &DaemonConfig) -> Result<()> {
    if config.identity_name.trim().is_empty() || config.identity_email.trim().is_empty() {
        anyhow::bail!("identity_name and identity_email must be set");
    }

    if config.commit_branch.trim().is_empty() {
        anyhow::bail!("commit_branch cannot be empty");
    }

    if config.force_after_intervals == 0 {
        anyhow::bail!("force_after_intervals must be at least 1");
    }

    if config.push_attempts == 0 {
        anyhow::bail!("push_attempts must be at least 1");
    }

    if config.peer_timeout_secs == 0 {
        anyhow::bail!("peer_timeout_secs must be at least 1");
    }

    let schedule = config.schedule()?;
    if config.peer_timeout() >= schedule.period() {
        return Err(crate::error::ScheduleError::PeerTimeoutTooLong {
            timeout: config.peer_timeout(),
            period: schedule.period(),
        }
        .into());
    }

    let peers = config.peers()?;
    if peers.iter().any(|p| p.branch_name == config.commit_branch) {
        anyhow::bail!(
            "upstream_timestamp branch must differ from commit_branch '{}'",
            config.commit_branch
        );
    }

    if let Some(stamper) = &config.stamper {
        if !stamper.is_complete() {
            anyhow::bail!(
                "stamper section is incomplete: own_address, keyid, to, from, imap_server, smtp_server, username and password are all required"
            );
        }
        if stamper.window_secs == 0 || stamper.poll_secs == 0 {
            anyhow::bail!("stamper window_secs and poll_secs must be at least 1");
        }
        if stamper.every_intervals == Some(0) {
            anyhow::bail!("stamper every_intervals must be at least 1");
        }
    }

    Ok(())
}

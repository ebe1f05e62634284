use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zeitgitter_daemon::config::{resolve_config, ConfigOverrides};

#[derive(Parser, Debug)]
#[command(name = "zeitgitterd")]
#[command(about = "Zeitgitter timestamping daemon: periodic cross-notarized commits", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "ZEITGITTER_CONFIG")]
    config: Option<PathBuf>,

    /// Author and committer name of the timestamp commits
    #[arg(long, env = "ZEITGITTER_IDENTITY_NAME")]
    identity_name: Option<String>,

    #[arg(long, env = "ZEITGITTER_IDENTITY_EMAIL")]
    identity_email: Option<String>,

    /// Log filter, e.g. "info,zeitgitter_daemon::peers=debug"
    #[arg(long, env = "ZEITGITTER_DEBUG_LEVEL")]
    debug_level: Option<String>,

    /// Work tree of the timestamp repository
    #[arg(long, value_name = "DIR", env = "ZEITGITTER_REPOSITORY")]
    repository: Option<PathBuf>,

    #[arg(long, env = "ZEITGITTER_COMMIT_BRANCH")]
    commit_branch: Option<String>,

    /// GnuPG key id used to sign the timestamp commits
    #[arg(long, env = "ZEITGITTER_KEYID")]
    keyid: Option<String>,

    /// Commit period, e.g. "1h" or "10m"
    #[arg(long, env = "ZEITGITTER_COMMIT_INTERVAL")]
    commit_interval: Option<String>,

    /// Position inside each period, e.g. "3m5s"; random if unset
    #[arg(long, env = "ZEITGITTER_COMMIT_OFFSET")]
    commit_offset: Option<String>,

    /// Commit without corroboration after this many intervals
    #[arg(long, env = "ZEITGITTER_FORCE_AFTER_INTERVALS")]
    force_after_intervals: Option<u32>,

    /// Remote to push to (repeatable)
    #[arg(long, env = "ZEITGITTER_PUSH_REPOSITORY", value_delimiter = ',')]
    push_repository: Vec<String>,

    /// Branch to push, "*" for the commit branch plus all peer branches
    #[arg(long, env = "ZEITGITTER_PUSH_BRANCH", value_delimiter = ',')]
    push_branch: Vec<String>,

    /// Peer as branch=URL (repeatable)
    #[arg(long, env = "ZEITGITTER_UPSTREAM_TIMESTAMP")]
    upstream_timestamp: Vec<String>,

    #[arg(long, env = "ZEITGITTER_PEER_TIMEOUT_SECS")]
    peer_timeout_secs: Option<u64>,

    /// Push attempts per remote before giving up for this cycle
    #[arg(long, env = "ZEITGITTER_PUSH_ATTEMPTS")]
    push_attempts: Option<u32>,

    /// Initial delay between push attempts, doubled on each retry
    #[arg(long, env = "ZEITGITTER_PUSH_BACKOFF_SECS")]
    push_backoff_secs: Option<u64>,

    #[arg(long, env = "ZEITGITTER_GIT_TIMEOUT_SECS")]
    git_timeout_secs: Option<u64>,

    #[arg(long, value_name = "FILE", env = "ZEITGITTER_STATUS_FILE")]
    status_file: Option<PathBuf>,

    #[arg(long, env = "ZEITGITTER_STAMPER_OWN_ADDRESS")]
    stamper_own_address: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_KEYID")]
    stamper_keyid: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_TO")]
    stamper_to: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_FROM")]
    stamper_from: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_IMAP_SERVER")]
    stamper_imap_server: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_SMTP_SERVER")]
    stamper_smtp_server: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_USERNAME")]
    stamper_username: Option<String>,

    #[arg(long, env = "ZEITGITTER_STAMPER_PASSWORD", hide_env_values = true)]
    stamper_password: Option<String>,

    /// Search IMAP with the full reply address instead of a truncated one
    #[arg(long, env = "ZEITGITTER_NO_DOVECOT_BUG_WORKAROUND")]
    no_dovecot_bug_workaround: bool,
}

impl From<Args> for ConfigOverrides {
    fn from(args: Args) -> Self {
        Self {
            identity_name: args.identity_name,
            identity_email: args.identity_email,
            debug_level: args.debug_level,
            repository: args.repository,
            commit_branch: args.commit_branch,
            keyid: args.keyid,
            commit_interval: args.commit_interval,
            commit_offset: args.commit_offset,
            force_after_intervals: args.force_after_intervals,
            push_repository: args.push_repository,
            push_branch: args.push_branch,
            upstream_timestamp: args.upstream_timestamp,
            peer_timeout_secs: args.peer_timeout_secs,
            push_attempts: args.push_attempts,
            push_backoff_secs: args.push_backoff_secs,
            git_timeout_secs: args.git_timeout_secs,
            status_file: args.status_file,
            stamper_own_address: args.stamper_own_address,
            stamper_keyid: args.stamper_keyid,
            stamper_to: args.stamper_to,
            stamper_from: args.stamper_from,
            stamper_imap_server: args.stamper_imap_server,
            stamper_smtp_server: args.stamper_smtp_server,
            stamper_username: args.stamper_username,
            stamper_password: args.stamper_password,
            no_dovecot_bug_workaround: args.no_dovecot_bug_workaround,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let mut args = Args::parse();
    let config_path = args.config.take();

    // Load configuration; logging is set up from it, so errors go to stderr
    let config = resolve_config(config_path.as_deref(), args.into())?;

    // Initialize logging with timestamps and levels
    let filter = EnvFilter::try_new(&config.debug_level)
        .with_context(|| format!("Invalid debug_level '{}'", config.debug_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .init();

    info!("Zeitgitter timestamping daemon v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration file: {:?}", path);
    }

    // Display configuration summary
    info!("Repository: {:?}", config.repository);
    info!("Commit branch: {}", config.commit_branch);
    info!("Identity: {} <{}>", config.identity_name, config.identity_email);
    info!(
        "Commit interval: {} (offset {})",
        config.commit_interval,
        config.commit_offset.as_deref().unwrap_or("random")
    );
    info!("Force after intervals: {}", config.force_after_intervals);
    info!("Peers: {:?}", config.upstream_timestamp);
    info!("Peer timeout: {} seconds", config.peer_timeout_secs);
    info!(
        "Push attempts: {} (backoff {} seconds), git timeout: {} seconds",
        config.push_attempts, config.push_backoff_secs, config.git_timeout_secs
    );
    info!("Push repositories: {:?}", config.push_repository);
    info!("Push branches: {:?}", config.push_branch);
    info!("Status file: {:?}", config.status_file);
    info!(
        "Signing key: {}",
        config.keyid.as_deref().unwrap_or("none (unsigned commits)")
    );

    // Run startup validation
    info!("Running startup validation...");
    if let Err(e) = zeitgitter_daemon::startup::run_startup_checks(&config) {
        error!("Startup validation failed: {:#}", e);
        return Err(e);
    }
    info!("Startup validation complete");

    // Run the daemon main loop
    if let Err(e) = zeitgitter_daemon::run_daemon_loop(config, shutdown_signal()).await {
        error!("Daemon loop error: {:#}", e);
        return Err(e);
    }

    info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::Path;
use std::process::Command;

use crate::config::DaemonConfig;

/// Oldest git release with everything the daemon shells out to.
pub const MIN_GIT_MAJOR: u32 = 2;

pub fn check_git_version() -> Result<(u32, u32, u32)> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .context("Failed to execute git --version. Is git installed and in PATH?")?;

    if !output.status.success() {
        return Err(anyhow!("git --version command failed"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (major, minor, patch) = parse_git_version(&stdout)
        .ok_or_else(|| anyhow!("Failed to parse git version from output: {}", stdout))?;

    if major < MIN_GIT_MAJOR {
        return Err(anyhow!(
            "git version {}.{}.{} is too old. Version {}.0 or higher is required.",
            major,
            minor,
            patch,
            MIN_GIT_MAJOR
        ));
    }

    Ok((major, minor, patch))
}

/// Parse output like "git version 2.43.0" or "git version 2.39.3 (Apple Git-146)".
pub fn parse_git_version(output: &str) -> Option<(u32, u32, u32)> {
    let re = Regex::new(r"git version[^\d]*(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
    let caps = re.captures(output)?;
    let major = caps[1].parse().ok()?;
    let minor = caps[2].parse().ok()?;
    let patch = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
    Some((major, minor, patch))
}

pub fn check_repository(path: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .args(["rev-parse", "--is-inside-work-tree"])
        .output()
        .with_context(|| format!("Failed to run git in {}", path.display()))?;

    if !output.status.success() || String::from_utf8_lossy(&output.stdout).trim() != "true" {
        return Err(anyhow!(
            "{} is not a git work tree: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// gpg signs our own commits (with `keyid`) and checks mail receipts.
pub fn gpg_required(config: &DaemonConfig) -> bool {
    config.keyid.is_some() || config.active_stamper().is_some()
}

pub fn check_gpg() -> Result<String> {
    let output = Command::new("gpg")
        .arg("--version")
        .output()
        .context("Failed to execute gpg --version. Is GnuPG installed and in PATH?")?;

    if !output.status.success() {
        return Err(anyhow!("gpg --version command failed"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Everything the daemon needs from the host before the first cycle.
pub fn run_startup_checks(config: &DaemonConfig) -> Result<()> {
    let (major, minor, patch) = check_git_version()?;
    tracing::info!("git version: {}.{}.{}", major, minor, patch);

    check_repository(&config.repository)?;
    tracing::info!("Repository: {}", config.repository.display());

    if gpg_required(config) {
        let version = check_gpg()?;
        tracing::info!("{}", version);
    }
    Ok(())
}

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::VcsError;
use crate::stamp::valid_commit_id;

/// Commit and tree of the branch head that peers are asked to stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoDigest {
    pub commit: String,
    pub tree: String,
}

/// Files (relative to the work tree) to stage, plus the commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitContent {
    pub message: String,
    pub paths: Vec<PathBuf>,
}

/// The only repository operations the engine performs.
pub trait VersionControl: Send + Sync {
    fn workdir(&self) -> &Path;

    /// Head of `branch`, or `None` if the branch has no commit yet.
    fn current_digest(
        &self,
        branch: &str,
    ) -> impl Future<Output = Result<Option<RepoDigest>, VcsError>> + Send;

    fn branch_head(
        &self,
        branch: &str,
    ) -> impl Future<Output = Result<Option<String>, VcsError>> + Send;

    /// Store a raw commit object and return its id.
    fn write_commit_object(
        &self,
        raw: &str,
    ) -> impl Future<Output = Result<String, VcsError>> + Send;

    fn verify_commit(&self, id: &str) -> impl Future<Output = Result<(), VcsError>> + Send;

    fn create_commit(
        &self,
        content: &CommitContent,
        parents: &[String],
    ) -> impl Future<Output = Result<String, VcsError>> + Send;

    fn update_branch(
        &self,
        branch: &str,
        commit: &str,
    ) -> impl Future<Output = Result<(), VcsError>> + Send;

    fn push(
        &self,
        remote: &str,
        branches: &[String],
    ) -> impl Future<Output = Result<(), VcsError>> + Send;
}

/// Author and committer identity, plus the optional signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub keyid: Option<String>,
}

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    identity: Identity,
    timeout: Duration,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>, identity: Identity, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            identity,
            timeout,
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<std::process::Output, VcsError> {
        let command_line = format!("git {}", args.join(" "));
        debug!("Running {}", command_line);

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.workdir)
            .args(args)
            .env("GIT_AUTHOR_NAME", &self.identity.name)
            .env("GIT_AUTHOR_EMAIL", &self.identity.email)
            .env("GIT_COMMITTER_NAME", &self.identity.name)
            .env("GIT_COMMITTER_EMAIL", &self.identity.email)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VcsError::Timeout {
                command: command_line.clone(),
                timeout: self.timeout,
            })??;

        Ok(output)
    }

    /// Run and require success, returning trimmed stdout.
    async fn run_ok(&self, args: &[&str], stdin: Option<&str>) -> Result<String, VcsError> {
        let output = self.run(args, stdin).await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                command: format!("git {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn object_id(raw: String) -> Result<String, VcsError> {
        if valid_commit_id(&raw) {
            Ok(raw)
        } else {
            Err(VcsError::InvalidOutput(format!("expected an object id, got '{}'", raw)))
        }
    }
}

impl VersionControl for GitCli {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn current_digest(&self, branch: &str) -> Result<Option<RepoDigest>, VcsError> {
        let Some(commit) = self.branch_head(branch).await? else {
            return Ok(None);
        };
        let tree_spec = format!("{}^{{tree}}", commit);
        let tree = Self::object_id(self.run_ok(&["rev-parse", &tree_spec], None).await?)?;
        Ok(Some(RepoDigest { commit, tree }))
    }

    async fn branch_head(&self, branch: &str) -> Result<Option<String>, VcsError> {
        let spec = format!("refs/heads/{}^{{commit}}", branch);
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec], None).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Self::object_id(id).map(Some)
    }

    async fn write_commit_object(&self, raw: &str) -> Result<String, VcsError> {
        let id = self
            .run_ok(&["hash-object", "-t", "commit", "-w", "--stdin"], Some(raw))
            .await?;
        Self::object_id(id)
    }

    async fn verify_commit(&self, id: &str) -> Result<(), VcsError> {
        self.run_ok(&["verify-commit", id], None).await.map(|_| ())
    }

    async fn create_commit(
        &self,
        content: &CommitContent,
        parents: &[String],
    ) -> Result<String, VcsError> {
        if !content.paths.is_empty() {
            let mut add: Vec<&str> = vec!["add", "--"];
            let paths: Vec<String> = content
                .paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            add.extend(paths.iter().map(|p| p.as_str()));
            self.run_ok(&add, None).await?;
        }

        let tree = Self::object_id(self.run_ok(&["write-tree"], None).await?)?;

        let sign_arg = self.identity.keyid.as_ref().map(|k| format!("-S{}", k));
        let mut args: Vec<&str> = vec!["commit-tree", &tree];
        for parent in parents {
            args.push("-p");
            args.push(parent);
        }
        if let Some(sign) = &sign_arg {
            args.push(sign);
        }
        args.push("-F");
        args.push("-");

        let id = self.run_ok(&args, Some(&content.message)).await?;
        Self::object_id(id)
    }

    async fn update_branch(&self, branch: &str, commit: &str) -> Result<(), VcsError> {
        let refname = format!("refs/heads/{}", branch);
        self.run_ok(&["update-ref", &refname, commit], None)
            .await
            .map(|_| ())
    }

    async fn push(&self, remote: &str, branches: &[String]) -> Result<(), VcsError> {
        let mut args: Vec<&str> = vec!["push", "--quiet", remote];
        args.extend(branches.iter().map(|b| b.as_str()));
        self.run_ok(&args, None).await.map(|_| ())
    }
}

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::MailError;

const SIGNED_MESSAGE_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

/// Checks a clear-signed text and reports who signed it.
pub trait SignatureVerifier: Send + Sync + 'static {
    /// Returns the signer's key fingerprint (or long key id) on a good
    /// signature.
    fn verify(&self, signed_text: &str) -> impl Future<Output = Result<String, MailError>> + Send;
}

/// Runs `gpg --verify` against the local keyring.
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    pub program: PathBuf,
    pub gnupg_home: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for GpgVerifier {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gpg"),
            gnupg_home: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl SignatureVerifier for GpgVerifier {
    async fn verify(&self, signed_text: &str) -> Result<String, MailError> {
        let mut cmd = Command::new(&self.program);
        if let Some(home) = &self.gnupg_home {
            cmd.arg("--homedir").arg(home);
        }
        cmd.args(["--batch", "--status-fd", "1", "--verify"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| MailError::Unverifiable(format!("cannot run gpg: {}", e)))?;

        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(signed_text.as_bytes()).await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                MailError::Unverifiable(format!("gpg timed out after {:?}", self.timeout))
            })?
            .map_err(|e| MailError::Unverifiable(e.to_string()))?;

        let status = String::from_utf8_lossy(&output.stdout);
        valid_signer(&status).ok_or_else(|| {
            MailError::Unverifiable(
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("no valid signature")
                    .to_string(),
            )
        })
    }
}

/// The first clear-signed block of a mail body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearSigned {
    /// What the signature covers, with dash-escaping undone
    pub signed_text: String,
    /// The armored block from its header line through the signature end
    pub armored: String,
}

/// Cut the clear-signed block out of `body`. Quoted text, footers and
/// anything else around the block are not covered by the signature and are
/// dropped. Returns `None` unless the block is complete.
pub fn extract_clearsigned(body: &str) -> Option<ClearSigned> {
    let mut lines = body.lines();
    lines.by_ref().find(|line| line.trim_end() == SIGNED_MESSAGE_BEGIN)?;
    let mut armored = vec![SIGNED_MESSAGE_BEGIN];

    // Armor headers (Hash: ...) end at the first blank line
    loop {
        let line = lines.next()?;
        armored.push(line);
        if line.trim().is_empty() {
            break;
        }
    }

    let mut signed = Vec::new();
    loop {
        let line = lines.next()?;
        armored.push(line);
        if line.trim_end() == SIGNATURE_BEGIN {
            break;
        }
        signed.push(line.strip_prefix("- ").unwrap_or(line));
    }

    loop {
        let line = lines.next()?;
        armored.push(line);
        if line.trim_end() == SIGNATURE_END {
            break;
        }
    }

    let mut armored = armored.join("\n");
    armored.push('\n');
    Some(ClearSigned {
        signed_text: signed.join("\n"),
        armored,
    })
}

/// Extract the signer from gpg `--status-fd` output. Only a VALIDSIG line
/// counts; GOODSIG alone is not enough since expired keys report it too.
pub fn valid_signer(status_output: &str) -> Option<String> {
    status_output.lines().find_map(|line| {
        let rest = line.strip_prefix("[GNUPG:] VALIDSIG ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Whether `signer` (fingerprint or long id) belongs to the short or long
/// key id given in the configuration.
pub fn signer_matches(signer: &str, keyid: &str) -> bool {
    let keyid = keyid.trim().trim_start_matches("0x");
    !keyid.is_empty() && signer.to_uppercase().ends_with(&keyid.to_uppercase())
}

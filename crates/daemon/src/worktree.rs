//! Files the daemon maintains in the repository work tree.
//!
//! The stamping front end appends every commit id it signs to `hashes.work`.
//! At commit time that file is rotated into `hashes.log`, so each daemon
//! commit records exactly the ids stamped during its interval.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::mail::MailReceipt;
use crate::stamp::valid_commit_id;

pub const HASHES_WORK: &str = "hashes.work";
pub const HASHES_LOG: &str = "hashes.log";
pub const MAIL_RECEIPT: &str = "mail-timestamp.asc";

/// Valid commit ids waiting in `hashes.work`.
pub fn pending_hashes(workdir: &Path) -> io::Result<Vec<String>> {
    read_hashes(&workdir.join(HASHES_WORK))
}

fn read_hashes(path: &Path) -> io::Result<Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };

    let mut hashes = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if valid_commit_id(line) {
            hashes.push(line.to_string());
        } else {
            warn!("Ignoring malformed entry in {}: {:?}", path.display(), line);
        }
    }
    Ok(hashes)
}

/// Move the pending ids into `hashes.log`. The work file is renamed away
/// first, so ids appended while rotating land in a fresh `hashes.work` for
/// the next interval. With `keep_existing` the ids already in `hashes.log`
/// (from a commit attempt that failed) are kept in front. Returns the path
/// to stage and the number of ids recorded.
pub fn rotate_hashes(workdir: &Path, keep_existing: bool) -> io::Result<(PathBuf, usize)> {
    let work = workdir.join(HASHES_WORK);
    let rotating = workdir.join(format!("{}.rotating", HASHES_WORK));
    match fs::rename(&work, &rotating) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut hashes = if keep_existing {
        read_hashes(&workdir.join(HASHES_LOG))?
    } else {
        vec![]
    };
    hashes.extend(read_hashes(&rotating)?);

    let mut contents = hashes.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    write_atomically(&workdir.join(HASHES_LOG), contents.as_bytes())?;

    match fs::remove_file(&rotating) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    Ok((PathBuf::from(HASHES_LOG), hashes.len()))
}

/// Store a mail notary receipt so the next commit carries it.
pub fn write_mail_receipt(workdir: &Path, receipt: &MailReceipt) -> io::Result<PathBuf> {
    let mut contents = format!(
        "Digest: {}\nSigner: {}\nReceived: {}\n\n",
        receipt.digest,
        receipt.signer,
        receipt.received_at.to_rfc3339()
    );
    contents.push_str(&receipt.signed_text);
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    write_atomically(&workdir.join(MAIL_RECEIPT), contents.as_bytes())?;
    Ok(PathBuf::from(MAIL_RECEIPT))
}

/// Write via a temporary sibling and rename, so readers never see a
/// partial file.
pub fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!("{}.tmp", file_name));

    let mut file = fs::File::create(&temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)
}

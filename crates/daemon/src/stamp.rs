//! Validation for the `stamp-branch-v1` notary exchange.
//!
//! A peer answers with a complete git commit object whose parents tie its
//! branch history to the commit we asked it to stamp. Nothing a peer returns
//! is written to the repository before it passes [`validate_stamp_reply`].

use regex::Regex;
use std::sync::OnceLock;

use crate::error::PeerError;

fn commit_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{40}$").unwrap())
}

fn branch_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[a-z][-._a-z0-9]{0,99}$").unwrap())
}

/// Lowercase 40-hex SHA-1 object id.
pub fn valid_commit_id(id: &str) -> bool {
    // `$` would accept a trailing newline in some engines; be explicit
    !id.contains('\n') && commit_id_re().is_match(id)
}

/// Branch (and tag) names a notary will accept.
pub fn valid_branch_name(name: &str) -> bool {
    !name.contains('\n') && !name.contains("..") && branch_name_re().is_match(name)
}

/// What we asked a peer to stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampRequest {
    pub commit: String,
    pub tree: String,
    /// Current head of the peer's branch, if it already exists.
    pub parent: Option<String>,
}

impl StampRequest {
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("request", "stamp-branch-v1".to_string()),
            ("commit", self.commit.clone()),
            ("tree", self.tree.clone()),
        ];
        if let Some(parent) = &self.parent {
            form.push(("parent", parent.clone()));
        }
        form
    }

    pub fn expected_parents(&self) -> Vec<&str> {
        match &self.parent {
            Some(parent) => vec![parent.as_str(), self.commit.as_str()],
            None => vec![self.commit.as_str()],
        }
    }
}

/// Check a peer's reply before it is written as an object.
///
/// The header must name our tree, carry exactly the expected parents in
/// order, and include a `gpgsig` header. The signature itself is checked
/// by the repository collaborator after the object is written.
pub fn validate_stamp_reply(request: &StampRequest, reply: &str) -> Result<(), PeerError> {
    let malformed = |msg: String| PeerError::Malformed(msg);

    let (header, _message) = reply
        .split_once("\n\n")
        .ok_or_else(|| malformed("reply has no commit message".to_string()))?;

    let mut lines = header.lines();
    let tree = lines
        .next()
        .and_then(|l| l.strip_prefix("tree "))
        .ok_or_else(|| malformed("reply does not start with a tree line".to_string()))?;
    if tree != request.tree {
        return Err(malformed(format!(
            "reply tree {} does not match requested {}",
            tree, request.tree
        )));
    }

    let mut parents = Vec::new();
    let mut has_signature = false;
    for line in lines {
        if let Some(parent) = line.strip_prefix("parent ") {
            parents.push(parent);
        } else if line.starts_with("gpgsig ") {
            has_signature = true;
        }
    }

    if parents != request.expected_parents() {
        return Err(malformed(format!(
            "reply parents {:?} do not match expected {:?}",
            parents,
            request.expected_parents()
        )));
    }

    if !has_signature {
        return Err(malformed("reply is not signed".to_string()));
    }

    Ok(())
}

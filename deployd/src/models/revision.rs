//! Revisions and change sets

use std::fmt;

use serde::{Deserialize, Serialize};

/// Content of the remote marker when the target has never been deployed to
pub const NEVER_DEPLOYED: &str = "-1";

/// A commit identifier, the never-deployed sentinel, or unresolved.
///
/// Revisions are compared for equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Parse a commit hash. Accepts exactly 40 lowercase hex chars after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if is_commit_hash(trimmed) {
            Some(Self(trimmed.to_string()))
        } else {
            None
        }
    }

    /// The `-1` sentinel: target path exists but was never deployed to
    pub fn never_deployed() -> Self {
        Self(NEVER_DEPLOYED.to_string())
    }

    /// The empty, unresolved revision
    pub fn unresolved() -> Self {
        Self(String::new())
    }

    pub fn is_never_deployed(&self) -> bool {
        self.0 == NEVER_DEPLOYED
    }

    pub fn is_unresolved(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_commit(&self) -> bool {
        is_commit_hash(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Kind of change reported for a single path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Copied,
    Modified,
    Renamed,
    Deleted,
}

impl ChangeKind {
    /// Map a git name-status code. Unknown codes yield `None`.
    pub fn from_status(code: char) -> Option<Self> {
        match code {
            'A' => Some(ChangeKind::Added),
            'C' => Some(ChangeKind::Copied),
            'M' => Some(ChangeKind::Modified),
            'R' => Some(ChangeKind::Renamed),
            'D' => Some(ChangeKind::Deleted),
            _ => None,
        }
    }

    /// Whether the path has to be uploaded (as opposed to deleted)
    pub fn is_upload(&self) -> bool {
        !matches!(self, ChangeKind::Deleted)
    }
}

/// One changed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub path: String,
}

impl ChangeEntry {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Parse one `<status><TAB?>path` diff line.
    ///
    /// The line is trimmed, the first char is the status, the trimmed rest is
    /// the path. Blank lines and unknown status codes yield `None`.
    pub fn parse_diff_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let mut chars = line.chars();
        let status = chars.next()?;
        let kind = ChangeKind::from_status(status)?;
        let path = chars.as_str().trim();
        Some(Self::new(kind, path))
    }

    /// Parse a whole diff listing, skipping blank and unrecognized lines
    pub fn parse_diff<S: AsRef<str>>(lines: &[S]) -> Vec<Self> {
        lines
            .iter()
            .filter_map(|line| Self::parse_diff_line(line.as_ref()))
            .collect()
    }
}

/// Changed files partitioned by the operation to perform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub to_upload: Vec<String>,
    pub to_delete: Vec<String>,
}

impl ChangeSet {
    /// Single-pass partition preserving the reported order
    pub fn partition(entries: &[ChangeEntry]) -> Self {
        let mut set = ChangeSet::default();
        for entry in entries {
            if entry.kind.is_upload() {
                set.to_upload.push(entry.path.clone());
            } else {
                set.to_delete.push(entry.path.clone());
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_upload.len() + self.to_delete.len()
    }
}

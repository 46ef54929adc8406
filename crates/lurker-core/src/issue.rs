use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::RepoId;

/// Lifecycle of an issue being processed.
///
/// The poller only ever creates issues in `Pending`; every other
/// transition is driven by an operator command or a worker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueStatus {
    Pending,
    Reacted,
    Cloning,
    CloneReady,
    ClaudeRunning,
    Ready,
    Failed,
    Paused,
}

impl IssueStatus {
    /// True while an automated pipeline run is underway.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Reacted | Self::Cloning | Self::CloneReady | Self::ClaudeRunning
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reacted => "reacted",
            Self::Cloning => "cloning",
            Self::CloneReady => "cloned",
            Self::ClaudeRunning => "claude",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// A hosting-side issue as discovered by the poller (subset of fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownIssue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default, rename = "html_url")]
    pub url: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
}

impl KnownIssue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    /// Label names as a comma-separated string.
    pub fn label_names(&self) -> String {
        self.labels
            .iter()
            .map(|label| label.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The per-issue record owned by the orchestrator.
///
/// Mutated only by the orchestrator (status, workdir, error) in
/// response to events or operator commands.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedIssue {
    pub repo: RepoId,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: String,
    pub url: String,
    pub status: IssueStatus,
    pub workdir: PathBuf,
    pub last_error: String,
    pub started_at: OffsetDateTime,
}

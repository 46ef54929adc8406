use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::{KnownIssue, RepoId};

/// Default bus capacity. Producers block when the bus is full: progress
/// is precious and dropping would lose user-visible history.
pub const EVENT_BUS_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    PollStart,
    PollDone,
    IssueFound,
    Reacted,
    CloneStart,
    CloneDone,
    ClaudeStart,
    ClaudeLog,
    ClaudeDone,
    Ready,
    Error,
}

/// Extra payload carried by `IssueFound`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub url: String,
    pub body: String,
    pub labels: String,
}

/// Pipeline progress, sent from workers and pollers to the presentation.
///
/// `issue_number` 0 denotes a repository-level event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub repo: RepoId,
    pub issue_number: u64,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<IssueDetails>,
}

impl Event {
    pub fn repo_level(kind: EventKind, repo: RepoId, text: impl Into<String>) -> Self {
        Self::issue(kind, repo, 0, text)
    }

    pub fn issue(kind: EventKind, repo: RepoId, number: u64, text: impl Into<String>) -> Self {
        Self {
            kind,
            repo,
            issue_number: number,
            text: text.into(),
            timestamp: OffsetDateTime::now_utc(),
            details: None,
        }
    }

    pub fn issue_found(repo: RepoId, issue: &KnownIssue) -> Self {
        Self {
            kind: EventKind::IssueFound,
            repo,
            issue_number: issue.number,
            text: issue.title.clone(),
            timestamp: OffsetDateTime::now_utc(),
            details: Some(IssueDetails {
                url: issue.url.clone(),
                body: issue.body.clone(),
                labels: issue.label_names(),
            }),
        }
    }

    pub fn is_repo_level(&self) -> bool {
        self.issue_number == 0
    }
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Bounded FIFO with single-consumer semantics.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

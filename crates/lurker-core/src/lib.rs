use thiserror::Error;

mod event;
mod identifiers;
mod issue;
mod repo_config;
mod state_store;

pub use event::{
    event_channel, Event, EventKind, EventReceiver, EventSender, IssueDetails, EVENT_BUS_CAPACITY,
};
pub use identifiers::{issue_key, RepoId};
pub use issue::{IssueStatus, KnownIssue, Label, TrackedIssue};
pub use repo_config::{RepoConfig, REPO_CONFIG_RELATIVE_PATH};
pub use state_store::{DurableState, StateStore};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

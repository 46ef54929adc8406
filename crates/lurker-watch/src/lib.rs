use thiserror::Error;

mod actions;
mod agent;
mod git;
mod orchestrator;
mod poller;
mod worker;

pub use actions::{approve_issue, takeover_invocation};
pub use agent::{
    agent_invocation, build_prompt, format_stream_event, interactive_invocation, AgentSettings,
    DEFAULT_AGENT_BINARY, SCRUBBED_ENV_VARS,
};
pub use git::{branch_has_commits, derive_issue_status, issue_branch, WorkdirLayout};
pub use orchestrator::{Orchestrator, RepoRecord};
pub use poller::RepoPoller;
pub use worker::IssueWorker;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("unknown issue: {0}")]
    UnknownIssue(String),
    #[error("filesystem error at {path}: {message}")]
    Filesystem { path: String, message: String },
    #[error(transparent)]
    Core(#[from] lurker_core::CoreError),
    #[error(transparent)]
    Runtime(#[from] lurker_runtime::RuntimeError),
}

pub type WatchResult<T> = Result<T, WatchError>;

impl WatchError {
    pub(crate) fn filesystem(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::Filesystem {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    }
}

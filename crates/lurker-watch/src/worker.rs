use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lurker_core::{Event, EventKind, EventSender, KnownIssue, RepoConfig, RepoId};
use lurker_github::HostingClient;
use lurker_runtime::ShellSession;

use crate::agent::{self, AgentSettings};
use crate::git::{issue_branch, WorkdirLayout};

const REACTION: &str = "eyes";

/// Executes one cancellable pipeline for one issue: react, materialise
/// the working tree, run the agent, report readiness.
///
/// The worker checks its token between stages and at every await; a
/// cancelled worker returns silently (the pause that cancelled it has
/// already moved the status to paused).
pub struct IssueWorker {
    repo: RepoId,
    issue: KnownIssue,
    session: Arc<ShellSession>,
    client: Arc<HostingClient>,
    events: EventSender,
    layout: WorkdirLayout,
    agent: AgentSettings,
}

impl IssueWorker {
    pub fn new(
        repo: RepoId,
        issue: KnownIssue,
        session: Arc<ShellSession>,
        client: Arc<HostingClient>,
        events: EventSender,
        layout: WorkdirLayout,
        agent: AgentSettings,
    ) -> Self {
        Self {
            repo,
            issue,
            session,
            client,
            events,
            layout,
            agent,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let number = self.issue.number;

        // React with eyes. Courtesy-only: failure is logged but never
        // aborts the pipeline.
        match self.client.add_reaction(&self.repo, number, REACTION).await {
            Ok(()) => {
                if !self
                    .emit(&cancel, EventKind::Reacted, number, "Added 👀 reaction")
                    .await
                {
                    return;
                }
            }
            Err(error) => {
                if cancel.is_cancelled() {
                    return;
                }
                if !self
                    .emit(
                        &cancel,
                        EventKind::Error,
                        number,
                        format!("React failed: {error}"),
                    )
                    .await
                {
                    return;
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        // Materialise the working tree.
        if !self
            .emit(&cancel, EventKind::CloneStart, number, "Cloning repository...")
            .await
        {
            return;
        }

        let workdir = self.layout.worktree_dir(&self.repo, number);
        match self.materialize_worktree(&cancel).await {
            Outcome::Done => {}
            Outcome::Cancelled => return,
            Outcome::Failed(message) => {
                if cancel.is_cancelled() {
                    return;
                }
                self.emit(
                    &cancel,
                    EventKind::Error,
                    number,
                    format!("Clone failed: {message}"),
                )
                .await;
                return;
            }
        }

        if !self
            .emit(
                &cancel,
                EventKind::CloneDone,
                number,
                workdir.display().to_string(),
            )
            .await
        {
            return;
        }

        if cancel.is_cancelled() {
            return;
        }

        // Per-repo agent config; absent or unparseable is the default.
        let repo_config = RepoConfig::load(&workdir);

        if !self
            .emit(&cancel, EventKind::ClaudeStart, number, "Running Claude Code...")
            .await
        {
            return;
        }

        match self.run_agent(&cancel, &repo_config).await {
            Outcome::Done => {
                if self
                    .emit(
                        &cancel,
                        EventKind::ClaudeDone,
                        number,
                        "Claude finished successfully",
                    )
                    .await
                {
                    self.emit(
                        &cancel,
                        EventKind::Ready,
                        number,
                        workdir.display().to_string(),
                    )
                    .await;
                }
            }
            Outcome::Cancelled => {}
            Outcome::Failed(message) => {
                if cancel.is_cancelled() {
                    return;
                }
                if self
                    .emit(
                        &cancel,
                        EventKind::ClaudeDone,
                        number,
                        format!("Claude failed: {message}"),
                    )
                    .await
                {
                    self.emit(&cancel, EventKind::Error, number, message).await;
                }
            }
        }
    }

    /// Two-level clone scheme: one shared bare repository per repo,
    /// one issue worktree cut from it. Idempotent across retries: an
    /// existing worktree is only fetched.
    async fn materialize_worktree(&self, cancel: &CancellationToken) -> Outcome {
        let number = self.issue.number;
        let bare = self.layout.bare_dir(&self.repo);
        let workdir = self.layout.worktree_dir(&self.repo, number);
        let issue_dir = self.layout.issue_dir(&self.repo, number);

        if !bare.exists() {
            if let Some(parent) = bare.parent() {
                if let Err(error) = tokio::fs::create_dir_all(parent).await {
                    return Outcome::Failed(format!("mkdir {}: {error}", parent.display()));
                }
            }
            let clone = format!(
                "gh repo clone {} {} -- --bare",
                agent::shell_quote(self.repo.as_str()),
                agent::shell_quote(&bare.display().to_string()),
            );
            match self.run_step(cancel, "bare clone", &clone).await {
                Outcome::Done => {}
                other => return other,
            }
        } else {
            let fetch = format!(
                "git -C {} fetch origin",
                agent::shell_quote(&bare.display().to_string())
            );
            match self.run_step(cancel, "git fetch", &fetch).await {
                Outcome::Done => {}
                other => return other,
            }
        }

        if workdir.exists() {
            let fetch = format!(
                "git -C {} fetch origin",
                agent::shell_quote(&workdir.display().to_string())
            );
            return self.run_step(cancel, "worktree fetch", &fetch).await;
        }

        if let Err(error) = tokio::fs::create_dir_all(&issue_dir).await {
            return Outcome::Failed(format!("mkdir {}: {error}", issue_dir.display()));
        }

        let add = format!(
            "git -C {} worktree add -b {} {}",
            agent::shell_quote(&bare.display().to_string()),
            issue_branch(number),
            agent::shell_quote(&workdir.display().to_string()),
        );
        self.run_step(cancel, "worktree add", &add).await
    }

    async fn run_agent(&self, cancel: &CancellationToken, repo_config: &RepoConfig) -> Outcome {
        let number = self.issue.number;
        let workdir = self.layout.worktree_dir(&self.repo, number);
        let prompt_path = self.layout.prompt_path(&self.repo, number);

        let mut prompt = agent::build_prompt(&self.repo, &self.issue);
        if !repo_config.prompt_prefix.is_empty() {
            prompt = format!("{}\n\n{prompt}", repo_config.prompt_prefix);
        }
        if let Err(error) = tokio::fs::write(&prompt_path, prompt).await {
            return Outcome::Failed(format!(
                "writing prompt {}: {error}",
                prompt_path.display()
            ));
        }

        let tools = repo_config.agent_tools(&self.agent.default_tools);
        let invocation = agent::agent_invocation(&self.agent.binary, &workdir, &tools, &prompt_path);

        let mut handle = match self.session.run(&invocation) {
            Ok(handle) => handle,
            Err(error) => return Outcome::Failed(format!("starting agent: {error}")),
        };

        let mut lines_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.session.cancel_command();
                    return Outcome::Cancelled;
                }
                exit = &mut handle.exit => {
                    return match exit {
                        Ok(0) => Outcome::Done,
                        Ok(code) => {
                            Outcome::Failed(format!("claude exited with status {code}"))
                        }
                        Err(_) => Outcome::Failed("agent shell exited mid-run".to_owned()),
                    };
                }
                line = handle.lines.recv(), if lines_open => {
                    match line {
                        Some(line) => {
                            for formatted in agent::format_stream_event(&line) {
                                if !self
                                    .emit(cancel, EventKind::ClaudeLog, number, formatted)
                                    .await
                                {
                                    return Outcome::Cancelled;
                                }
                            }
                        }
                        None => lines_open = false,
                    }
                }
            }
        }
    }

    /// Runs one clone-stage command inside the shell session.
    async fn run_step(&self, cancel: &CancellationToken, label: &str, command: &str) -> Outcome {
        match self.session.run_to_completion(command, cancel).await {
            Ok(None) => Outcome::Cancelled,
            Ok(Some(0)) => Outcome::Done,
            Ok(Some(code)) => Outcome::Failed(format!("{label} exited with status {code}")),
            Err(error) => Outcome::Failed(format!("{label}: {error}")),
        }
    }

    /// Sends an event unless cancelled. Returns false when the worker
    /// should stop (cancellation observed or the bus is gone).
    async fn emit(
        &self,
        cancel: &CancellationToken,
        kind: EventKind,
        number: u64,
        text: impl Into<String>,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let event = Event::issue(kind, self.repo.clone(), number, text);
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

enum Outcome {
    Done,
    Cancelled,
    Failed(String),
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use lurker_core::{
    issue_key, DurableState, Event, EventKind, EventSender, IssueStatus, KnownIssue, RepoId,
    StateStore, TrackedIssue,
};
use lurker_github::HostingClient;
use lurker_runtime::ShellSession;

use crate::agent::AgentSettings;
use crate::git::{self, WorkdirLayout};
use crate::poller::RepoPoller;
use crate::worker::IssueWorker;
use crate::{WatchError, WatchResult};

/// A watched repository as surfaced to the presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoRecord {
    pub repo: RepoId,
    pub last_poll_error: Option<String>,
}

struct Inner {
    state: DurableState,
    known: HashMap<String, KnownIssue>,
    tracked: Vec<TrackedIssue>,
    pollers: HashMap<RepoId, CancellationToken>,
    workers: HashMap<String, CancellationToken>,
    sessions: HashMap<String, Arc<ShellSession>>,
    repo_errors: HashMap<RepoId, String>,
}

/// Owns all long-lived state: the repository set, the known-issue map,
/// the tracked-issue array, live cancellation scopes, shell sessions,
/// and the durable state store.
///
/// The in-memory maps sit behind one coarse mutex that is never held
/// across I/O; persistence is serialised separately by `store_guard`.
pub struct Orchestrator {
    layout: WorkdirLayout,
    poll_interval: Duration,
    agent: AgentSettings,
    client: Arc<HostingClient>,
    events: EventSender,
    store: StateStore,
    store_guard: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    inner: Mutex<Inner>,
}

impl Orchestrator {
    /// Creates the base directory, loads persisted state, and prepares
    /// the orchestrator. Pollers start with [`Self::start`].
    pub fn new(
        base_dir: impl Into<PathBuf>,
        poll_interval: Duration,
        agent: AgentSettings,
        client: Arc<HostingClient>,
        events: EventSender,
    ) -> WatchResult<Arc<Self>> {
        let layout = WorkdirLayout::new(base_dir);
        std::fs::create_dir_all(layout.base_dir())
            .map_err(|error| WatchError::filesystem(layout.base_dir(), error))?;

        let store = StateStore::new(layout.state_path());
        let state = store.load();

        Ok(Arc::new(Self {
            layout,
            poll_interval,
            agent,
            client,
            events,
            store,
            store_guard: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state,
                known: HashMap::new(),
                tracked: Vec::new(),
                pollers: HashMap::new(),
                workers: HashMap::new(),
                sessions: HashMap::new(),
                repo_errors: HashMap::new(),
            }),
        }))
    }

    pub fn layout(&self) -> &WorkdirLayout {
        &self.layout
    }

    /// A producer handle onto the shared event bus, for composite
    /// actions that report progress the same way workers do.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Begins polling every persisted repository.
    pub fn start(self: &Arc<Self>) {
        let repos = {
            let inner = self.lock();
            inner.state.repos.clone()
        };
        for repo in repos {
            self.spawn_poller(repo);
        }
    }

    /// Cancels every poller and worker and disposes all shell sessions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions: Vec<_> = {
            let mut inner = self.lock();
            inner.pollers.clear();
            inner.workers.clear();
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            tokio::task::spawn_blocking(move || session.dispose());
        }
    }

    /// Idempotent: creates the workdir root, persists the repo, and
    /// starts its poller.
    pub async fn add_repository(self: &Arc<Self>, repo: RepoId) -> WatchResult<()> {
        let _guard = self.store_guard.lock().await;

        let snapshot = {
            let mut inner = self.lock();
            if inner.pollers.contains_key(&repo) {
                return Ok(());
            }
            inner.state.add_repo(repo.clone());
            inner.state.clone()
        };

        let repo_dir = self.layout.repo_dir(&repo);
        if let Err(error) = std::fs::create_dir_all(&repo_dir) {
            self.lock().state.remove_repo(&repo);
            return Err(WatchError::filesystem(&repo_dir, error));
        }

        if let Err(error) = self.store.save(&snapshot) {
            self.lock().state.remove_repo(&repo);
            return Err(error.into());
        }

        self.spawn_poller(repo);
        Ok(())
    }

    /// Hard cancel: the poller and all workers for the repo exit, its
    /// shell sessions are hung up, and its known and tracked issues
    /// are dropped.
    pub async fn remove_repository(self: &Arc<Self>, repo: &RepoId) -> WatchResult<()> {
        let _guard = self.store_guard.lock().await;

        let snapshot = {
            let inner = self.lock();
            let mut state = inner.state.clone();
            state.remove_repo(repo);
            state
        };
        self.store.save(&snapshot)?;

        let prefix = format!("{}#", repo.as_str());
        let (poller, workers, sessions) = {
            let mut inner = self.lock();
            inner.state = snapshot;
            let poller = inner.pollers.remove(repo);
            let workers: Vec<_> = {
                let keys: Vec<_> = inner
                    .workers
                    .keys()
                    .filter(|key| key.starts_with(&prefix))
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|key| inner.workers.remove(&key))
                    .collect()
            };
            let sessions: Vec<_> = {
                let keys: Vec<_> = inner
                    .sessions
                    .keys()
                    .filter(|key| key.starts_with(&prefix))
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|key| inner.sessions.remove(&key))
                    .collect()
            };
            inner.known.retain(|key, _| !key.starts_with(&prefix));
            inner.tracked.retain(|issue| issue.repo != *repo);
            inner.repo_errors.remove(repo);
            (poller, workers, sessions)
        };

        if let Some(poller) = poller {
            poller.cancel();
        }
        for worker in workers {
            worker.cancel();
        }
        for session in sessions {
            tokio::task::spawn_blocking(move || session.dispose());
        }
        Ok(())
    }

    /// Launches (or relaunches) the pipeline for a known issue. A live
    /// worker for the same issue is cancelled first; the issue's shell
    /// session is reused when its shell still runs.
    pub fn start_issue(self: &Arc<Self>, repo: &RepoId, number: u64) -> WatchResult<()> {
        let key = issue_key(repo, number);

        let issue = {
            let mut inner = self.lock();
            let issue = inner
                .known
                .get(&key)
                .cloned()
                .ok_or_else(|| WatchError::UnknownIssue(key.clone()))?;
            if let Some(previous) = inner.workers.remove(&key) {
                previous.cancel();
            }
            if let Some(tracked) = inner.tracked.iter_mut().find(|tracked| {
                tracked.repo == *repo && tracked.number == number
            }) {
                tracked.status = IssueStatus::Reacted;
                tracked.last_error.clear();
                tracked.started_at = OffsetDateTime::now_utc();
            }
            issue
        };

        let session = self.ensure_shell_session(repo, number)?;

        let token = self.shutdown.child_token();
        {
            let mut inner = self.lock();
            inner.workers.insert(key, token.clone());
        }

        let worker = IssueWorker::new(
            repo.clone(),
            issue,
            session,
            Arc::clone(&self.client),
            self.events.clone(),
            self.layout.clone(),
            self.agent.clone(),
        );
        tokio::spawn(worker.run(token));
        Ok(())
    }

    /// Cancels the worker scope. The status moves to paused here, by
    /// the operator command itself, never by a worker event; anything
    /// the cancelled worker already enqueued is dropped as stale by
    /// [`Self::apply_event`].
    pub fn pause_issue(&self, repo: &RepoId, number: u64) {
        let key = issue_key(repo, number);
        let token = {
            let mut inner = self.lock();
            if let Some(tracked) = inner.tracked.iter_mut().find(|tracked| {
                tracked.repo == *repo && tracked.number == number
            }) {
                if tracked.status.is_active() {
                    tracked.status = IssueStatus::Paused;
                }
            }
            inner.workers.remove(&key)
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn resume_issue(self: &Arc<Self>, repo: &RepoId, number: u64) -> WatchResult<()> {
        self.start_issue(repo, number)
    }

    /// Restart after failure; clears the last error.
    pub fn retry_issue(self: &Arc<Self>, repo: &RepoId, number: u64) -> WatchResult<()> {
        self.start_issue(repo, number)
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.lock().known.contains_key(key)
    }

    /// Saves a discovered issue so `start_issue` can look it up later.
    pub fn store_issue(&self, repo: &RepoId, issue: KnownIssue) {
        let key = issue_key(repo, issue.number);
        self.lock().known.insert(key, issue);
    }

    /// Records an issue in the durable processed set.
    pub async fn mark_processed(&self, repo: &RepoId, number: u64) -> WatchResult<()> {
        let _guard = self.store_guard.lock().await;
        let snapshot = {
            let mut inner = self.lock();
            if !inner.state.mark_processed(repo, number) {
                return Ok(());
            }
            inner.state.clone()
        };
        if let Err(error) = self.store.save(&snapshot) {
            let mut inner = self.lock();
            if let Some(numbers) = inner.state.processed.get_mut(repo.as_str()) {
                numbers.remove(&number);
            }
            return Err(error.into());
        }
        Ok(())
    }

    /// True when the processed set lists the issue, or (backwards
    /// compatibility) when its issue directory already exists on disk.
    pub fn is_processed(&self, repo: &RepoId, number: u64) -> bool {
        if self.lock().state.is_processed(repo, number) {
            return true;
        }
        self.layout.issue_dir(repo, number).exists()
    }

    /// Filesystem probe for the status an issue should resume with.
    pub async fn derive_issue_status(
        &self,
        repo: &RepoId,
        number: u64,
    ) -> (IssueStatus, PathBuf) {
        git::derive_issue_status(&self.layout, repo, number).await
    }

    /// Interactive-takeover return: commits on the issue branch move
    /// the status to ready, otherwise back to clone-ready.
    pub async fn finish_takeover(&self, repo: &RepoId, number: u64) -> IssueStatus {
        let workdir = self.layout.worktree_dir(repo, number);
        let status = if git::branch_has_commits(&workdir, &git::issue_branch(number)).await {
            IssueStatus::Ready
        } else {
            IssueStatus::CloneReady
        };
        self.set_status(repo, number, status);
        status
    }

    /// Reuses the issue's live shell session or spawns a fresh one in
    /// the issue's directory (the worktree once materialised).
    pub fn ensure_shell_session(
        &self,
        repo: &RepoId,
        number: u64,
    ) -> WatchResult<Arc<ShellSession>> {
        let key = issue_key(repo, number);
        if let Some(existing) = self.lock().sessions.get(&key).cloned() {
            if existing.is_running() {
                return Ok(existing);
            }
        }

        let workdir = {
            let inner = self.lock();
            inner
                .tracked
                .iter()
                .find(|tracked| tracked.repo == *repo && tracked.number == number)
                .map(|tracked| tracked.workdir.clone())
                .filter(|workdir| !workdir.as_os_str().is_empty())
                .unwrap_or_else(|| self.layout.issue_dir(repo, number))
        };
        std::fs::create_dir_all(&workdir)
            .map_err(|error| WatchError::filesystem(&workdir, error))?;

        let session = Arc::new(ShellSession::spawn(&workdir)?);
        self.lock().sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    pub fn shell_session(&self, repo: &RepoId, number: u64) -> Option<Arc<ShellSession>> {
        self.lock().sessions.get(&issue_key(repo, number)).cloned()
    }

    /// Presentation-side funnel for bus events: performs the status
    /// transition an event implies and reports whether the event should
    /// be displayed. Non-`IssueFound` events for paused issues are
    /// stale (their worker was cancelled) and are dropped.
    pub async fn apply_event(&self, event: &Event) -> bool {
        if event.issue_number > 0 && event.kind != EventKind::IssueFound {
            let paused = self
                .issue(&event.repo, event.issue_number)
                .map(|issue| issue.status == IssueStatus::Paused)
                .unwrap_or(false);
            if paused {
                return false;
            }
        }

        match event.kind {
            EventKind::PollStart | EventKind::ClaudeLog | EventKind::ClaudeDone => {}
            EventKind::PollDone => {
                self.lock().repo_errors.remove(&event.repo);
            }
            EventKind::IssueFound => {
                let (status, workdir) =
                    self.derive_issue_status(&event.repo, event.issue_number).await;
                let mut inner = self.lock();
                let exists = inner.tracked.iter().any(|tracked| {
                    tracked.repo == event.repo && tracked.number == event.issue_number
                });
                if !exists {
                    let details = event.details.clone().unwrap_or_default();
                    inner.tracked.push(TrackedIssue {
                        repo: event.repo.clone(),
                        number: event.issue_number,
                        title: event.text.clone(),
                        body: details.body,
                        labels: details.labels,
                        url: details.url,
                        status,
                        workdir,
                        last_error: String::new(),
                        started_at: event.timestamp,
                    });
                }
            }
            EventKind::Reacted => self.set_status(&event.repo, event.issue_number, IssueStatus::Reacted),
            EventKind::CloneStart => {
                self.set_status(&event.repo, event.issue_number, IssueStatus::Cloning)
            }
            EventKind::CloneDone => {
                let mut inner = self.lock();
                if let Some(tracked) = inner.tracked.iter_mut().find(|tracked| {
                    tracked.repo == event.repo && tracked.number == event.issue_number
                }) {
                    tracked.status = IssueStatus::CloneReady;
                    tracked.workdir = PathBuf::from(&event.text);
                }
            }
            EventKind::ClaudeStart => {
                self.set_status(&event.repo, event.issue_number, IssueStatus::ClaudeRunning)
            }
            EventKind::Ready => self.set_status(&event.repo, event.issue_number, IssueStatus::Ready),
            EventKind::Error => {
                if event.is_repo_level() {
                    self.lock()
                        .repo_errors
                        .insert(event.repo.clone(), event.text.clone());
                } else {
                    let mut inner = self.lock();
                    if let Some(tracked) = inner.tracked.iter_mut().find(|tracked| {
                        tracked.repo == event.repo && tracked.number == event.issue_number
                    }) {
                        tracked.status = IssueStatus::Failed;
                        tracked.last_error = event.text.clone();
                    }
                }
            }
        }
        true
    }

    /// The watched repositories in persisted order, with their latest
    /// poll errors.
    pub fn repos(&self) -> Vec<RepoRecord> {
        let inner = self.lock();
        inner
            .state
            .repos
            .iter()
            .map(|repo| RepoRecord {
                repo: repo.clone(),
                last_poll_error: inner.repo_errors.get(repo).cloned(),
            })
            .collect()
    }

    pub fn issues(&self) -> Vec<TrackedIssue> {
        self.lock().tracked.clone()
    }

    pub fn issue(&self, repo: &RepoId, number: u64) -> Option<TrackedIssue> {
        self.lock()
            .tracked
            .iter()
            .find(|tracked| tracked.repo == *repo && tracked.number == number)
            .cloned()
    }

    fn set_status(&self, repo: &RepoId, number: u64, status: IssueStatus) {
        let mut inner = self.lock();
        if let Some(tracked) = inner
            .tracked
            .iter_mut()
            .find(|tracked| tracked.repo == *repo && tracked.number == number)
        {
            tracked.status = status;
        }
    }

    fn spawn_poller(self: &Arc<Self>, repo: RepoId) {
        let token = self.shutdown.child_token();
        {
            let mut inner = self.lock();
            inner.pollers.insert(repo.clone(), token.clone());
        }
        let poller = RepoPoller::new(
            repo,
            self.poll_interval,
            Arc::clone(&self.client),
            self.events.clone(),
            Arc::clone(self),
        );
        tokio::spawn(poller.run(token));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

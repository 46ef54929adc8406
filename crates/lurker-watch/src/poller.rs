use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use lurker_core::{issue_key, Event, EventKind, EventSender, RepoId};
use lurker_github::HostingClient;

use crate::Orchestrator;

/// Per-repository discovery loop. Wakes once at startup and then on the
/// configured interval; never transitions any issue out of pending.
pub struct RepoPoller {
    repo: RepoId,
    interval: Duration,
    client: Arc<HostingClient>,
    events: EventSender,
    orchestrator: Arc<Orchestrator>,
}

impl RepoPoller {
    pub fn new(
        repo: RepoId,
        interval: Duration,
        client: Arc<HostingClient>,
        events: EventSender,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            repo,
            interval,
            client,
            events,
            orchestrator,
        }
    }

    /// Blocks until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.poll(&cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// One discovery tick. Returns false when the poller should exit
    /// (cancelled or the bus is gone).
    async fn poll(&self, cancel: &CancellationToken) -> bool {
        if !self
            .emit(
                cancel,
                Event::repo_level(
                    EventKind::PollStart,
                    self.repo.clone(),
                    "Polling for new issues...",
                ),
            )
            .await
        {
            return false;
        }

        let issues = match self.client.list_open_issues(&self.repo).await {
            Ok(issues) => issues,
            Err(error) => {
                tracing::warn!(repo = %self.repo, %error, "poll failed");
                return self
                    .emit(
                        cancel,
                        Event::repo_level(
                            EventKind::Error,
                            self.repo.clone(),
                            format!("Poll failed: {error}"),
                        ),
                    )
                    .await;
            }
        };

        let total = issues.len();
        let mut new_count = 0_usize;
        for issue in issues {
            let key = issue_key(&self.repo, issue.number);
            if self.orchestrator.is_known(&key) {
                continue;
            }
            self.orchestrator.store_issue(&self.repo, issue.clone());
            if !self
                .emit(cancel, Event::issue_found(self.repo.clone(), &issue))
                .await
            {
                return false;
            }
            new_count += 1;
        }

        self.emit(
            cancel,
            Event::repo_level(
                EventKind::PollDone,
                self.repo.clone(),
                format!("Found {new_count} new issues (of {total} open)"),
            ),
        )
        .await
    }

    /// Sends an event, yielding to cancellation while the bus is full.
    async fn emit(&self, cancel: &CancellationToken, event: Event) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

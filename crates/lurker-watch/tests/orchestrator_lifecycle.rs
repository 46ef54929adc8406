use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tokio::time::timeout;

use lurker_core::{
    event_channel, issue_key, Event, EventKind, EventReceiver, IssueStatus, RepoId,
};
use lurker_github::{HostingClient, HostingClientConfig};
use lurker_watch::{issue_branch, AgentSettings, Orchestrator};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(3600);

fn repo() -> RepoId {
    RepoId::parse("acme/widget").expect("valid repo id")
}

fn hosting_client(server: &MockServer) -> Arc<HostingClient> {
    Arc::new(
        HostingClient::new(HostingClientConfig {
            api_base: server.base_url(),
            token: "test-token".to_owned(),
            request_timeout: Duration::from_secs(5),
            retry_max_attempts: 1,
            retry_base_delay: Duration::from_millis(10),
        })
        .expect("build hosting client"),
    )
}

fn orchestrator(
    base_dir: &Path,
    client: Arc<HostingClient>,
) -> (Arc<Orchestrator>, EventReceiver) {
    let (events_tx, events_rx) = event_channel(128);
    let orchestrator = Orchestrator::new(
        base_dir,
        IDLE_POLL_INTERVAL,
        AgentSettings::default(),
        client,
        events_tx,
    )
    .expect("build orchestrator");
    (orchestrator, events_rx)
}

async fn next_event(events: &mut EventReceiver) -> Event {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event within the timeout")
        .expect("bus still open")
}

async fn next_applied_event(
    orchestrator: &Arc<Orchestrator>,
    events: &mut EventReceiver,
) -> Event {
    let event = next_event(events).await;
    orchestrator.apply_event(&event).await;
    event
}

fn mock_open_issues(server: &MockServer, issues: serde_json::Value) {
    server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widget/issues");
        then.status(200).json_body(issues);
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_persists_the_repo_and_survives_a_restart() {
    let server = MockServer::start();
    mock_open_issues(
        &server,
        json!([
            {"number": 1, "title": "first", "html_url": "https://x/1"},
            {"number": 2, "title": "second", "html_url": "https://x/2"}
        ]),
    );

    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, mut events) = orchestrator(dir.path(), hosting_client(&server));
    orchestrator
        .add_repository(repo())
        .await
        .expect("add repository");

    let poll_start = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(poll_start.kind, EventKind::PollStart);

    let found_one = next_applied_event(&orchestrator, &mut events).await;
    let found_two = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(found_one.kind, EventKind::IssueFound);
    assert_eq!(found_two.kind, EventKind::IssueFound);

    let poll_done = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(poll_done.kind, EventKind::PollDone);
    assert!(poll_done.text.contains("Found 2 new issues (of 2 open)"));

    assert!(orchestrator.is_known(&issue_key(&repo(), 1)));
    assert!(orchestrator.is_known(&issue_key(&repo(), 2)));
    let issues = orchestrator.issues();
    assert_eq!(issues.len(), 2);
    assert!(issues
        .iter()
        .all(|issue| issue.status == IssueStatus::Pending));

    let raw = std::fs::read_to_string(dir.path().join("state.json")).expect("read state.json");
    let state: serde_json::Value = serde_json::from_str(&raw).expect("parse state.json");
    assert_eq!(state["repos"], json!(["acme/widget"]));
    assert_eq!(state["processed"], json!({}));

    // "Kill" the process: drop the orchestrator and start a fresh one
    // over the same base dir. Discovery is always live, so the known
    // set starts empty, but the repo list survives.
    orchestrator.shutdown();
    drop(orchestrator);
    drop(events);

    let (restarted, _events) = self::orchestrator(dir.path(), hosting_client(&server));
    assert!(!restarted.is_known(&issue_key(&repo(), 1)));
    let repos = restarted.repos();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].repo, repo());
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_failure_surfaces_as_a_repo_error_cleared_by_the_next_success() {
    let server = MockServer::start();
    let mut failure = server.mock(|when, then| {
        when.method(GET).path("/repos/acme/widget/issues");
        then.status(404).body("no such repo");
    });

    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, mut events) = orchestrator(dir.path(), hosting_client(&server));
    orchestrator
        .add_repository(repo())
        .await
        .expect("add repository");

    let poll_start = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(poll_start.kind, EventKind::PollStart);
    let error = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(error.kind, EventKind::Error);
    assert!(error.is_repo_level());
    assert!(orchestrator.repos()[0].last_poll_error.is_some());

    // A later successful poll clears the repo-level error.
    failure.delete();
    mock_open_issues(&server, json!([]));
    let done = Event::repo_level(EventKind::PollDone, repo(), "Found 0 new issues (of 0 open)");
    assert!(orchestrator.apply_event(&done).await);
    assert!(orchestrator.repos()[0].last_poll_error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_moves_status_immediately_and_drops_stale_events() {
    let server = MockServer::start();
    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, _events) = orchestrator(dir.path(), hosting_client(&server));

    let issue = lurker_core::KnownIssue {
        number: 4,
        title: "hang".to_owned(),
        ..Default::default()
    };
    orchestrator.store_issue(&repo(), issue.clone());
    orchestrator
        .apply_event(&Event::issue_found(repo(), &issue))
        .await;
    orchestrator
        .apply_event(&Event::issue(EventKind::Reacted, repo(), 4, "Added 👀 reaction"))
        .await;
    assert_eq!(
        orchestrator.issue(&repo(), 4).expect("tracked issue").status,
        IssueStatus::Reacted
    );

    orchestrator.pause_issue(&repo(), 4);
    assert_eq!(
        orchestrator.issue(&repo(), 4).expect("tracked issue").status,
        IssueStatus::Paused
    );

    // A stage event the cancelled worker already enqueued is stale.
    let stale = Event::issue(EventKind::CloneStart, repo(), 4, "Cloning repository...");
    assert!(!orchestrator.apply_event(&stale).await);
    assert_eq!(
        orchestrator.issue(&repo(), 4).expect("tracked issue").status,
        IssueStatus::Paused
    );

    // IssueFound is never suppressed.
    let found = Event::issue_found(repo(), &issue);
    assert!(orchestrator.apply_event(&found).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_issue_requires_a_known_issue() {
    let server = MockServer::start();
    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, _events) = orchestrator(dir.path(), hosting_client(&server));

    let error = orchestrator
        .start_issue(&repo(), 99)
        .expect_err("unknown issue must be rejected");
    assert!(error.to_string().contains("acme/widget#99"));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn started_issue_reacts_then_fails_when_the_clone_cannot_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/repos/acme/widget/issues/3/reactions");
        then.status(201);
    });

    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, mut events) = orchestrator(dir.path(), hosting_client(&server));

    let issue = lurker_core::KnownIssue {
        number: 3,
        title: "broken build".to_owned(),
        ..Default::default()
    };
    orchestrator.store_issue(&repo(), issue.clone());
    orchestrator
        .apply_event(&Event::issue_found(repo(), &issue))
        .await;

    orchestrator.start_issue(&repo(), 3).expect("start issue");
    assert_eq!(
        orchestrator.issue(&repo(), 3).expect("tracked issue").status,
        IssueStatus::Reacted
    );

    // The pipeline reacts, then attempts the bare clone, which cannot
    // succeed against the mock hosting server.
    let reacted = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(reacted.kind, EventKind::Reacted);
    let clone_start = next_applied_event(&orchestrator, &mut events).await;
    assert_eq!(clone_start.kind, EventKind::CloneStart);

    let failure = timeout(TEST_TIMEOUT, async {
        loop {
            let event = next_applied_event(&orchestrator, &mut events).await;
            if event.kind == EventKind::Error {
                return event;
            }
        }
    })
    .await
    .expect("clone failure should surface in time");
    assert_eq!(failure.issue_number, 3);

    let tracked = orchestrator.issue(&repo(), 3).expect("tracked issue");
    assert_eq!(tracked.status, IssueStatus::Failed);
    assert!(!tracked.last_error.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_repository_cascades_and_unlists_the_repo() {
    let server = MockServer::start();
    mock_open_issues(
        &server,
        json!([{"number": 1, "title": "only", "html_url": "https://x/1"}]),
    );

    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, mut events) = orchestrator(dir.path(), hosting_client(&server));
    orchestrator
        .add_repository(repo())
        .await
        .expect("add repository");

    loop {
        let event = next_applied_event(&orchestrator, &mut events).await;
        if event.kind == EventKind::PollDone {
            break;
        }
    }
    assert!(orchestrator.is_known(&issue_key(&repo(), 1)));

    orchestrator
        .remove_repository(&repo())
        .await
        .expect("remove repository");

    assert!(orchestrator.repos().is_empty());
    assert!(orchestrator.issues().is_empty());
    assert!(!orchestrator.is_known(&issue_key(&repo(), 1)));
    assert!(orchestrator.shell_session(&repo(), 1).is_none());

    let raw = std::fs::read_to_string(dir.path().join("state.json")).expect("read state.json");
    let state: serde_json::Value = serde_json::from_str(&raw).expect("parse state.json");
    assert_eq!(state["repos"], json!([]));
}

#[tokio::test(flavor = "multi_thread")]
async fn mark_processed_persists_and_is_processed_checks_the_disk_fallback() {
    let server = MockServer::start();
    let dir = tempfile::tempdir().expect("temp dir");
    let (orchestrator, _events) = orchestrator(dir.path(), hosting_client(&server));

    assert!(!orchestrator.is_processed(&repo(), 42));
    orchestrator
        .mark_processed(&repo(), 42)
        .await
        .expect("mark processed");
    assert!(orchestrator.is_processed(&repo(), 42));

    let raw = std::fs::read_to_string(dir.path().join("state.json")).expect("read state.json");
    assert!(raw.contains("42"));

    // Backwards compatibility: an existing issue directory also counts.
    std::fs::create_dir_all(dir.path().join("acme/widget/43")).expect("seed issue dir");
    assert!(orchestrator.is_processed(&repo(), 43));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn crash_recovery_derives_ready_from_a_preseeded_worktree() {
    async fn git(workdir: &Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(workdir)
            .env("GIT_AUTHOR_NAME", "lurker-test")
            .env("GIT_AUTHOR_EMAIL", "lurker@test.invalid")
            .env("GIT_COMMITTER_NAME", "lurker-test")
            .env("GIT_COMMITTER_EMAIL", "lurker@test.invalid")
            .status()
            .await
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    let server = MockServer::start();
    mock_open_issues(
        &server,
        json!([{"number": 5, "title": "recovered", "html_url": "https://x/5"}]),
    );

    let dir = tempfile::tempdir().expect("temp dir");
    let workdir = dir.path().join("acme/widget/5/widget");
    std::fs::create_dir_all(&workdir).expect("seed workdir");
    git(&workdir, &["init", "--quiet", "-b", "main"]).await;
    std::fs::write(workdir.join("README.md"), "seed").expect("write seed");
    git(&workdir, &["add", "."]).await;
    git(&workdir, &["commit", "--quiet", "-m", "seed"]).await;
    git(&workdir, &["update-ref", "refs/remotes/origin/main", "main"]).await;
    let branch = issue_branch(5);
    git(&workdir, &["checkout", "--quiet", "-b", &branch]).await;
    std::fs::write(workdir.join("fix.txt"), "fix").expect("write fix");
    git(&workdir, &["add", "."]).await;
    git(&workdir, &["commit", "--quiet", "-m", "fix"]).await;

    let (orchestrator, mut events) = orchestrator(dir.path(), hosting_client(&server));
    orchestrator
        .add_repository(repo())
        .await
        .expect("add repository");

    loop {
        let event = next_applied_event(&orchestrator, &mut events).await;
        if event.kind == EventKind::IssueFound {
            break;
        }
    }

    let tracked = orchestrator.issue(&repo(), 5).expect("tracked issue");
    assert_eq!(tracked.status, IssueStatus::Ready);
    assert_eq!(tracked.workdir, workdir);
}

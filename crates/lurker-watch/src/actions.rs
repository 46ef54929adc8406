use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;

use lurker_core::{Event, EventKind, EventSender, TrackedIssue};
use lurker_github::{CreatePullRequest, HostingClient};

use crate::agent;

const PR_BASE_BRANCH: &str = "main";

/// Push the issue branch and open a pull request. Runs as a detached
/// task outside the pipeline state machine; progress and outcome are
/// user-visible log events on the bus.
pub async fn approve_issue(
    client: Arc<HostingClient>,
    events: EventSender,
    issue: TrackedIssue,
) {
    let emit = |text: String| {
        let events = events.clone();
        let repo = issue.repo.clone();
        let number = issue.number;
        async move {
            let _ = events
                .send(Event::issue(EventKind::ClaudeLog, repo, number, text))
                .await;
        }
    };

    emit("🚀 Pushing branch & creating PR...".to_owned()).await;

    if let Err(error) = run_git(&issue.workdir, &["push", "-u", "origin", "HEAD"]).await {
        emit(format!("❌ push: {error}")).await;
        return;
    }

    let branch = match run_git(&issue.workdir, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
        Ok(output) => output.trim().to_owned(),
        Err(error) => {
            emit(format!("❌ branch: {error}")).await;
            return;
        }
    };

    let range = format!("{PR_BASE_BRANCH}..{branch}");
    let commit_log = run_git(&issue.workdir, &["log", "--oneline", &range])
        .await
        .unwrap_or_default();

    let request = CreatePullRequest {
        repo: issue.repo.clone(),
        title: format!("Fix #{}: {}", issue.number, issue.title),
        body: format!(
            "Fixes #{}\n\n## Commits\n```\n{}```\n\n🤖 Generated by lurker",
            issue.number, commit_log
        ),
        head: branch,
        base: PR_BASE_BRANCH.to_owned(),
    };

    match client.create_pull_request(&request).await {
        Ok(pull) => emit(format!("✅ PR: {}", pull.html_url)).await,
        Err(error) => emit(format!("❌ pr: {error}")).await,
    }
}

/// The shell line written into an issue's session before an
/// interactive agent attach; `takeover` resumes the agent's previous
/// conversation.
pub fn takeover_invocation(binary: &str, workdir: &Path, takeover: bool) -> String {
    agent::interactive_invocation(binary, workdir, takeover)
}

async fn run_git(workdir: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .output()
        .await
        .map_err(|error| error.to_string())?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_owned()
        } else {
            stderr.trim().to_owned()
        };
        return Err(format!("git {} failed: {detail}", args.join(" ")));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

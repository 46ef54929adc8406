use std::path::{Path, PathBuf};

use tokio::process::Command;

use lurker_core::{IssueStatus, RepoId};

const BRANCH_PREFIX: &str = "agent/issue-";

/// The branch a worktree is cut on for an issue.
pub fn issue_branch(number: u64) -> String {
    format!("{BRANCH_PREFIX}{number}")
}

/// Path scheme under the base directory:
///
/// ```text
/// <base>/
///   state.json
///   <owner>/<name>/
///     bare.git/
///     <number>/
///       <name>/        (the worktree)
///       prompt.md
///       lurker.log
/// ```
#[derive(Debug, Clone)]
pub struct WorkdirLayout {
    base_dir: PathBuf,
}

impl WorkdirLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.base_dir.join("state.json")
    }

    pub fn repo_dir(&self, repo: &RepoId) -> PathBuf {
        self.base_dir.join(repo.owner()).join(repo.name())
    }

    pub fn bare_dir(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join("bare.git")
    }

    pub fn issue_dir(&self, repo: &RepoId, number: u64) -> PathBuf {
        self.repo_dir(repo).join(number.to_string())
    }

    pub fn worktree_dir(&self, repo: &RepoId, number: u64) -> PathBuf {
        self.issue_dir(repo, number).join(repo.name())
    }

    pub fn log_path(&self, repo: &RepoId, number: u64) -> PathBuf {
        self.issue_dir(repo, number).join("lurker.log")
    }

    pub fn prompt_path(&self, repo: &RepoId, number: u64) -> PathBuf {
        self.issue_dir(repo, number).join("prompt.md")
    }
}

/// True when `branch` has commits beyond `origin/main` in `workdir`.
pub async fn branch_has_commits(workdir: &Path, branch: &str) -> bool {
    let output = Command::new("git")
        .arg("log")
        .arg("--oneline")
        .arg(format!("origin/main..{branch}"))
        .current_dir(workdir)
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            !String::from_utf8_lossy(&output.stdout).trim().is_empty()
        }
        _ => false,
    }
}

/// Probes the filesystem to determine what status an issue should have
/// on (re)discovery. The worktree and its branch are the ground truth:
/// no worktree is `Pending` (with an empty path), a worktree whose
/// branch carries commits beyond main is `Ready`, otherwise
/// `CloneReady`.
pub async fn derive_issue_status(
    layout: &WorkdirLayout,
    repo: &RepoId,
    number: u64,
) -> (IssueStatus, PathBuf) {
    let workdir = layout.worktree_dir(repo, number);
    if !workdir.exists() {
        return (IssueStatus::Pending, PathBuf::new());
    }

    if branch_has_commits(&workdir, &issue_branch(number)).await {
        (IssueStatus::Ready, workdir)
    } else {
        (IssueStatus::CloneReady, workdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoId {
        RepoId::parse("acme/widget").expect("valid repo id")
    }

    #[test]
    fn layout_follows_the_two_level_scheme() {
        let layout = WorkdirLayout::new("/base");
        assert_eq!(layout.state_path(), PathBuf::from("/base/state.json"));
        assert_eq!(
            layout.bare_dir(&repo()),
            PathBuf::from("/base/acme/widget/bare.git")
        );
        assert_eq!(
            layout.worktree_dir(&repo(), 5),
            PathBuf::from("/base/acme/widget/5/widget")
        );
        assert_eq!(
            layout.log_path(&repo(), 5),
            PathBuf::from("/base/acme/widget/5/lurker.log")
        );
        assert_eq!(
            layout.prompt_path(&repo(), 5),
            PathBuf::from("/base/acme/widget/5/prompt.md")
        );
    }

    #[test]
    fn issue_branch_is_prefixed_with_the_issue_number() {
        assert_eq!(issue_branch(12), "agent/issue-12");
    }

    #[tokio::test]
    async fn derive_without_a_workdir_is_pending_with_an_empty_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let layout = WorkdirLayout::new(dir.path());
        let (status, workdir) = derive_issue_status(&layout, &repo(), 5).await;
        assert_eq!(status, IssueStatus::Pending);
        assert_eq!(workdir, PathBuf::new());
    }

    #[cfg(unix)]
    mod with_real_git {
        use super::*;

        async fn git(workdir: &Path, args: &[&str]) {
            let status = Command::new("git")
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

        /// Seeds a worktree containing `agent/issue-<n>` with
        /// `extra_commit` commits beyond an `origin/main` ref.
        async fn seed_worktree(workdir: &Path, number: u64, extra_commit: bool) {
            std::fs::create_dir_all(workdir).expect("create workdir");
            git(workdir, &["init", "--quiet", "-b", "main"]).await;
            std::fs::write(workdir.join("README.md"), "seed").expect("write seed file");
            git(workdir, &["add", "."]).await;
            git(workdir, &["commit", "--quiet", "-m", "seed"]).await;
            git(
                workdir,
                &["update-ref", "refs/remotes/origin/main", "main"],
            )
            .await;
            let branch = issue_branch(number);
            git(workdir, &["checkout", "--quiet", "-b", &branch]).await;
            if extra_commit {
                std::fs::write(workdir.join("fix.txt"), "fix").expect("write fix file");
                git(workdir, &["add", "."]).await;
                git(workdir, &["commit", "--quiet", "-m", "fix"]).await;
            }
        }

        #[tokio::test]
        async fn derive_with_branch_commits_is_ready() {
            let dir = tempfile::tempdir().expect("temp dir");
            let layout = WorkdirLayout::new(dir.path());
            let workdir = layout.worktree_dir(&repo(), 5);
            seed_worktree(&workdir, 5, true).await;

            let (status, derived) = derive_issue_status(&layout, &repo(), 5).await;
            assert_eq!(status, IssueStatus::Ready);
            assert_eq!(derived, workdir);
        }

        #[tokio::test]
        async fn derive_without_branch_commits_is_clone_ready() {
            let dir = tempfile::tempdir().expect("temp dir");
            let layout = WorkdirLayout::new(dir.path());
            let workdir = layout.worktree_dir(&repo(), 6);
            seed_worktree(&workdir, 6, false).await;

            let (status, derived) = derive_issue_status(&layout, &repo(), 6).await;
            assert_eq!(status, IssueStatus::CloneReady);
            assert_eq!(derived, workdir);
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, RepoId};

/// The watched-repository list and, per repository, the sorted set of
/// issue numbers ever marked as processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableState {
    #[serde(default)]
    pub repos: Vec<RepoId>,
    #[serde(default)]
    pub processed: BTreeMap<String, BTreeSet<u64>>,
}

impl DurableState {
    pub fn contains_repo(&self, repo: &RepoId) -> bool {
        self.repos.contains(repo)
    }

    /// Appends the repo; returns false when it was already listed.
    pub fn add_repo(&mut self, repo: RepoId) -> bool {
        if self.contains_repo(&repo) {
            return false;
        }
        self.repos.push(repo);
        true
    }

    pub fn remove_repo(&mut self, repo: &RepoId) {
        self.repos.retain(|candidate| candidate != repo);
        self.processed.remove(repo.as_str());
    }

    pub fn is_processed(&self, repo: &RepoId, number: u64) -> bool {
        self.processed
            .get(repo.as_str())
            .is_some_and(|numbers| numbers.contains(&number))
    }

    pub fn mark_processed(&mut self, repo: &RepoId, number: u64) -> bool {
        self.processed
            .entry(repo.as_str().to_owned())
            .or_default()
            .insert(number)
    }
}

/// Atomic durable persistence of the watched-repository list and
/// processed issue numbers.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads are tolerant of a missing or unparseable file and produce
    /// the empty state in that case.
    pub fn load(&self) -> DurableState {
        let Ok(raw) = std::fs::read(&self.path) else {
            return DurableState::default();
        };
        serde_json::from_slice(&raw).unwrap_or_default()
    }

    /// Atomic replace: write to `<path>.tmp`, then rename over `<path>`.
    pub fn save(&self, state: &DurableState) -> CoreResult<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|error| CoreError::Persistence(format!("serializing state: {error}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|error| {
            CoreError::Persistence(format!("writing {}: {error}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|error| {
            CoreError::Persistence(format!("replacing {}: {error}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(raw: &str) -> RepoId {
        RepoId::parse(raw).expect("valid repo id")
    }

    #[test]
    fn round_trip_preserves_state() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = StateStore::new(dir.path().join("state.json"));

        let mut state = DurableState::default();
        state.add_repo(repo("acme/widget"));
        state.add_repo(repo("acme/gadget"));
        state.mark_processed(&repo("acme/widget"), 5);
        state.mark_processed(&repo("acme/widget"), 2);

        store.save(&state).expect("save state");
        let loaded = store.load();
        assert_eq!(loaded, state);
        assert!(loaded.is_processed(&repo("acme/widget"), 2));
        assert!(!loaded.is_processed(&repo("acme/gadget"), 2));
    }

    #[test]
    fn load_of_missing_file_yields_empty_state() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load(), DurableState::default());
    }

    #[test]
    fn load_of_corrupt_file_yields_empty_state() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").expect("write corrupt file");
        let store = StateStore::new(path);
        assert_eq!(store.load(), DurableState::default());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        store.save(&DurableState::default()).expect("save state");

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn processed_numbers_serialize_sorted() {
        let mut state = DurableState::default();
        state.mark_processed(&repo("acme/widget"), 9);
        state.mark_processed(&repo("acme/widget"), 1);
        state.mark_processed(&repo("acme/widget"), 4);

        let json = serde_json::to_string(&state).expect("serialize state");
        assert!(json.contains("[1,4,9]"));
    }

    #[test]
    fn add_repo_is_idempotent() {
        let mut state = DurableState::default();
        assert!(state.add_repo(repo("acme/widget")));
        assert!(!state.add_repo(repo("acme/widget")));
        assert_eq!(state.repos.len(), 1);
    }

    #[test]
    fn remove_repo_drops_its_processed_set() {
        let mut state = DurableState::default();
        state.add_repo(repo("acme/widget"));
        state.mark_processed(&repo("acme/widget"), 3);

        state.remove_repo(&repo("acme/widget"));
        assert!(state.repos.is_empty());
        assert!(state.processed.is_empty());
    }
}

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/// Namespaced repository identifier of the form `owner/name`.
///
/// Used as the partitioning key for working directories, durable state,
/// and pollers. Equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    /// Parses and validates an `owner/name` pair.
    pub fn parse(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        let mut halves = trimmed.splitn(2, '/');
        let owner = halves.next().unwrap_or_default();
        let name = halves.next().unwrap_or_default();
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(CoreError::Configuration(format!(
                "invalid repository id '{value}': expected owner/name"
            )));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn owner(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// The bare repository name, without the owner prefix.
    pub fn name(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite textual key: `owner/name#42`.
pub fn issue_key(repo: &RepoId, number: u64) -> String {
    format!("{}#{number}", repo.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_owner_name_pairs() {
        let repo = RepoId::parse("acme/widget").expect("valid repo id");
        assert_eq!(repo.as_str(), "acme/widget");
        assert_eq!(repo.owner(), "acme");
        assert_eq!(repo.name(), "widget");
    }

    #[test]
    fn parse_trims_surrounding_whitespace() {
        let repo = RepoId::parse("  acme/widget ").expect("valid repo id");
        assert_eq!(repo.as_str(), "acme/widget");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        for raw in ["", "acme", "/widget", "acme/", "a/b/c"] {
            assert!(
                RepoId::parse(raw).is_err(),
                "expected '{raw}' to be rejected"
            );
        }
    }

    #[test]
    fn issue_key_is_repo_hash_number() {
        let repo = RepoId::parse("acme/widget").expect("valid repo id");
        assert_eq!(issue_key(&repo, 42), "acme/widget#42");
    }

    #[test]
    fn repo_id_serializes_as_plain_string() {
        let repo = RepoId::parse("acme/widget").expect("valid repo id");
        let serialized = serde_json::to_string(&repo).expect("serialize repo id");
        assert_eq!(serialized, "\"acme/widget\"");
        let parsed: RepoId = serde_json::from_str(&serialized).expect("deserialize repo id");
        assert_eq!(parsed, repo);
    }
}

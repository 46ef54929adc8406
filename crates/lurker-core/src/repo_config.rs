use std::path::Path;

use serde::Deserialize;

/// Location of the per-repo agent configuration inside a worktree.
pub const REPO_CONFIG_RELATIVE_PATH: &str = ".lurker/config.json";

/// Per-repo configuration loaded from `.lurker/config.json` in the
/// target repository. Absent or unparseable files yield the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RepoConfig {
    /// Prepended to the agent prompt (project-specific context).
    #[serde(default)]
    pub prompt_prefix: String,
    /// Overrides the default agent tool permissions.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Consumed by the agent via the prompt.
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub test_command: String,
}

impl RepoConfig {
    pub fn load(workdir: &Path) -> Self {
        let path = workdir.join(REPO_CONFIG_RELATIVE_PATH);
        let Ok(raw) = std::fs::read(&path) else {
            return Self::default();
        };
        serde_json::from_slice(&raw).unwrap_or_default()
    }

    /// The tool permissions string, using overrides when configured.
    pub fn agent_tools(&self, default_tools: &str) -> String {
        if self.allowed_tools.is_empty() {
            default_tools.to_owned()
        } else {
            self.allowed_tools.join(",")
        }
    }
}

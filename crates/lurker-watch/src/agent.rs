use std::path::Path;

use serde::Deserialize;

use lurker_core::{KnownIssue, RepoId};

pub const DEFAULT_AGENT_BINARY: &str = "claude";

/// Stripped from the agent's environment so it authenticates through
/// the operator's subscription rather than API credits.
pub const SCRUBBED_ENV_VARS: &[&str] = &["ANTHROPIC_API_KEY", "CLAUDECODE"];

const TEXT_PREVIEW_LIMIT: usize = 200;
const RESULT_PREVIEW_LIMIT: usize = 100;
const GREP_PREVIEW_LIMIT: usize = 50;
const BASH_PREVIEW_LIMIT: usize = 80;

/// The scoped tools the agent is allowed to use by default.
const DEFAULT_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "Edit",
    "Write",
    "Bash(bazel test:*)",
    "Bash(bazel build:*)",
    "Bash(git add:*)",
    "Bash(git commit:*)",
    "Bash(git diff:*)",
    "Bash(git status:*)",
    "Bash(git log:*)",
];

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub binary: String,
    pub default_tools: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: DEFAULT_AGENT_BINARY.to_owned(),
            default_tools: DEFAULT_TOOLS.join(","),
        }
    }
}

/// Builds the agent prompt for a repo and issue.
pub fn build_prompt(repo: &RepoId, issue: &KnownIssue) -> String {
    format!(
        r#"You are working on the {repo} project.

## Task
Implement a fix or feature for GitHub issue #{number}.

**Title**: {title}
**Labels**: {labels}
**Body**:
{body}

## Instructions
1. Read any AGENTS.md, CLAUDE.md, README.md, or Architecture.md to understand the project.
2. Explore relevant source files.
3. Implement changes following existing conventions.
4. Run tests if a test framework is configured.
5. Add tests if appropriate.
6. Commit with message "Fix #{number}: <description>". Do NOT push.

If the issue is unclear or too large, commit a PLAN.md describing your
analysis, proposed approach, and open questions."#,
        repo = repo.as_str(),
        number = issue.number,
        title = issue.title,
        labels = issue.label_names(),
        body = issue.body,
    )
}

/// The shell line that runs the agent over a prepared prompt file,
/// streaming structured output. Runs inside the issue's shell session.
pub fn agent_invocation(binary: &str, workdir: &Path, tools: &str, prompt_path: &Path) -> String {
    format!(
        "cd {workdir} && env {scrub} {binary} -p --output-format stream-json --verbose --allowedTools {tools} < {prompt}",
        workdir = shell_quote(&workdir.display().to_string()),
        scrub = scrub_flags(),
        binary = binary,
        tools = shell_quote(tools),
        prompt = shell_quote(&prompt_path.display().to_string()),
    )
}

/// The shell line for an interactive agent session; `continue_session`
/// resumes the previous conversation (takeover).
pub fn interactive_invocation(binary: &str, workdir: &Path, continue_session: bool) -> String {
    let continuation = if continue_session { " --continue" } else { "" };
    format!(
        "cd {workdir} && env {scrub} {binary}{continuation}\n",
        workdir = shell_quote(&workdir.display().to_string()),
        scrub = scrub_flags(),
        binary = binary,
    )
}

fn scrub_flags() -> String {
    SCRUBBED_ENV_VARS
        .iter()
        .map(|name| format!("-u {name}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[derive(Debug, Default, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: Option<AssistantMessage>,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    duration_ms: f64,
    #[serde(default)]
    num_turns: u64,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

/// Turns one line of the agent's stream-json output into user-visible
/// log lines. Unrecognised or unparseable lines yield nothing.
pub fn format_stream_event(raw: &str) -> Vec<String> {
    let Ok(event) = serde_json::from_str::<StreamEvent>(raw) else {
        return Vec::new();
    };

    match event.kind.as_str() {
        "system" if event.subtype == "init" => vec!["Claude session initialized".to_owned()],
        "assistant" => format_assistant(&event),
        "result" => vec![format_result(&event)],
        _ => Vec::new(),
    }
}

fn format_assistant(event: &StreamEvent) -> Vec<String> {
    if !event.error.is_empty() {
        return vec![format!("⚠ Error: {}", event.error)];
    }
    let Some(message) = &event.message else {
        return Vec::new();
    };

    let mut lines = Vec::new();
    for block in &message.content {
        match block.kind.as_str() {
            "text" => {
                let text = truncate(block.text.trim(), TEXT_PREVIEW_LIMIT);
                for line in text.lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_owned());
                    }
                }
            }
            "tool_use" => {
                if let Some(line) = format_tool_use(block) {
                    lines.push(line);
                }
            }
            _ => {}
        }
    }
    lines
}

fn format_tool_use(block: &ContentBlock) -> Option<String> {
    if block.name.is_empty() {
        return None;
    }

    #[derive(Debug, Default, Deserialize)]
    struct ToolInput {
        #[serde(default)]
        command: String,
        #[serde(default)]
        file_path: String,
        #[serde(default)]
        pattern: String,
    }

    let input: ToolInput = block
        .input
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default();

    Some(match block.name.as_str() {
        "Read" => format!("📖 Read {}", input.file_path),
        "Write" => format!("📝 Write {}", input.file_path),
        "Edit" => format!("✏️  Edit {}", input.file_path),
        "Glob" => format!("🔍 Glob {}", input.pattern),
        "Grep" => format!("🔍 Grep \"{}\"", truncate(&input.pattern, GREP_PREVIEW_LIMIT)),
        "Bash" => format!("$ {}", truncate(&input.command, BASH_PREVIEW_LIMIT)),
        "Task" => "🤖 Spawning sub-agent".to_owned(),
        other => format!("🔧 {other}"),
    })
}

fn format_result(event: &StreamEvent) -> String {
    let cost = if event.total_cost_usd > 0.0 {
        format!(" (${:.4})", event.total_cost_usd)
    } else {
        String::new()
    };
    let duration = if event.duration_ms > 0.0 {
        let secs = event.duration_ms / 1000.0;
        if secs >= 60.0 {
            let whole = secs as u64;
            format!(" {}m{}s", whole / 60, whole % 60)
        } else {
            format!(" {secs:.1}s")
        }
    } else {
        String::new()
    };

    if event.is_error {
        let message = truncate(event.result.trim(), RESULT_PREVIEW_LIMIT);
        return format!("✗ Failed:{duration}{cost}: {message}");
    }

    let turns = if event.num_turns > 0 {
        format!(" {} turns", event.num_turns)
    } else {
        String::new()
    };
    format!("✓ Done{duration}{turns}{cost}")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lurker_core::Label;
    use std::path::PathBuf;

    fn repo() -> RepoId {
        RepoId::parse("acme/widget").expect("valid repo id")
    }

    fn issue() -> KnownIssue {
        KnownIssue {
            number: 7,
            title: "Widget falls over".to_owned(),
            body: "Steps to reproduce: push it.".to_owned(),
            labels: vec![Label {
                name: "bug".to_owned(),
            }],
            ..KnownIssue::default()
        }
    }

    #[test]
    fn prompt_contains_issue_fields_and_conventions() {
        let prompt = build_prompt(&repo(), &issue());
        assert!(prompt.contains("acme/widget project"));
        assert!(prompt.contains("GitHub issue #7"));
        assert!(prompt.contains("**Title**: Widget falls over"));
        assert!(prompt.contains("**Labels**: bug"));
        assert!(prompt.contains("Steps to reproduce: push it."));
        assert!(prompt.contains("\"Fix #7: <description>\""));
        assert!(prompt.contains("PLAN.md"));
    }

    #[test]
    fn invocation_scrubs_env_and_redirects_the_prompt() {
        let line = agent_invocation(
            "claude",
            &PathBuf::from("/work/acme/widget/7/widget"),
            "Read,Edit",
            &PathBuf::from("/work/acme/widget/7/prompt.md"),
        );
        assert!(line.starts_with("cd '/work/acme/widget/7/widget' && env "));
        assert!(line.contains("-u ANTHROPIC_API_KEY"));
        assert!(line.contains("-u CLAUDECODE"));
        assert!(line.contains("--output-format stream-json"));
        assert!(line.contains("--allowedTools 'Read,Edit'"));
        assert!(line.ends_with("< '/work/acme/widget/7/prompt.md'"));
    }

    #[test]
    fn interactive_invocation_appends_continue_for_takeover() {
        let plain = interactive_invocation("claude", &PathBuf::from("/w"), false);
        let takeover = interactive_invocation("claude", &PathBuf::from("/w"), true);
        assert!(plain.ends_with("claude\n"));
        assert!(takeover.ends_with("claude --continue\n"));
    }

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn default_tools_cover_scoped_git_and_build_commands() {
        let tools = AgentSettings::default().default_tools;
        assert!(tools.contains("Bash(git commit:*)"));
        assert!(tools.contains("Bash(bazel test:*)"));
        assert!(tools.starts_with("Read,"));
    }

    #[test]
    fn init_event_becomes_a_session_line() {
        let lines = format_stream_event(r#"{"type":"system","subtype":"init"}"#);
        assert_eq!(lines, vec!["Claude session initialized"]);
    }

    #[test]
    fn other_system_events_are_suppressed() {
        assert!(format_stream_event(r#"{"type":"system","subtype":"other"}"#).is_empty());
        assert!(format_stream_event("not json at all").is_empty());
        assert!(format_stream_event(r#"{"type":"user"}"#).is_empty());
    }

    #[test]
    fn assistant_text_is_trimmed_split_and_truncated() {
        let long = "x".repeat(250);
        let raw = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"first\n\n second \n{long}"}}]}}}}"#
        );
        let lines = format_stream_event(&raw);
        assert_eq!(lines[0], "first");
        assert_eq!(lines[1], "second");
        let last = lines.last().expect("truncated tail");
        assert!(last.ends_with('…'));
        assert!(last.chars().count() <= TEXT_PREVIEW_LIMIT + 1);
    }

    #[test]
    fn tool_use_blocks_render_per_tool() {
        let raw = r#"{"type":"assistant","message":{"content":[
            {"type":"tool_use","name":"Read","input":{"file_path":"src/lib.rs"}},
            {"type":"tool_use","name":"Bash","input":{"command":"git status"}},
            {"type":"tool_use","name":"Task","input":{}},
            {"type":"tool_use","name":"WebSearch","input":{}}
        ]}}"#;
        let lines = format_stream_event(raw);
        assert_eq!(
            lines,
            vec![
                "📖 Read src/lib.rs",
                "$ git status",
                "🤖 Spawning sub-agent",
                "🔧 WebSearch",
            ]
        );
    }

    #[test]
    fn result_event_renders_a_single_summary_line() {
        let lines = format_stream_event(
            r#"{"type":"result","total_cost_usd":0.0312,"duration_ms":15000,"num_turns":5}"#,
        );
        assert_eq!(lines, vec!["✓ Done 15.0s 5 turns ($0.0312)"]);
    }

    #[test]
    fn result_durations_over_a_minute_use_minutes_and_seconds() {
        let lines = format_stream_event(r#"{"type":"result","duration_ms":90000}"#);
        assert_eq!(lines, vec!["✓ Done 1m30s"]);
    }

    #[test]
    fn failed_result_produces_a_failed_line() {
        let lines = format_stream_event(
            r#"{"type":"result","is_error":true,"duration_ms":2000,"result":"ran out of road"}"#,
        );
        assert_eq!(lines, vec!["✗ Failed: 2.0s: ran out of road"]);
    }
}

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Stdout, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{Event as TermEvent, EventStream, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use time::OffsetDateTime;

use lurker_core::{
    issue_key, Event, EventKind, EventReceiver, IssueStatus, RepoId, TrackedIssue,
};
use lurker_github::HostingClient;
use lurker_runtime::{Attachment, ShellSession};
use lurker_watch::{approve_issue, takeover_invocation, Orchestrator};

use crate::ui;

pub type Tui = Terminal<CrosstermBackend<Stdout>>;

/// Which panel has keyboard focus.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    List,
    /// Text input for adding a repo.
    Input,
    /// Remove-repo confirmation.
    Confirm(RepoId),
    /// Issue detail dialog.
    Dialog(RepoId, u64),
    Help,
    /// Full-screen view of one issue's logs. `scroll` None follows the
    /// tail.
    Focus {
        repo: RepoId,
        number: u64,
        scroll: Option<usize>,
    },
}

/// One selectable row in the repo/issue tree.
pub enum ListRow {
    Repo(RepoId),
    Issue(TrackedIssue),
}

struct AttachRequest {
    session: Arc<ShellSession>,
    label: String,
    /// Set for takeover attaches: probe the branch on detach.
    takeover: Option<(RepoId, u64)>,
}

struct ExternalRequest {
    program: String,
    workdir: PathBuf,
}

pub struct App {
    orchestrator: Arc<Orchestrator>,
    client: Arc<HostingClient>,
    agent_binary: String,
    log_limit: usize,

    pub logs: HashMap<String, Vec<String>>,
    pub expanded: HashSet<String>,
    pub repo_expanded: HashMap<String, bool>,
    pub cursor: usize,
    pub mode: Mode,
    pub input: String,
    pub status_message: Option<String>,
    pub poll_count: u64,
    pub last_poll: Option<OffsetDateTime>,
    pub spinner_frame: usize,

    should_quit: bool,
    pending_attach: Option<AttachRequest>,
    pending_external: Option<ExternalRequest>,
}

impl App {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        client: Arc<HostingClient>,
        agent_binary: String,
        log_limit: usize,
    ) -> Self {
        Self {
            orchestrator,
            client,
            agent_binary,
            log_limit,
            logs: HashMap::new(),
            expanded: HashSet::new(),
            repo_expanded: HashMap::new(),
            cursor: 0,
            mode: Mode::List,
            input: String::new(),
            status_message: None,
            poll_count: 0,
            last_poll: None,
            spinner_frame: 0,
            should_quit: false,
            pending_attach: None,
            pending_external: None,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn run(mut self, mut terminal: Tui, mut events: EventReceiver) -> Result<()> {
        let mut input = EventStream::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            terminal
                .draw(|frame| ui::draw(frame, &self))
                .context("drawing the dashboard")?;

            tokio::select! {
                maybe = input.next() => match maybe {
                    Some(Ok(TermEvent::Key(key))) => self.handle_key(key).await,
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_bus_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.spinner_frame = self.spinner_frame.wrapping_add(1);
                }
            }

            if self.should_quit {
                break;
            }
            if let Some(request) = self.pending_attach.take() {
                self.run_attach(&mut terminal, &mut input, request).await?;
            }
            if let Some(request) = self.pending_external.take() {
                self.run_external(&mut terminal, request)?;
            }
        }
        Ok(())
    }

    // --- Tree helpers ---

    pub fn visible_rows(&self) -> Vec<ListRow> {
        let issues = self.orchestrator.issues();
        let mut rows = Vec::new();
        for record in self.orchestrator.repos() {
            let expanded = self
                .repo_expanded
                .get(record.repo.as_str())
                .copied()
                .unwrap_or(false);
            rows.push(ListRow::Repo(record.repo.clone()));
            if expanded {
                for issue in issues.iter().filter(|issue| issue.repo == record.repo) {
                    rows.push(ListRow::Issue(issue.clone()));
                }
            }
        }
        rows
    }

    fn selected_issue(&self) -> Option<TrackedIssue> {
        match self.visible_rows().get(self.cursor) {
            Some(ListRow::Issue(issue)) => Some(issue.clone()),
            _ => None,
        }
    }

    fn selected_repo(&self) -> Option<RepoId> {
        match self.visible_rows().get(self.cursor) {
            Some(ListRow::Repo(repo)) => Some(repo.clone()),
            Some(ListRow::Issue(issue)) => Some(issue.repo.clone()),
            None => None,
        }
    }

    fn clamp_cursor(&mut self) {
        let rows = self.visible_rows().len();
        if rows == 0 {
            self.cursor = 0;
        } else if self.cursor >= rows {
            self.cursor = rows - 1;
        }
    }

    // --- Bus events ---

    async fn handle_bus_event(&mut self, event: Event) {
        if event.kind == EventKind::PollStart {
            self.poll_count += 1;
            self.last_poll = Some(event.timestamp);
        }

        if !self.orchestrator.apply_event(&event).await {
            return;
        }

        if event.is_repo_level() {
            return;
        }

        let repo = event.repo.clone();
        let number = event.issue_number;
        let key = issue_key(&repo, number);
        match event.kind {
            EventKind::IssueFound => {
                self.repo_expanded.entry(repo.as_str().to_owned()).or_insert(true);
                let persisted = self.load_persisted_logs(&repo, number);
                self.logs.insert(key, persisted);
            }
            EventKind::Reacted => self.append_log(&repo, number, "👀 Reacted"),
            EventKind::CloneStart => self.append_log(&repo, number, "📦 Cloning..."),
            EventKind::CloneDone => {
                let line = format!("📂 {}", event.text);
                self.append_log(&repo, number, &line);
            }
            EventKind::ClaudeStart => {
                self.append_log(&repo, number, "🤖 Claude working...");
                self.expanded.insert(key);
            }
            EventKind::ClaudeLog => {
                let line = format!("  {}", event.text);
                self.append_log(&repo, number, &line);
            }
            EventKind::ClaudeDone => self.append_log(&repo, number, &event.text),
            EventKind::Ready => {
                self.append_log(&repo, number, "✅ Ready: press 'a' to approve & open PR")
            }
            EventKind::Error => {
                let line = format!("❌ {}", event.text);
                self.append_log(&repo, number, &line);
            }
            _ => {}
        }
    }

    // --- Key handling ---

    async fn handle_key(&mut self, key: KeyEvent) {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.should_quit = true;
            return;
        }

        match self.mode.clone() {
            Mode::Input => self.handle_input_key(key).await,
            Mode::Confirm(repo) => self.handle_confirm_key(key, repo).await,
            Mode::Dialog(..) | Mode::Help => {
                if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q')) {
                    self.mode = Mode::List;
                }
            }
            Mode::Focus { repo, number, scroll } => {
                self.handle_focus_key(key, repo, number, scroll).await
            }
            Mode::List => self.handle_list_key(key).await,
        }
    }

    async fn handle_input_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let raw = self.input.trim().to_owned();
                self.input.clear();
                self.mode = Mode::List;
                if raw.is_empty() {
                    return;
                }
                match RepoId::parse(raw) {
                    Ok(repo) => {
                        self.repo_expanded.insert(repo.as_str().to_owned(), true);
                        if let Err(error) = self.orchestrator.add_repository(repo).await {
                            self.status_message = Some(error.to_string());
                        }
                    }
                    Err(error) => self.status_message = Some(error.to_string()),
                }
            }
            KeyCode::Esc => {
                self.input.clear();
                self.mode = Mode::List;
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(ch) => self.input.push(ch),
            _ => {}
        }
    }

    async fn handle_confirm_key(&mut self, key: KeyEvent, repo: RepoId) {
        match key.code {
            KeyCode::Char('y') | KeyCode::Enter => {
                self.mode = Mode::List;
                let prefix = format!("{}#", repo.as_str());
                self.logs.retain(|key, _| !key.starts_with(&prefix));
                self.expanded.retain(|key| !key.starts_with(&prefix));
                self.repo_expanded.remove(repo.as_str());
                if let Err(error) = self.orchestrator.remove_repository(&repo).await {
                    self.status_message = Some(error.to_string());
                }
                self.clamp_cursor();
            }
            KeyCode::Char('n') | KeyCode::Esc => self.mode = Mode::List,
            _ => {}
        }
    }

    async fn handle_focus_key(
        &mut self,
        key: KeyEvent,
        repo: RepoId,
        number: u64,
        scroll: Option<usize>,
    ) {
        let issue = self.orchestrator.issue(&repo, number);
        match key.code {
            KeyCode::Esc => self.mode = Mode::List,
            KeyCode::Char('j') | KeyCode::Down => {
                let lines = self.issue_log_len(&repo, number);
                let next = scroll.map_or(lines, |current| current + 1);
                self.mode = Mode::Focus {
                    repo,
                    number,
                    scroll: Some(next),
                };
            }
            KeyCode::Char('k') | KeyCode::Up => {
                let next = scroll.map_or(self.issue_log_len(&repo, number), |c| c).saturating_sub(1);
                self.mode = Mode::Focus {
                    repo,
                    number,
                    scroll: Some(next),
                };
            }
            KeyCode::Char('G') => {
                self.mode = Mode::Focus {
                    repo,
                    number,
                    scroll: None,
                };
            }
            KeyCode::Char(' ') => {
                if let Some(issue) = issue {
                    self.toggle_processing(&issue).await;
                }
            }
            KeyCode::Char('o') => self.open_issue_url(issue.as_ref()),
            KeyCode::Char('a') => self.approve(issue.as_ref()),
            KeyCode::Char('g') => self.launch_lazygit(issue.as_ref()),
            KeyCode::Char('c') => self.launch_agent(issue.as_ref(), false),
            KeyCode::Char('t') => self.launch_agent(issue.as_ref(), true),
            KeyCode::Char('s') => self.launch_shell(issue.as_ref()),
            KeyCode::Char('q') => self.should_quit = true,
            _ => {}
        }
    }

    async fn handle_list_key(&mut self, key: KeyEvent) {
        let rows = self.visible_rows();
        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('j') | KeyCode::Down => {
                if self.cursor + 1 < rows.len() {
                    self.cursor += 1;
                }
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.cursor = self.cursor.saturating_sub(1);
            }
            KeyCode::Char('l') | KeyCode::Enter => match rows.get(self.cursor) {
                Some(ListRow::Repo(repo)) => self.toggle_repo_expand(repo.clone()),
                Some(ListRow::Issue(issue)) => self.enter_focus(issue.clone()),
                None => {}
            },
            KeyCode::Char(' ') => match rows.get(self.cursor) {
                Some(ListRow::Repo(repo)) => self.toggle_repo_expand(repo.clone()),
                Some(ListRow::Issue(issue)) => {
                    let issue = issue.clone();
                    self.toggle_processing(&issue).await;
                }
                None => {}
            },
            KeyCode::Char('f') => {
                if let Some(issue) = self.selected_issue() {
                    self.enter_focus(issue);
                }
            }
            KeyCode::Char('s') => {
                let issue = self.selected_issue();
                self.launch_shell(issue.as_ref());
            }
            KeyCode::Char('g') => {
                let issue = self.selected_issue();
                self.launch_lazygit(issue.as_ref());
            }
            KeyCode::Char('c') => {
                let issue = self.selected_issue();
                self.launch_agent(issue.as_ref(), false);
            }
            KeyCode::Char('t') => {
                let issue = self.selected_issue();
                self.launch_agent(issue.as_ref(), true);
            }
            KeyCode::Char('o') => {
                let issue = self.selected_issue();
                self.open_issue_url(issue.as_ref());
            }
            KeyCode::Char('i') => {
                if let Some(issue) = self.selected_issue() {
                    self.mode = Mode::Dialog(issue.repo.clone(), issue.number);
                }
            }
            KeyCode::Char('a') => {
                let issue = self.selected_issue();
                self.approve(issue.as_ref());
            }
            KeyCode::Char('r') => {
                self.input.clear();
                self.mode = Mode::Input;
            }
            KeyCode::Char('R') | KeyCode::Char('d') => {
                if let Some(repo) = self.selected_repo() {
                    self.mode = Mode::Confirm(repo);
                }
            }
            KeyCode::Char('?') => self.mode = Mode::Help,
            _ => {}
        }
    }

    fn toggle_repo_expand(&mut self, repo: RepoId) {
        let entry = self
            .repo_expanded
            .entry(repo.as_str().to_owned())
            .or_insert(false);
        *entry = !*entry;
        self.clamp_cursor();
    }

    fn enter_focus(&mut self, issue: TrackedIssue) {
        self.mode = Mode::Focus {
            repo: issue.repo,
            number: issue.number,
            scroll: None,
        };
    }

    async fn toggle_processing(&mut self, issue: &TrackedIssue) {
        let repo = issue.repo.clone();
        let number = issue.number;
        let key = issue_key(&repo, number);
        match issue.status {
            IssueStatus::Pending => {
                self.start(&repo, number, "▶ Started");
                self.expanded.insert(key);
            }
            status if status.is_active() => {
                self.orchestrator.pause_issue(&repo, number);
                self.append_log(&repo, number, "⏸ Paused");
            }
            IssueStatus::Paused => {
                self.start(&repo, number, "▶ Resumed");
                self.expanded.insert(key);
            }
            IssueStatus::Failed => {
                self.start(&repo, number, "▶ Retrying");
                self.expanded.insert(key);
            }
            _ => {}
        }
    }

    fn start(&mut self, repo: &RepoId, number: u64, log_line: &str) {
        match self.orchestrator.start_issue(repo, number) {
            Ok(()) => self.append_log(repo, number, log_line),
            Err(error) => self.status_message = Some(error.to_string()),
        }
    }

    // --- Composite actions ---

    fn approve(&mut self, issue: Option<&TrackedIssue>) {
        let Some(issue) = issue else { return };
        if issue.workdir.as_os_str().is_empty() {
            return;
        }
        self.append_log(&issue.repo, issue.number, "");
        tokio::spawn(approve_issue(
            Arc::clone(&self.client),
            self.orchestrator.events(),
            issue.clone(),
        ));
    }

    fn launch_shell(&mut self, issue: Option<&TrackedIssue>) {
        let Some(issue) = issue else { return };
        if issue.workdir.as_os_str().is_empty() {
            return;
        }
        match self
            .orchestrator
            .ensure_shell_session(&issue.repo, issue.number)
        {
            Ok(session) => {
                self.pending_attach = Some(AttachRequest {
                    session,
                    label: issue_key(&issue.repo, issue.number),
                    takeover: None,
                });
            }
            Err(error) => {
                let line = format!("PTY: {error}");
                self.append_log(&issue.repo, issue.number, &line);
            }
        }
    }

    fn launch_agent(&mut self, issue: Option<&TrackedIssue>, takeover: bool) {
        let Some(issue) = issue else { return };
        if issue.workdir.as_os_str().is_empty() {
            return;
        }
        let repo = issue.repo.clone();
        let number = issue.number;

        if takeover && issue.status.is_active() {
            self.orchestrator.pause_issue(&repo, number);
            self.append_log(
                &repo,
                number,
                "⏸ Pausing automation: launching interactive session...",
            );
        }

        match self.orchestrator.ensure_shell_session(&repo, number) {
            Ok(session) => {
                let invocation =
                    takeover_invocation(&self.agent_binary, &issue.workdir, takeover);
                if let Err(error) = session.write_input(invocation.as_bytes()) {
                    let line = format!("PTY: {error}");
                    self.append_log(&repo, number, &line);
                    return;
                }
                self.pending_attach = Some(AttachRequest {
                    session,
                    label: issue_key(&repo, number),
                    takeover: takeover.then(|| (repo, number)),
                });
            }
            Err(error) => {
                let line = format!("PTY: {error}");
                self.append_log(&repo, number, &line);
            }
        }
    }

    fn launch_lazygit(&mut self, issue: Option<&TrackedIssue>) {
        let Some(issue) = issue else { return };
        if issue.workdir.as_os_str().is_empty() {
            return;
        }
        self.pending_external = Some(ExternalRequest {
            program: "lazygit".to_owned(),
            workdir: issue.workdir.clone(),
        });
    }

    fn open_issue_url(&mut self, issue: Option<&TrackedIssue>) {
        let Some(issue) = issue else { return };
        if issue.url.is_empty() {
            return;
        }
        #[cfg(target_os = "macos")]
        const OPENER: &str = "open";
        #[cfg(not(target_os = "macos"))]
        const OPENER: &str = "xdg-open";
        let _ = std::process::Command::new(OPENER)
            .arg(&issue.url)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
    }

    // --- Terminal handover ---

    async fn run_attach(
        &mut self,
        terminal: &mut Tui,
        input: &mut EventStream,
        request: AttachRequest,
    ) -> Result<()> {
        execute!(terminal.backend_mut(), LeaveAlternateScreen)
            .context("leaving the alternate screen")?;

        let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
        let attachment = Attachment::begin(
            Arc::clone(&request.session),
            Box::new(std::io::stdout()),
            &request.label,
            cols,
            rows,
        )?;

        loop {
            match input.next().await {
                Some(Ok(TermEvent::Key(key))) => {
                    if let Some(bytes) = key_event_bytes(&key) {
                        if attachment.forward(&bytes).unwrap_or(true) {
                            break;
                        }
                    }
                }
                Some(Ok(TermEvent::Resize(cols, rows))) => {
                    let _ = attachment.resize(cols, rows);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
            if !request.session.is_running() {
                break;
            }
        }
        drop(attachment);

        execute!(terminal.backend_mut(), EnterAlternateScreen)
            .context("re-entering the alternate screen")?;
        terminal.clear().context("clearing the terminal")?;

        if let Some((repo, number)) = request.takeover {
            let status = self.orchestrator.finish_takeover(&repo, number).await;
            let line = if status == IssueStatus::Ready {
                "✅ Interactive session done: ready for review"
            } else {
                "Interactive session ended"
            };
            self.append_log(&repo, number, line);
        }
        Ok(())
    }

    fn run_external(&mut self, terminal: &mut Tui, request: ExternalRequest) -> Result<()> {
        execute!(terminal.backend_mut(), LeaveAlternateScreen)
            .context("leaving the alternate screen")?;
        disable_raw_mode().context("disabling raw mode")?;

        let status = tokio::task::block_in_place(|| {
            std::process::Command::new(&request.program)
                .current_dir(&request.workdir)
                .status()
        });
        if let Err(error) = status {
            self.status_message = Some(format!("{}: {error}", request.program));
        }

        enable_raw_mode().context("re-enabling raw mode")?;
        execute!(terminal.backend_mut(), EnterAlternateScreen)
            .context("re-entering the alternate screen")?;
        terminal.clear().context("clearing the terminal")?;
        Ok(())
    }

    // --- Per-issue logs ---

    pub fn issue_logs(&self, repo: &RepoId, number: u64) -> &[String] {
        self.logs
            .get(&issue_key(repo, number))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn issue_log_len(&self, repo: &RepoId, number: u64) -> usize {
        self.issue_logs(repo, number).len()
    }

    fn append_log(&mut self, repo: &RepoId, number: u64, line: &str) {
        let key = issue_key(repo, number);
        let entries = self.logs.entry(key).or_default();
        entries.push(line.to_owned());
        if entries.len() > self.log_limit {
            let excess = entries.len() - self.log_limit;
            entries.drain(..excess);
        }
        self.persist_log_line(repo, number, line);
    }

    fn persist_log_line(&self, repo: &RepoId, number: u64, line: &str) {
        let path = self.orchestrator.layout().log_path(repo, number);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let _ = writeln!(file, "{line}");
        }
    }

    fn load_persisted_logs(&self, repo: &RepoId, number: u64) -> Vec<String> {
        let path = self.orchestrator.layout().log_path(repo, number);
        let Ok(file) = std::fs::File::open(&path) else {
            return Vec::new();
        };
        let mut lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .collect();
        if lines.len() > self.log_limit {
            let excess = lines.len() - self.log_limit;
            lines.drain(..excess);
        }
        lines
    }
}

/// Renders a key event as the bytes a raw terminal would have sent, so
/// crossterm-owned input can be forwarded into an attached pty.
fn key_event_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let bytes = match key.code {
        KeyCode::Char(ch) => {
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                let upper = ch.to_ascii_uppercase();
                if upper.is_ascii_uppercase() || ('@'..='_').contains(&upper) {
                    vec![(upper as u8) & 0x1f]
                } else {
                    return None;
                }
            } else {
                let mut buffer = [0_u8; 4];
                ch.encode_utf8(&mut buffer).as_bytes().to_vec()
            }
        }
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        _ => return None,
    };
    Some(bytes)
}

/// Elapsed-time label for the issue table.
pub fn elapsed(start: OffsetDateTime, now: OffsetDateTime) -> String {
    let seconds = (now - start).whole_seconds().max(0);
    if seconds < 60 {
        format!("{seconds}s")
    } else {
        format!("{}m{}s", seconds / 60, seconds % 60)
    }
}

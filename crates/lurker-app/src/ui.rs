use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use ratatui::Frame;
use time::OffsetDateTime;

use lurker_core::{IssueStatus, TrackedIssue};

use crate::app::{elapsed, App, ListRow, Mode};

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const MAX_EXPANDED_LOG_LINES: usize = 15;

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_DIM: Color = Color::DarkGray;
const COLOR_OK: Color = Color::Green;
const COLOR_WARN: Color = Color::Yellow;
const COLOR_ERR: Color = Color::Red;

pub fn draw(frame: &mut Frame, app: &App) {
    if let Mode::Focus {
        repo,
        number,
        scroll,
    } = &app.mode
    {
        draw_focus(frame, app, repo, *number, *scroll);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(frame.area());

    draw_header(frame, app, chunks[0]);
    draw_status_bar(frame, app, chunks[1]);
    draw_tree(frame, app, chunks[2]);
    draw_footer(frame, app, chunks[3]);

    match &app.mode {
        Mode::Input => draw_input(frame, app),
        Mode::Confirm(repo) => draw_confirm(frame, repo.as_str()),
        Mode::Dialog(repo, number) => {
            if let Some(issue) = app.orchestrator().issue(repo, *number) {
                draw_dialog(frame, &issue);
            }
        }
        Mode::Help => draw_help(frame),
        _ => {}
    }
}

fn draw_header(frame: &mut Frame, app: &App, area: Rect) {
    let spinner = SPINNER_FRAMES[app.spinner_frame % SPINNER_FRAMES.len()];
    let line = Line::from(vec![
        Span::styled(
            "  lurker ",
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("{spinner} polls:{}", app.poll_count),
            Style::default().fg(COLOR_DIM),
        ),
    ]);
    frame.render_widget(Paragraph::new(line), area);
}

fn draw_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let issues = app.orchestrator().issues();
    let active = issues.iter().filter(|i| i.status.is_active()).count();
    let ready = issues
        .iter()
        .filter(|i| i.status == IssueStatus::Ready)
        .count();
    let failed = issues
        .iter()
        .filter(|i| i.status == IssueStatus::Failed)
        .count();

    let mut spans = vec![
        Span::raw(format!("  {} issues", issues.len())),
        Span::styled(
            format!("   {active} active"),
            Style::default().fg(COLOR_WARN),
        ),
        Span::styled(format!("   {ready} ready"), Style::default().fg(COLOR_OK)),
        Span::styled(
            format!("   {failed} failed"),
            Style::default().fg(COLOR_ERR),
        ),
    ];
    if let Some(message) = &app.status_message {
        spans.push(Span::styled(
            format!("   {message}"),
            Style::default().fg(COLOR_ERR),
        ));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn draw_tree(frame: &mut Frame, app: &App, area: Rect) {
    let rows = app.visible_rows();
    let repos = app.orchestrator().repos();
    let now = OffsetDateTime::now_utc();

    let mut lines: Vec<Line> = Vec::new();
    let mut cursor_line = 0_usize;

    for (index, row) in rows.iter().enumerate() {
        let selected = index == app.cursor;
        if selected {
            cursor_line = lines.len();
        }
        match row {
            ListRow::Repo(repo) => {
                let expanded = app
                    .repo_expanded
                    .get(repo.as_str())
                    .copied()
                    .unwrap_or(false);
                let arrow = if expanded { "▾" } else { "▸" };
                let style = if selected {
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::REVERSED)
                } else {
                    Style::default().fg(COLOR_ACCENT)
                };
                lines.push(Line::from(Span::styled(
                    format!("  {arrow} {}", repo.as_str()),
                    style,
                )));

                if let Some(error) = repos
                    .iter()
                    .find(|record| record.repo == *repo)
                    .and_then(|record| record.last_poll_error.as_deref())
                {
                    lines.push(Line::from(Span::styled(
                        format!("      {error}"),
                        Style::default().fg(COLOR_ERR),
                    )));
                }
            }
            ListRow::Issue(issue) => {
                lines.push(issue_line(app, issue, selected, now));
                if app
                    .expanded
                    .contains(&lurker_core::issue_key(&issue.repo, issue.number))
                {
                    let logs = app.issue_logs(&issue.repo, issue.number);
                    let start = logs.len().saturating_sub(MAX_EXPANDED_LOG_LINES);
                    for entry in &logs[start..] {
                        lines.push(Line::from(Span::styled(
                            format!("        {entry}"),
                            Style::default().fg(COLOR_DIM),
                        )));
                    }
                }
            }
        }
    }

    if lines.is_empty() {
        lines.push(Line::from(Span::styled(
            "  Waiting for issues... press 'r' to add a repo",
            Style::default().fg(COLOR_DIM),
        )));
    }

    // Keep the cursor's line inside the viewport.
    let height = area.height as usize;
    let scroll = cursor_line.saturating_sub(height.saturating_sub(1));
    frame.render_widget(
        Paragraph::new(lines).scroll((scroll as u16, 0)),
        area,
    );
}

fn issue_line(app: &App, issue: &TrackedIssue, selected: bool, now: OffsetDateTime) -> Line<'static> {
    let (icon, color) = status_decor(issue.status);
    let spinner = if issue.status == IssueStatus::ClaudeRunning {
        format!("{} ", SPINNER_FRAMES[app.spinner_frame % SPINNER_FRAMES.len()])
    } else {
        String::new()
    };
    let mut title = issue.title.clone();
    if title.chars().count() > 48 {
        title = format!("{}…", title.chars().take(48).collect::<String>());
    }

    let mut spans = vec![
        Span::raw("    "),
        Span::raw(format!("{icon} ")),
        Span::styled(
            format!("{:<7}", issue.status.label()),
            Style::default().fg(color),
        ),
        Span::raw(format!(" #{:<5} ", issue.number)),
        Span::raw(format!("{spinner}{title}")),
        Span::styled(
            format!("  {}", elapsed(issue.started_at, now)),
            Style::default().fg(COLOR_DIM),
        ),
    ];
    if !issue.last_error.is_empty() {
        spans.push(Span::styled(
            format!("  {}", issue.last_error),
            Style::default().fg(COLOR_ERR),
        ));
    }

    let mut line = Line::from(spans);
    if selected {
        line.style = Style::default().add_modifier(Modifier::REVERSED);
    }
    line
}

fn status_decor(status: IssueStatus) -> (&'static str, Color) {
    match status {
        IssueStatus::Pending => ("·", COLOR_DIM),
        IssueStatus::Reacted => ("👀", COLOR_WARN),
        IssueStatus::Cloning => ("📦", COLOR_WARN),
        IssueStatus::CloneReady => ("📂", COLOR_WARN),
        IssueStatus::ClaudeRunning => ("🔄", COLOR_WARN),
        IssueStatus::Ready => ("✅", COLOR_OK),
        IssueStatus::Failed => ("❌", COLOR_ERR),
        IssueStatus::Paused => ("⏸", COLOR_DIM),
    }
}

fn draw_footer(frame: &mut Frame, app: &App, area: Rect) {
    let hints = match app.mode {
        Mode::Input => "enter add repo · esc cancel",
        Mode::Confirm(_) => "y remove · n cancel",
        Mode::Dialog(..) | Mode::Help => "esc close",
        Mode::Focus { .. } => {
            "j/k scroll · G bottom · space start/pause · a approve · g lazygit · c claude · t takeover · s shell · esc back"
        }
        Mode::List => {
            "j/k move · space start/pause · f focus · i info · a approve · s shell · r add · R remove · ? help · q quit"
        }
    };
    frame.render_widget(
        Paragraph::new(Line::from(Span::styled(
            format!("  {hints}"),
            Style::default().fg(COLOR_DIM),
        ))),
        area,
    );
}

fn draw_focus(frame: &mut Frame, app: &App, repo: &lurker_core::RepoId, number: u64, scroll: Option<usize>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let title = match app.orchestrator().issue(repo, number) {
        Some(issue) => format!(
            "  {} #{} [{}] {}",
            repo.as_str(),
            number,
            issue.status.label(),
            issue.title
        ),
        None => format!("  {} #{number}", repo.as_str()),
    };
    frame.render_widget(
        Paragraph::new(Line::from(Span::styled(
            title,
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        ))),
        chunks[0],
    );

    let logs = app.issue_logs(repo, number);
    let height = chunks[1].height as usize;
    let max_scroll = logs.len().saturating_sub(height);
    let offset = scroll.map_or(max_scroll, |value| value.min(max_scroll));
    let lines: Vec<Line> = logs
        .iter()
        .skip(offset)
        .take(height)
        .map(|entry| Line::from(entry.clone()))
        .collect();
    frame.render_widget(Paragraph::new(lines), chunks[1]);

    draw_footer(frame, app, chunks[2]);
}

fn draw_input(frame: &mut Frame, app: &App) {
    let area = centered_rect(frame.area(), 50, 3);
    frame.render_widget(Clear, area);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" add repository ");
    frame.render_widget(
        Paragraph::new(format!("{}█", app.input)).block(block),
        area,
    );
}

fn draw_confirm(frame: &mut Frame, repo: &str) {
    let area = centered_rect(frame.area(), 56, 3);
    frame.render_widget(Clear, area);
    let block = Block::default().borders(Borders::ALL).title(" confirm ");
    frame.render_widget(
        Paragraph::new(format!("Remove {repo} and all its issues? (y/n)")).block(block),
        area,
    );
}

fn draw_dialog(frame: &mut Frame, issue: &TrackedIssue) {
    let area = centered_rect(frame.area(), 72, 14);
    frame.render_widget(Clear, area);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" {} #{} ", issue.repo.as_str(), issue.number));

    let mut lines = vec![
        Line::from(Span::styled(
            issue.title.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(format!("status: {}", issue.status.label())),
        Line::from(format!("labels: {}", issue.labels)),
        Line::from(format!("url: {}", issue.url)),
        Line::from(format!("workdir: {}", issue.workdir.display())),
    ];
    if !issue.last_error.is_empty() {
        lines.push(Line::from(Span::styled(
            format!("error: {}", issue.last_error),
            Style::default().fg(COLOR_ERR),
        )));
    }
    lines.push(Line::default());
    for body_line in issue.body.lines().take(6) {
        lines.push(Line::from(body_line.to_owned()));
    }

    frame.render_widget(
        Paragraph::new(lines).wrap(Wrap { trim: false }).block(block),
        area,
    );
}

fn draw_help(frame: &mut Frame) {
    let area = centered_rect(frame.area(), 62, 18);
    frame.render_widget(Clear, area);
    let block = Block::default().borders(Borders::ALL).title(" help ");
    let entries = [
        ("j/k", "move selection"),
        ("l/enter", "expand repo / focus issue"),
        ("space", "start, pause, resume, or retry the issue"),
        ("f", "full-screen issue view"),
        ("i", "issue details"),
        ("a", "push branch & open a pull request"),
        ("s", "attach a shell in the issue workdir"),
        ("g", "open lazygit in the issue workdir"),
        ("c", "attach the agent interactively"),
        ("t", "take over the agent (resumes its session)"),
        ("o", "open the issue in the browser"),
        ("r", "add a repository"),
        ("R/d", "remove the selected repository"),
        ("Ctrl+]", "detach from an attached session"),
        ("q", "quit"),
    ];
    let lines: Vec<Line> = entries
        .iter()
        .map(|(key, text)| {
            Line::from(vec![
                Span::styled(format!("  {key:<8}"), Style::default().fg(COLOR_ACCENT)),
                Span::raw((*text).to_owned()),
            ])
        })
        .collect();
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn centered_rect(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width.saturating_sub(width)) / 2,
        y: area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    }
}

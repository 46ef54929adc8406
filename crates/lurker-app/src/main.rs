use std::io::stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use lurker_core::{event_channel, RepoId, EVENT_BUS_CAPACITY};
use lurker_github::{resolve_token, HostingClient, HostingClientConfig, ProcessCommandRunner};
use lurker_watch::{AgentSettings, Orchestrator};

mod app;
mod ui;

use app::App;

/// Watch repositories for new issues and drive them through an
/// agent-assisted fix pipeline.
#[derive(Debug, Parser)]
#[command(name = "lurker")]
struct Cli {
    /// Repository to add to the watch list (owner/name).
    #[arg(long)]
    repo: Option<String>,
    /// Poll interval in seconds.
    #[arg(long)]
    interval: Option<u64>,
    /// Base directory for workdirs and state.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = lurker_config::load_from_env().context("loading configuration")?;
    if let Some(interval) = cli.interval {
        config.poll_interval_secs = interval.max(1);
    }
    if let Some(dir) = &cli.dir {
        config.base_dir = dir.display().to_string();
    }

    let base_dir = PathBuf::from(&config.base_dir);
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("creating base directory {}", base_dir.display()))?;

    // The TUI owns the terminal; tracing goes to a file instead.
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(base_dir.join("lurker-debug.log"))
        .context("opening debug log")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();

    let token = resolve_token(&ProcessCommandRunner).context("resolving hosting credential")?;
    let mut client_config = HostingClientConfig::new(token);
    client_config.api_base = config.github.api_url.clone();
    let client = Arc::new(HostingClient::new(client_config).context("building hosting client")?);

    let (events_tx, events_rx) = event_channel(EVENT_BUS_CAPACITY);
    let agent = AgentSettings {
        binary: config.agent.binary.clone(),
        ..AgentSettings::default()
    };
    let orchestrator = Orchestrator::new(
        &base_dir,
        Duration::from_secs(config.poll_interval_secs),
        agent,
        Arc::clone(&client),
        events_tx,
    )
    .context("building orchestrator")?;

    orchestrator.start();
    if let Some(raw) = &cli.repo {
        let repo = RepoId::parse(raw.as_str()).context("parsing --repo")?;
        orchestrator
            .add_repository(repo)
            .await
            .context("adding repository")?;
    }

    enable_raw_mode().context("enabling raw terminal mode")?;
    execute!(stdout(), EnterAlternateScreen).context("entering alternate screen")?;
    let terminal =
        Terminal::new(CrosstermBackend::new(stdout())).context("initialising terminal")?;

    let app = App::new(
        Arc::clone(&orchestrator),
        client,
        config.agent.binary.clone(),
        config.ui.log_line_limit,
    );
    let result = app.run(terminal, events_rx).await;

    let _ = disable_raw_mode();
    let _ = execute!(stdout(), LeaveAlternateScreen);
    orchestrator.shutdown();

    result
}

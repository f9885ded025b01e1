use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orgsync::config::{self, Config};
use orgsync::db;
use orgsync::github::GitHubClient;
use orgsync::model::{SyncKind, SyncTarget};
use orgsync::resume::PullOptions;
use orgsync::session::SessionStore;
use orgsync::{PullReport, Syncer};

#[derive(Debug, Parser)]
#[command(author, version, about = "Mirror an organization's directory into SQLite")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull one collection into the local store
    Pull(PullArgs),
    /// Inspect or discard saved pull sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Debug, clap::Args)]
struct PullArgs {
    /// users, teams, repos, repos-users, repos-teams, teams-users, outside-users, token-permission
    kind: SyncKind,

    /// Repository scope for repos-users / repos-teams
    #[arg(long)]
    repo: Option<String>,

    /// Team scope for teams-users
    #[arg(long)]
    team: Option<String>,

    /// Expected token owner for token-permission
    #[arg(long)]
    user: Option<String>,

    /// Do not write fetched rows to the store
    #[arg(long)]
    no_store: bool,

    /// Print fetched rows as JSON lines
    #[arg(long)]
    stdout: bool,

    /// Pause between page requests (defaults to app.interval_ms)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Track progress under a session key; without a value a new key is generated
    #[arg(long)]
    session: Option<Option<String>>,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// List saved sessions
    List,
    /// Print one session as JSON
    Show { key: String },
    /// Continue an interrupted session with its saved options
    Resume { key: String },
    /// Discard a session
    Remove { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let sessions = match cfg.app.session_path() {
        Some(path) => SessionStore::new(path),
        None => SessionStore::open_default()?,
    };

    match args.command {
        Command::Pull(pull) => run_pull(&cfg, &sessions, pull).await,
        Command::Sessions { command } => run_sessions(&cfg, &sessions, command).await,
    }
}

async fn run_pull(cfg: &Config, sessions: &SessionStore, args: PullArgs) -> Result<()> {
    let mut target = SyncTarget::new(args.kind);
    target.repo_name = args.repo;
    target.team_slug = args.team;
    target.user_login = args.user;

    let options = PullOptions {
        store: !args.no_store,
        stdout: args.stdout,
        interval: args
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| cfg.app.interval()),
        ..PullOptions::default()
    };
    let key = args
        .session
        .map(|key| key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
    execute(cfg, sessions, &target, options, key.as_deref()).await
}

async fn run_sessions(
    cfg: &Config,
    sessions: &SessionStore,
    command: SessionCommand,
) -> Result<()> {
    match command {
        SessionCommand::List => {
            let all = sessions.list().await?;
            if all.is_empty() {
                println!("no saved sessions in {}", sessions.path().display());
            }
            for session in all {
                println!(
                    "{}\t{}\tpage {}\t{} rows\t{}",
                    session.key,
                    session.sync_target(),
                    session.last_page,
                    session.fetched_count,
                    session.updated_at.to_rfc3339()
                );
            }
        }
        SessionCommand::Show { key } => {
            let session = sessions.load(&key).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionCommand::Resume { key } => {
            let session = sessions.load(&key).await?;
            let target = session.sync_target();
            let options = session.pull_options();
            execute(cfg, sessions, &target, options, Some(&key)).await?;
        }
        SessionCommand::Remove { key } => {
            if sessions.remove(&key).await? {
                println!("removed session {}", key);
            } else {
                println!("session {} not found", key);
            }
        }
    }
    Ok(())
}

async fn execute(
    cfg: &Config,
    sessions: &SessionStore,
    target: &SyncTarget,
    options: PullOptions,
    key: Option<&str>,
) -> Result<()> {
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let base_url = Url::parse(&cfg.github.api_base_url).context("invalid github.api_base_url")?;
    let client =
        GitHubClient::with_base_url(cfg.github.token.clone(), cfg.github.org.clone(), base_url)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let syncer = Syncer::new(&client, &pool)
        .with_sessions(sessions)
        .with_cancel(cancel)
        .page_size(cfg.app.page_size);

    if let Some(key) = key {
        info!(key, "pull session");
    }
    let result = match key {
        Some(key) => syncer.pull_session(key, target, options).await,
        None => syncer.pull(target, options).await,
    };

    match result {
        Ok(report) => {
            print_items(&report)?;
            for message in &report.messages {
                eprintln!("{}", message);
            }
            info!(
                pull = %target,
                fetched = report.fetched,
                stored = report.stored,
                "pull complete"
            );
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            match key {
                Some(key) => eprintln!(
                    "interrupted; resume with `orgsync sessions resume {}`",
                    key
                ),
                None => eprintln!("interrupted; pass --session to make pulls resumable"),
            }
            std::process::exit(130);
        }
        Err(err) => {
            if let Some(diag) = err.scope_diagnostic() {
                if !diag.missing_scopes().is_empty() {
                    eprintln!("hint: grant the token one of: {}", diag.missing_scopes().join(", "));
                }
            }
            Err(err).with_context(|| format!("pull {} failed", target))
        }
    }
}

fn print_items(report: &PullReport) -> Result<()> {
    if report.items.is_empty() {
        return Ok(());
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for item in &report.items {
        serde_json::to_writer(&mut out, item)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// First Ctrl+C cancels the pull; a second one exits immediately.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to install Ctrl+C handler");
            return;
        }
        warn!("shutdown requested, stopping after the current request");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use orgsync::config;
use orgsync::session::SessionStore;

#[derive(Parser, Debug)]
#[command(about = "Print saved pull sessions and where each would resume")]
struct Args {
    /// Session document to read; defaults to app.session_path or the per-user location
    #[arg(long)]
    path: Option<PathBuf>,

    /// Path to YAML config, consulted when --path is absent
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let path = match args.path {
        Some(path) => path,
        None => config::load(Some(&args.config))
            .ok()
            .and_then(|cfg| cfg.app.session_path())
            .map_or_else(SessionStore::default_path, Ok)?,
    };

    let store = SessionStore::new(&path);
    let sessions = store.list().await?;
    println!("Session document: {}", path.display());
    println!("Sessions: {}", sessions.len());
    for session in sessions {
        let resume = session.resume_state();
        println!("  {} -> {}", session.key, session.sync_target());
        println!(
            "    store: {}, stdout: {}, interval: {} ms, table_cleared: {}",
            session.store,
            session.stdout,
            session.interval.as_millis(),
            session.table_cleared
        );
        if resume.is_empty() {
            println!("    no page recorded yet");
        } else {
            println!(
                "    resumes {} after page {} ({} rows) {:?}",
                resume.endpoint, resume.last_page, resume.count, resume.metadata
            );
        }
        println!("    updated: {}", session.updated_at.to_rfc3339());
    }
    Ok(())
}

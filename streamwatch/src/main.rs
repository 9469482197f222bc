//! streamwatch - media server activity monitor
//!
//! Subcommands:
//! - `run` - the monitoring daemon (collectors, ingestion, maintenance)
//! - `servers` - manage the media server registry
//! - `history` - consolidated playback history
//! - `status` - per-server activity totals
//! - `cleanup` - retention cleanup
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/streamwatch/data.db
//! - Config: $XDG_CONFIG_HOME/streamwatch/config.toml
//! - Logs: $XDG_STATE_HOME/streamwatch/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};

use streamwatch_core::config::Config;
use streamwatch_core::db::ActivityFilter;
use streamwatch_core::maintenance::MaintenanceService;
use streamwatch_core::query::QueryService;
use streamwatch_core::registry::ServerRegistry;
use streamwatch_core::{Database, IngestService, Orchestrator};

#[derive(Parser)]
#[command(name = "streamwatch")]
#[command(about = "Media server activity monitor")]
#[command(version)]
struct Args {
    /// Path to a config file (defaults to the XDG config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring daemon
    Run,

    /// Manage the media server registry
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },

    /// Show consolidated playback history
    History {
        /// Filter by user name (case-insensitive substring)
        #[arg(short, long)]
        user: Option<String>,

        /// Filter by media type (movie, episode, book, ...)
        #[arg(short, long)]
        media_type: Option<String>,

        /// Only currently active sessions
        #[arg(short, long)]
        active: bool,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 25)]
        per_page: usize,
    },

    /// Show per-server activity totals
    Status,

    /// Delete history older than the retention horizon
    Cleanup,
}

#[derive(Subcommand)]
enum ServersAction {
    /// List registered servers
    List,

    /// Register a media server
    Add {
        /// Display name
        name: String,

        /// Base URL, e.g. http://plex.local:32400
        url: String,

        /// plex, jellyfin, emby, audiobookshelf; anything else is polled generically
        #[arg(short = 't', long, default_value = "plex")]
        server_type: String,

        /// API token for the backend
        #[arg(short, long)]
        api_key: String,

        /// Mark the server verified (monitored) immediately
        #[arg(short, long)]
        verified: bool,
    },

    /// Remove a server from the registry
    Remove { id: i64 },

    /// Mark a server verified or unverified
    Verify {
        id: i64,

        /// Clear the verified flag instead of setting it
        #[arg(long)]
        unverify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    match args.command {
        Command::Run => cmd_run(config).await,
        Command::Servers { action } => cmd_servers(&config, action),
        Command::History {
            user,
            media_type,
            active,
            page,
            per_page,
        } => cmd_history(&config, user, media_type, active, page, per_page),
        Command::Status => cmd_status(&config),
        Command::Cleanup => cmd_cleanup(&config),
    }
}

fn open_database(config: &Config) -> Result<Arc<Database>> {
    let db = Database::open(&config.database_path()).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(Arc::new(db))
}

async fn cmd_run(config: Config) -> Result<()> {
    let _log_guard = streamwatch_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    let db = open_database(&config)?;
    let monitoring = config.monitoring.clone();

    // Revalidate sessions left active by the previous process before any
    // collector starts producing events
    let maintenance = MaintenanceService::new(Arc::clone(&db), monitoring.clone());
    let report = maintenance
        .startup_recovery(db.as_ref())
        .await
        .context("startup recovery failed")?;
    if report.sessions_ended > 0 {
        println!(
            "Recovered {} session(s) left open by the previous run",
            report.sessions_ended
        );
    }

    let (events_tx, events_rx) = mpsc::channel(monitoring.event_buffer);
    let ingest = IngestService::new(Arc::clone(&db), monitoring.clone());
    let ingest_handle = ingest.start(events_rx);

    let registry: Arc<dyn ServerRegistry> = db.clone();
    let orchestrator = Orchestrator::new(registry, events_tx, monitoring.clone());
    let supervisor = orchestrator.start();

    let (maintenance_stop, maintenance_stop_rx) = watch::channel(false);
    let maintenance_handle =
        MaintenanceService::new(Arc::clone(&db), monitoring).start(maintenance_stop_rx);

    println!("streamwatch running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    println!("Shutting down...");

    // Stop collectors first so no new events are produced, then close the
    // channel (dropping the orchestrator drops the last sender) and let the
    // ingestion service drain
    orchestrator.stop().await;
    let _ = supervisor.await;
    drop(orchestrator);
    let _ = maintenance_stop.send(true);
    let _ = maintenance_handle.await;
    let _ = ingest_handle.await;

    println!("Stopped");
    Ok(())
}

fn cmd_servers(config: &Config, action: ServersAction) -> Result<()> {
    let db = open_database(config)?;

    match action {
        ServersAction::List => {
            let servers = db.list_servers()?;
            if servers.is_empty() {
                println!("No servers registered. Add one with 'streamwatch servers add'.");
                return Ok(());
            }
            println!(
                "{:<5} {:<20} {:<15} {:<35} {:>9}",
                "ID", "Name", "Type", "URL", "Verified"
            );
            println!("{:-<86}", "");
            for server in servers {
                println!(
                    "{:<5} {:<20} {:<15} {:<35} {:>9}",
                    server.id,
                    server.name,
                    server.server_type,
                    server.url,
                    if server.verified { "yes" } else { "no" }
                );
            }
        }
        ServersAction::Add {
            name,
            url,
            server_type,
            api_key,
            verified,
        } => {
            let server = db.insert_server(&name, &server_type, &url, &api_key, verified)?;
            println!(
                "Registered {} (id {}, {} -> {})",
                server.name,
                server.id,
                server.server_type,
                server.kind()
            );
            if !verified {
                println!("Server is unverified; run 'streamwatch servers verify {}' to monitor it", server.id);
            }
        }
        ServersAction::Remove { id } => {
            db.delete_server(id)?;
            println!("Removed server {}", id);
        }
        ServersAction::Verify { id, unverify } => {
            db.set_server_verified(id, !unverify)?;
            println!(
                "Server {} is now {}",
                id,
                if unverify { "unverified" } else { "verified" }
            );
        }
    }
    Ok(())
}

fn cmd_history(
    config: &Config,
    user: Option<String>,
    media_type: Option<String>,
    active: bool,
    page: usize,
    per_page: usize,
) -> Result<()> {
    let db = open_database(config)?;
    let query = QueryService::new(db);

    let filter = ActivityFilter {
        user_name: user,
        media_type,
        active_only: active,
        page,
        per_page,
        ..Default::default()
    };
    let result = query.history(&filter)?;

    if result.sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<20} {:<15} {:<30} {:<10} {:>8} {:>9}",
        "Started", "User", "Media", "Status", "Length", "Segments"
    );
    println!("{:-<96}", "");
    for session in &result.sessions {
        let media = match (&session.series_name, &session.media_title) {
            (Some(series), Some(title)) => format!("{} - {}", series, title),
            (_, Some(title)) => title.clone(),
            _ => "Unknown".to_string(),
        };
        println!(
            "{:<20} {:<15} {:<30} {:<10} {:>8} {:>9}",
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.user_name.as_deref().unwrap_or("Unknown"),
            truncate(&media, 30),
            session.status.as_deref().unwrap_or("-"),
            format_duration(session.duration_ms),
            session.grouped_session_ids.len(),
        );
    }
    println!();
    println!(
        "Page {} of {} ({} viewing session(s) total)",
        result.page,
        (result.total_groups as usize).div_ceil(per_page.max(1)).max(1),
        result.total_groups
    );
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let query = QueryService::new(db);

    let activity = query.server_activity()?;
    if activity.is_empty() {
        println!("No servers registered.");
        return Ok(());
    }

    println!(
        "{:<5} {:<20} {:>7} {:>7} {:<20}",
        "ID", "Server", "Active", "Total", "Last Activity"
    );
    println!("{:-<62}", "");
    for server in activity {
        let last = server
            .last_activity
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<5} {:<20} {:>7} {:>7} {:<20}",
            server.server_id, server.server_name, server.active_sessions, server.total_sessions, last
        );
    }
    Ok(())
}

fn cmd_cleanup(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let maintenance = MaintenanceService::new(db, config.monitoring.clone());
    let removed = maintenance.cleanup_retention()?;
    if removed > 0 {
        println!("Deleted {} session(s) past the retention horizon", removed);
    } else {
        println!("Nothing to clean up.");
    }
    Ok(())
}

fn format_duration(ms: Option<i64>) -> String {
    let Some(ms) = ms else {
        return "-".to_string();
    };
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

//! devark - prompt capture and scoring for AI coding assistants
//!
//! Operator CLI: inspect sessions, score prompts, manage hooks and auth,
//! and push selected sessions to the cloud backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devark_core::detect::hooks;
use devark_core::sessions::SessionFilter;
use devark_core::types::{PromptDetectedEvent, Session, SessionMessage, SessionSource};
use devark_core::sync::SyncOptions;
use devark_core::Services;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

#[derive(Parser)]
#[command(name = "devark")]
#[command(about = "Prompt capture and scoring for AI coding assistants")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, provider, and auth status
    Status,
    /// List recent sessions across tools
    Sessions {
        /// Restrict to one source (cursor, claude)
        #[arg(long)]
        source: Option<String>,
        /// Maximum sessions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Score a prompt through the active provider
    Score {
        /// The prompt text
        text: String,
    },
    /// Show the analyzed prompt history
    History,
    /// Store the cloud auth token
    Login {
        /// The API token
        token: String,
    },
    /// Remove the stored auth token
    Logout,
    /// Upload recent sessions to the backend
    Sync {
        /// Only sessions from these workspace names
        #[arg(long)]
        project: Vec<String>,
        /// Only sessions active within the last N days
        #[arg(long, default_value = "7")]
        days: i64,
    },
    /// Install hook scripts into a project
    InstallHooks {
        /// Project directory (defaults to the current directory)
        #[arg(long)]
        project: Option<PathBuf>,
        /// Also install the optional Cursor hooks
        #[arg(long)]
        cursor: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let services = Services::open_default().context("failed to initialize devark")?;
    let _log_guard = devark_core::logging::init(&services.config.get().logging)
        .context("failed to initialize logging")?;

    match cli.command {
        Command::Status => status(&services),
        Command::Sessions { source, limit } => sessions(&services, source, limit),
        Command::Score { text } => score(&services, &text),
        Command::History => history(&services),
        Command::Login { token } => login(&services, &token),
        Command::Logout => logout(&services),
        Command::Sync { project, days } => sync(&services, project, days),
        Command::InstallHooks { project, cursor } => install_hooks(project, cursor),
    }
}

fn status(services: &Services) -> Result<()> {
    let config = services.config.get();

    println!("Config: {}", services.config.path().display());
    println!(
        "API URL: {}",
        config.api_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "Signed in: {}",
        if services.tokens.has_token() { "yes" } else { "no" }
    );
    println!(
        "Detection: {} (auto-analyze: {})",
        if config.detection.enabled { "enabled" } else { "disabled" },
        config.detection.auto_analyze
    );

    println!("Providers:");
    for (id, status) in services.providers.detect_all() {
        let marker = if Some(id.as_str()) == config.active_provider.as_deref() {
            "*"
        } else {
            " "
        };
        if status.available {
            println!("  {} {} available", marker, id);
        } else {
            println!(
                "  {} {} unavailable ({})",
                marker,
                id,
                status.reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    Ok(())
}

fn sessions(services: &Services, source: Option<String>, limit: usize) -> Result<()> {
    let filter = match source {
        Some(raw) => Some(SessionFilter {
            source: Some(raw.parse::<SessionSource>().map_err(|e| anyhow::anyhow!(e))?),
            since: None,
        }),
        None => None,
    };

    let sessions = services.sessions.list_sessions(filter.as_ref());
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    for session in sessions.iter().take(limit) {
        println!(
            "{:7} {:10} {:24} {:4} prompts  last active {}",
            session.source.to_string(),
            session.status.as_str(),
            session.workspace_name,
            session.prompt_count,
            session.last_activity.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn score(services: &Services, text: &str) -> Result<()> {
    let provider = services
        .providers
        .active()
        .context("no LLM provider available")?;

    let event = PromptDetectedEvent {
        source: SessionSource::Claude,
        session_id: "cli".to_string(),
        text: text.to_string(),
        timestamp: chrono::Utc::now(),
        context: None,
        skip_reason: None,
    };
    let analyzed = services
        .scoring
        .analyze(provider, &event)
        .context("scoring failed")?
        .context("prompt was skipped")?;

    println!("Score: {:.1}/10", analyzed.score);
    if let Some(breakdown) = &analyzed.breakdown {
        for (name, dim) in [
            ("specificity", &breakdown.specificity),
            ("context", &breakdown.context),
            ("intent", &breakdown.intent),
            ("actionability", &breakdown.actionability),
            ("constraints", &breakdown.constraints),
        ] {
            match &dim.feedback {
                Some(feedback) => println!("  {:14} {:4.1}  {}", name, dim.score, feedback),
                None => println!("  {:14} {:4.1}", name, dim.score),
            }
        }
    }
    if let Some(improved) = &analyzed.improved_version {
        println!("\nImproved version:\n  {}", improved);
    }

    services.history.add_prompt(analyzed)?;
    Ok(())
}

fn history(services: &Services) -> Result<()> {
    let stats = services.history.daily_stats();
    println!(
        "Today: {} analyzed, average {:.1}",
        stats.analyzed_today, stats.avg_score
    );

    for prompt in services.history.history() {
        println!(
            "{}  {:4.1}  {}",
            prompt.timestamp.format("%m-%d %H:%M"),
            prompt.score,
            prompt.truncated_text
        );
    }
    Ok(())
}

fn login(services: &Services, token: &str) -> Result<()> {
    services
        .tokens
        .store_token(token)
        .context("failed to store token")?;
    println!("Token stored.");
    Ok(())
}

fn logout(services: &Services) -> Result<()> {
    services
        .tokens
        .clear_token()
        .context("failed to clear token")?;
    println!("Signed out.");
    Ok(())
}

fn sync(services: &Services, projects: Vec<String>, days: i64) -> Result<()> {
    let engine = services
        .sync_engine()
        .context("sync is not configured; set apiUrl and run `devark login <token>`")?;

    let since = chrono::Utc::now() - chrono::Duration::days(days);
    let listed = services.sessions.list_sessions(Some(&SessionFilter {
        source: None,
        since: Some(since),
    }));

    let mut candidates: Vec<(Session, Vec<SessionMessage>)> = Vec::new();
    for session in listed {
        match services.sessions.get_messages(session.source, &session.id) {
            Ok(messages) => candidates.push((session, messages)),
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Skipping unreadable session");
            }
        }
    }

    let cancel = AtomicBool::new(false);
    let pb = ProgressBar::new(candidates.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    let options = SyncOptions {
        projects: (!projects.is_empty()).then_some(projects),
        since: Some(since),
        until: None,
    };
    let report = engine
        .sync(
            &candidates,
            &options,
            |current, total, session_id| {
                pb.set_length(total as u64);
                pb.set_position(current as u64);
                pb.set_message(session_id.to_string());
            },
            &cancel,
        )
        .context("sync failed")?;
    pb.finish_and_clear();

    println!("\nSync complete:");
    println!("  Sessions uploaded: {}", report.sessions_uploaded);
    println!("  Sessions skipped:  {}", report.sessions_skipped);
    if !report.failures.is_empty() {
        println!("  Failures ({}):", report.failures.len());
        for (id, err) in &report.failures {
            println!("    {}: {}", id, err);
        }
    }
    Ok(())
}

fn install_hooks(project: Option<PathBuf>, cursor: bool) -> Result<()> {
    let project_dir = match project {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let sync_binary = std::env::current_exe()
        .context("cannot locate devark binary")?
        .with_file_name("devark-sync");

    let changed = hooks::install_claude_hooks(&project_dir, &sync_binary)
        .context("failed to install Claude hooks")?;
    println!(
        "Claude hooks: {}",
        if changed { "installed" } else { "already installed" }
    );

    if cursor {
        let changed = hooks::install_cursor_hooks(&project_dir, &sync_binary)
            .context("failed to install Cursor hooks")?;
        println!(
            "Cursor hooks: {}",
            if changed { "installed" } else { "already installed" }
        );
    }
    Ok(())
}

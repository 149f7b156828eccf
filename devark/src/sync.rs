//! devark-sync - hook endpoint and capture loop
//!
//! Two jobs, one binary:
//!
//! - **Hook mode** (`--hook-trigger=...`): invoked by the hook entries
//!   installed into `.claude/settings.json` (and optionally
//!   `.cursor/hooks.json`). Reads the hook payload from stdin, extracts the
//!   prompt, and appends one line to the detection queue under `~/.devark`.
//!   Must never break the calling tool: failures are logged and swallowed.
//!
//! - **Watch mode** (`--watch`): runs the prompt detection service in a
//!   polling loop, scoring detected prompts through the active provider and
//!   persisting them to the history store.

use anyhow::{Context, Result};
use clap::Parser;
use devark_core::config::{queue_path, ConfigStore};
use devark_core::detect::claude::{append_queue_record, ClaudeHookAdapter, QueueRecord};
use devark_core::detect::cursor::CursorPollAdapter;
use devark_core::detect::PromptDetectionService;
use devark_core::scoring::{ProviderRegistry, ScoringPipeline};
use devark_core::store::history::PromptHistoryStore;
use devark_core::store::token::TokenStore;
use devark_core::store::FileKeyValueStore;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "devark-sync")]
#[command(about = "Capture prompts from AI coding assistants")]
#[command(version)]
struct Args {
    /// Hook mode: which hook event fired (UserPromptSubmit, Stop)
    #[arg(long)]
    hook_trigger: Option<String>,

    /// Watch mode - run the detection loop until interrupted
    #[arg(short, long)]
    watch: bool,

    /// Poll interval in milliseconds (only with --watch)
    #[arg(long)]
    poll: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(trigger) = args.hook_trigger.as_deref() {
        // Hook mode never fails the calling tool
        if let Err(e) = run_hook(trigger) {
            eprintln!("devark-sync hook error: {}", e);
        }
        return Ok(());
    }

    let config_store = ConfigStore::open_default().context("failed to open config")?;
    let config = config_store.get();
    let _log_guard =
        devark_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("devark-sync starting");

    if args.watch {
        run_watch(config_store, args.poll)
    } else {
        run_once(config_store)
    }
}

/// Append the hook payload to the detection queue.
fn run_hook(trigger: &str) -> Result<()> {
    let mut payload = String::new();
    std::io::stdin()
        .read_to_string(&mut payload)
        .context("failed to read hook payload")?;

    let record = QueueRecord::from_hook_payload(trigger, &payload);
    append_queue_record(&queue_path(), &record).context("failed to append to queue")?;
    Ok(())
}

fn build_service(config_store: &ConfigStore) -> PromptDetectionService {
    let config = config_store.get();
    let mut service = PromptDetectionService::new(&config.detection);

    service.register_adapter(Box::new(CursorPollAdapter::new()));
    let install = std::env::current_exe().ok().and_then(|binary| {
        std::env::current_dir()
            .ok()
            .map(|project_dir| devark_core::detect::claude::HookInstall {
                project_dir,
                sync_binary: binary,
            })
    });
    service.register_adapter(Box::new(ClaudeHookAdapter::new(install)));

    service.initialize();
    service
}

/// One detection pass: drain whatever the adapters have and print it.
fn run_once(config_store: ConfigStore) -> Result<()> {
    let mut service = build_service(&config_store);
    service.start();
    let events = service.tick();
    service.stop();

    if events.is_empty() {
        println!("No new prompts.");
    } else {
        for event in &events {
            println!(
                "[{}] {} {}: {}",
                event.timestamp.format("%H:%M:%S"),
                event.source,
                event.session_id,
                event.text
            );
        }
    }
    Ok(())
}

/// Continuous capture with scoring.
fn run_watch(config_store: ConfigStore, poll_override: Option<u64>) -> Result<()> {
    let config = config_store.get();
    let poll_ms = poll_override.unwrap_or(config.detection.poll_interval_ms);

    let tokens = Arc::new(TokenStore::new(config_store.clone()));
    let registry = Arc::new(
        ProviderRegistry::from_config(config_store.clone(), &tokens)
            .context("failed to build provider registry")?,
    );
    let pipeline = Arc::new(ScoringPipeline::new());
    let history = Arc::new(PromptHistoryStore::new(Arc::new(
        FileKeyValueStore::open_default().context("failed to open stores")?,
    )));
    history.initialize().context("failed to load history")?;

    let mut service = build_service(&config_store);
    let auto_analyze = service.auto_analyze();

    {
        let registry = registry.clone();
        let pipeline = pipeline.clone();
        let history = history.clone();
        service.on_prompt(move |event| {
            let timestamp = chrono::Local::now().format("%H:%M:%S");
            println!(
                "[{}] {} {}: {}",
                timestamp, event.source, event.session_id, event.text
            );

            if !auto_analyze || !event.should_score() {
                return;
            }
            let provider = match registry.active() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "No provider for auto-analysis");
                    return;
                }
            };
            match pipeline.analyze(provider, event) {
                Ok(Some(analyzed)) => {
                    println!("         score: {:.1}", analyzed.score);
                    if let Err(e) = history.add_prompt(analyzed) {
                        tracing::warn!(error = %e, "Failed to persist analyzed prompt");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Prompt analysis failed");
                }
            }
        });
    }

    service.start();

    // Ctrl+C flips the flag; the loop exits at the next tick
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active (poll every {}ms). Press Ctrl+C to stop.",
        poll_ms
    );
    service.run_blocking(poll_ms, &running);
    service.stop();

    println!("Watch mode stopped.");
    tracing::info!("devark-sync watch mode stopped");
    Ok(())
}

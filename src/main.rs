use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use helm_core::events::AgentEvent;
use helm_core::ids::SessionId;
use helm_engine::{AutoApprove, Coordinator, DenyAll, LoggingReporter, PermissionGate};
use helm_llm::factory::DefaultProviderFactory;
use helm_settings::Settings;
use helm_store::Database;
use helm_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "helm", version, about = "Coding agent runtime")]
struct Cli {
    /// Settings file to use instead of ~/.helm/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a prompt to completion and print the answer.
    Run {
        prompt: String,
        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
        /// Working directory for file tools. Defaults to the current directory.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Deny every tool permission request.
        #[arg(long)]
        deny_tools: bool,
    },
    /// List recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List configured sub-agents.
    Subagents,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => helm_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => helm_settings::load_settings().context("loading settings")?,
    };
    settings.validate().context("invalid settings")?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.logging.level.clone());
    let _telemetry = init_telemetry(TelemetryConfig::from_level_name(&level, settings.logging.json));

    let data_dir = settings.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("helm.db");
    let db = Database::open(&db_path).context("opening session database")?;
    info!(path = %db_path.display(), "database opened");

    match cli.command {
        Command::Run {
            prompt,
            session,
            cwd,
            deny_tools,
        } => {
            let permissions: Arc<dyn PermissionGate> = if deny_tools {
                Arc::new(DenyAll)
            } else {
                Arc::new(AutoApprove)
            };
            let coordinator = Arc::new(build_coordinator(db, &settings, permissions)?);
            run_prompt(coordinator, prompt, session, cwd).await
        }
        Command::Sessions { limit } => {
            let coordinator = build_coordinator(db, &settings, Arc::new(DenyAll))?;
            for s in coordinator.sessions().list(limit)? {
                println!(
                    "{}\t{}\t{} msgs\t${:.4}\t{}",
                    s.id,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.message_count,
                    s.cost,
                    s.title
                );
            }
            Ok(())
        }
        Command::Subagents => {
            let coordinator = build_coordinator(db, &settings, Arc::new(DenyAll))?;
            let agents = coordinator.list_subagents();
            if agents.is_empty() {
                println!("no sub-agents configured");
            }
            for agent in agents {
                println!("{}\t{}", agent.name, agent.description);
            }
            Ok(())
        }
    }
}

fn build_coordinator(
    db: Database,
    settings: &Settings,
    permissions: Arc<dyn PermissionGate>,
) -> Result<Coordinator> {
    let factory = DefaultProviderFactory::new(settings.provider.clone(), &settings.retry);
    let coordinator = Coordinator::new(db, Arc::new(factory), settings, permissions)
        .context("building coordinator")?;
    coordinator.set_status_reporter(Some(Arc::new(LoggingReporter)));
    Ok(coordinator)
}

async fn run_prompt(
    coordinator: Arc<Coordinator>,
    prompt: String,
    session: Option<String>,
    cwd: Option<PathBuf>,
) -> Result<()> {
    let session_id = match session {
        Some(raw) => SessionId::from_raw(raw),
        None => {
            let cwd = match cwd {
                Some(dir) => dir,
                None => std::env::current_dir().context("reading current directory")?,
            };
            let title: String = prompt.chars().take(60).collect();
            coordinator
                .create_session(&title, &cwd.to_string_lossy())
                .context("creating session")?
                .id
        }
    };

    let mut events = coordinator.subscribe();
    let printer_session = session_id.clone();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Ok(event) = events.recv().await {
            match event {
                AgentEvent::TextDelta { session_id, delta } if session_id == printer_session => {
                    let _ = stdout.write_all(delta.as_bytes()).await;
                    let _ = stdout.flush().await;
                }
                AgentEvent::RunEnd { session_id, .. } if session_id == printer_session => break,
                _ => {}
            }
        }
    });

    let interrupt = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling active runs");
                coordinator.cancel_all().await;
            }
        })
    };

    let result = coordinator.run(&session_id, &prompt).await;
    interrupt.abort();
    // RunEnd is not sent when the run was refused up front.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    println!();

    let result = result.with_context(|| format!("run failed for session {session_id}"))?;
    info!(
        session_id = %result.session_id,
        turns = result.turns,
        cost = result.cost,
        summarized = result.summarized,
        "run complete"
    );
    eprintln!("session {} (${:.4})", result.session_id, result.cost);
    Ok(())
}

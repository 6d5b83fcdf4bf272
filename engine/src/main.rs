use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use takt_engine::{EngineConfig, PieceEngine, PieceEngineOptions};
use takt_engine::{AiJudge, NullAiJudge};
use takt_engine::rules::RuleEvaluator;
use takt_engine::session_log::SessionLog;
use takt_observability::{init_process_logging, ProcessKind};
use takt_providers::{Agent, AgentOutcome, AgentRegistry, MockAgent};
use takt_types::{PieceConfig, PieceStatus};
use tracing::info;

/// Minimal driving binary: demonstrates the piece engine against the mock provider and a piece
/// loaded from a JSON fixture. YAML loading, `@scope` resolution, and every other loader concern
/// stay out of scope here.
#[derive(Parser, Debug)]
#[command(name = "takt")]
#[command(about = "Piece engine driving binary")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a piece to completion against the mock provider.
    Run {
        /// Path to a normalized PieceConfig JSON fixture.
        piece: PathBuf,
        /// Task text threaded into every movement's instruction.
        task: String,
        /// Optional path to a JSON array of scripted mock agent outcomes
        /// (`[{"content": "...", "status": "done"}, ...]`), replayed in call order.
        #[arg(long)]
        script: Option<PathBuf>,
        /// Working directory the mock provider reports files under.
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        /// Directory the session log and report files are written to.
        #[arg(long, default_value = ".takt/run")]
        run_dir: PathBuf,
    },
}

/// Maps a terminal outcome to the enclosing tool's exit-code convention: `0` success, `3` piece
/// execution failure, `130` on SIGINT. `2`/`4`/`5` are unreachable from this binary (no
/// argument-fetch, git, or PR work happens here) but are named for completeness.
fn exit_code_for(status: PieceStatus, reason: Option<&takt_types::TerminalReason>) -> i32 {
    match status {
        PieceStatus::Completed => 0,
        PieceStatus::Aborted => {
            if matches!(reason, Some(takt_types::TerminalReason::UserInterrupted)) {
                130
            } else {
                3
            }
        }
        PieceStatus::Running => 3,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { piece, task, script, cwd, run_dir } => {
            let logs_dir = run_dir.join("logs");
            let _logging = init_process_logging(ProcessKind::Cli, &logs_dir, 14)
                .context("failed to initialize logging")?;

            let config_text = std::fs::read_to_string(&piece)
                .with_context(|| format!("reading piece config at {}", piece.display()))?;
            let config: PieceConfig = serde_json::from_str(&config_text)
                .with_context(|| format!("parsing piece config at {}", piece.display()))?;

            let outcomes = match script {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading mock script at {}", path.display()))?;
                    parse_script(&text)?
                }
                None => Vec::new(),
            };
            let mock = Arc::new(MockAgent::new("mock", outcomes)) as Arc<dyn Agent>;
            let registry = AgentRegistry::new(vec![mock], Some("mock".to_string()));

            let evaluator = RuleEvaluator::with_defaults(Arc::new(NullAiJudge) as Arc<dyn AiJudge>);

            let session_log = SessionLog::open(&run_dir, uuid::Uuid::new_v4().to_string())
                .context("opening session log")?;

            let engine = PieceEngine::new(
                config,
                task,
                registry,
                evaluator,
                PieceEngineOptions {
                    cwd: Some(cwd.clone()),
                    report_dir: Some(run_dir.clone()),
                    engine_config: Some(EngineConfig::default().with_env_overrides()),
                    session_log: Some(session_log),
                    ..PieceEngineOptions::default()
                },
            )
            .context("constructing piece engine")?;

            let handle = engine.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.abort(takt_types::TerminalReason::UserInterrupted);
                }
            });

            let terminal = engine.run().await.context("piece engine run failed")?;
            info!(
                status = ?terminal.status,
                iteration = terminal.iteration,
                "piece run finished"
            );
            println!("{}", serde_json::to_string_pretty(&terminal)?);

            std::process::exit(exit_code_for(terminal.status, terminal.reason.as_ref()));
        }
    }
}

fn parse_script(text: &str) -> anyhow::Result<Vec<AgentOutcome>> {
    #[derive(serde::Deserialize)]
    struct ScriptedOutcome {
        content: String,
        #[serde(default)]
        status: Option<String>,
    }

    let entries: Vec<ScriptedOutcome> = serde_json::from_str(text).context("parsing mock script JSON")?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry.status.as_deref() {
            Some("error") => AgentOutcome::error(entry.content),
            Some("interrupted") => AgentOutcome::interrupted(),
            _ => AgentOutcome::done(entry.content),
        })
        .collect())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mindkeep::config::EngineConfig;
use mindkeep::database::MemoryType;
use mindkeep::runtime::EngineRuntime;
use mindkeep::{AskRequest, RememberRequest};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mindkeep", about = "Conversation orchestration over stored assistants and memories")]
struct Cli {
    /// Config file to use instead of mindkeep_config.toml next to the binary
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt to an assistant and record the turn
    Ask {
        #[arg(long)]
        assistant: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        chat: Option<String>,
        #[arg(long)]
        session: Option<String>,
        prompt: String,
    },
    /// Rank assistants for a task description
    Suggest {
        description: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Task success rate and feedback for one assistant
    Evaluate { assistant: String },
    /// Store a memory owned by an assistant
    Remember {
        #[arg(long)]
        assistant: String,
        #[arg(long, default_value = "knowledge")]
        kind: MemoryType,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        focus: bool,
        content: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_path(path)?
            .with_context(|| format!("config file {:?} does not exist", path)),
        None => Ok(EngineConfig::load()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mindkeep=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let runtime = EngineRuntime::bootstrap(config).context("failed to bootstrap engine runtime")?;
    let engine = runtime.orchestrator.clone();

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(async move {
        match cli.command {
            Command::Ask {
                assistant,
                user,
                chat,
                session,
                prompt,
            } => {
                let response = engine
                    .ask(&AskRequest {
                        assistant_id: assistant,
                        user_id: user,
                        chat_id: chat,
                        session_id: session,
                        prompt,
                    })
                    .await?;
                print_json(&response)
            }
            Command::Suggest { description, tags } => {
                print_json(&engine.suggest_assistants(&description, &tags)?)
            }
            Command::Evaluate { assistant } => print_json(&engine.evaluate_performance(&assistant)?),
            Command::Remember {
                assistant,
                kind,
                tags,
                focus,
                content,
            } => {
                let outcome = engine.remember(&RememberRequest {
                    assistant_id: assistant,
                    content,
                    memory_type: kind,
                    tags,
                    focus,
                })?;
                print_json(&outcome)
            }
        }
    })
}

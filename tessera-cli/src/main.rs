//! Tessera CLI -- host surfaces for the inference worker.

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tessera_core::{TaskKind, WorkerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tessera",
    about = "Tessera - message-driven inference worker",
    version
)]
struct Cli {
    /// Worker config file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model source override, repeatable.
    #[arg(long = "source", global = true, value_name = "TASK=REPO[:FILE]")]
    sources: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak the JSON-lines host protocol on stdin/stdout.
    Worker,
    /// Run one task and stream its output.
    Run {
        /// Task name, e.g. translation or text-generation.
        task: TaskKind,

        /// Input text.
        #[arg(short, long)]
        text: Option<String>,

        /// Source language (translation).
        #[arg(long)]
        from: Option<String>,

        /// Target language (translation).
        #[arg(long)]
        to: Option<String>,

        /// Question (question-answering).
        #[arg(long)]
        question: Option<String>,

        /// Context passage (question-answering).
        #[arg(long)]
        context: Option<String>,

        #[command(flatten)]
        generation: cmd::run::GenerationArgs,
    },
    /// Serve tasks over HTTP with SSE streaming.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Show version, backends and registered task sources.
    Info,
}

fn load_config(path: Option<&std::path::Path>, overrides: &[String]) -> Result<WorkerConfig> {
    let mut config = match path {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    for entry in overrides {
        config.apply_override(entry)?;
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries the worker protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.sources)?;

    match cli.command {
        Commands::Worker => cmd::worker::execute(config).await,
        Commands::Run {
            task,
            text,
            from,
            to,
            question,
            context,
            generation,
        } => {
            let request = cmd::run::TaskArgs {
                task,
                text,
                from,
                to,
                question,
                context,
                generation,
            };
            cmd::run::execute(config, request).await
        }
        Commands::Serve { host, port } => cmd::serve::execute(config, &host, port).await,
        Commands::Info => cmd::info::execute(&config),
    }
}

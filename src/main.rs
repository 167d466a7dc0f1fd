//! # Media Dispatch CLI (`mdispatch`)
//!
//! ## Usage
//!
//! ```bash
//! mdispatch --config ./config/dispatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mdispatch tasks` | List the task table |
//! | `mdispatch start_server <task_id> [inputs...]` | Tail inputs and serve batches for one task |
//! | `mdispatch start_client <task_id>` | Pull batches, process them, push results |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use media_dispatch::client::run_client;
use media_dispatch::config;
use media_dispatch::logging::{self, LogFormat};
use media_dispatch::progress::ProgressMode;
use media_dispatch::server::{run_server, ServerOptions};
use media_dispatch::tasks::TaskRegistry;

/// Batch work distribution for offline media feature extraction.
#[derive(Parser)]
#[command(name = "mdispatch", version)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it is absent.
    #[arg(long, global = true, default_value = "./config/dispatch.toml")]
    config: PathBuf,

    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every known task with its port, processor and sinks.
    Tasks,

    /// Tail the inputs and serve their batches to workers.
    ///
    /// Exits once all input has been consumed and every batch acknowledged.
    #[command(name = "start_server")]
    StartServer {
        /// Task id (see `mdispatch tasks`).
        task_id: String,

        /// Input files or directories of `<hash>\t<json>` lines.
        inputs: Vec<PathBuf>,

        /// Reprocess records whose output already exists.
        #[arg(long)]
        force: bool,

        /// Items per batch (overrides `dispatch.batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Run a worker for a task.
    #[command(name = "start_client")]
    StartClient {
        /// Task id (see `mdispatch tasks`).
        task_id: String,

        /// Server scheme and host (overrides `client.server_url`); the task's
        /// port is appended.
        #[arg(long)]
        server: Option<String>,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let cfg = config::load_or_default(&cli.config)?;
    let mut registry = TaskRegistry::with_builtins();
    registry.apply_config(&cfg)?;

    match cli.command {
        Commands::Tasks => {
            println!(
                "{:<22} {:>5}  {:<16} {:<16} {:<12} VECTORS",
                "TASK", "PORT", "PROCESSOR", "FIELD", "INDEX"
            );
            for task in registry.tasks() {
                let processor = if registry.has_processor(&task.processor) {
                    task.processor.clone()
                } else {
                    format!("{} (ext)", task.processor)
                };
                println!(
                    "{:<22} {:>5}  {:<16} {:<16} {:<12} {}",
                    task.task_id,
                    task.port,
                    processor,
                    task.field_name,
                    format!("{:?}", task.index_update).to_lowercase(),
                    if task.vectors { "yes" } else { "no" }
                );
            }
        }
        Commands::StartServer {
            task_id,
            inputs,
            force,
            batch_size,
            progress,
        } => {
            let opts = ServerOptions {
                inputs,
                force,
                batch_size,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            run_server(&cfg, &registry, &task_id, opts).await?;
        }
        Commands::StartClient {
            task_id,
            server,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_client(&cfg, &registry, &task_id, server.as_deref(), progress.reporter()).await?;
        }
    }

    Ok(())
}

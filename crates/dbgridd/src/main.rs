//! dbgridd — the dbgrid daemon.
//!
//! Runs one coordinator node: metadata store and journal, local database
//! engines, heartbeats, gossip, hibernation and replacement.
//!
//! # Usage
//!
//! ```text
//! dbgridd standalone --config /etc/dbgrid/dbgrid.toml --ensure orders
//! dbgridd default-config > dbgrid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod standalone;

#[derive(Parser)]
#[command(name = "dbgridd", about = "dbgrid database clustering daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node on the in-process bus.
    Standalone {
        /// Path to dbgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides `node.peer_id`.
        #[arg(long)]
        peer_id: Option<String>,

        /// Overrides `node.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Databases to create or wake at startup. Repeatable.
        #[arg(long = "ensure")]
        ensure: Vec<String>,

        /// Record launches instead of spawning engine processes.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Standalone {
            config,
            peer_id,
            data_dir,
            ensure,
            dry_run,
        } => {
            let config = standalone::resolve_config(config.as_deref(), peer_id, data_dir)?;
            standalone::run(config, ensure, dry_run).await
        }
        Command::DefaultConfig => {
            print!("{}", dbgrid_core::Config::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dbgridd=debug,dbgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

//! scriptd
//!
//! Remote script-execution server and its interactive shell client.
//! Configuration comes from `--config`, or from the `SCRIPTD_CONFIG` env var.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scriptd::capability::Capabilities;
use scriptd::config::Config;
use scriptd::server::{Supervisor, SupervisorError};
use scriptd::shell::{run_shell, ShellOptions};

#[derive(Parser, Debug)]
#[command(name = "scriptd")]
#[command(about = "Remote script execution server", version)]
struct Args {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server
    Serve,

    /// Submit lines typed at the terminal as scripts
    Shell {
        /// Server address (host:port)
        #[arg(long)]
        addr: Option<String>,

        /// Working directory sent with every script
        #[arg(long)]
        dir: Option<String>,

        /// Owner whose services the scripts may call
        #[arg(long)]
        owner: Option<String>,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // stderr keeps stdout free for shell output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(run(args.command, config));
    // A script may still hold a blocking worker; exit without joining it.
    runtime.shutdown_background();
    result
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    match command {
        Command::Serve => serve(config).await,
        Command::Shell { addr, dir, owner } => {
            let options = ShellOptions {
                addr: addr.unwrap_or(config.shell.addr),
                working_dir: dir.unwrap_or(config.shell.working_dir),
                owner,
            };
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            run_shell(&options, stdin, tokio::io::stdout()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(config: Config) -> Result<ExitCode> {
    info!(
        listen = %config.listen_addr(),
        socket_dir = %config.server.socket_dir.display(),
        restart_mode = ?config.server.restart_mode,
        "Loaded configuration"
    );

    let capabilities = Capabilities::headless(config.display.width, config.display.height);
    match Supervisor::new(config, capabilities).run().await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(SupervisorError::AlreadyRunning(path)) => {
            eprintln!("scriptd is already running ({})", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(SupervisorError::Fatal(e)) => Err(e),
    }
}

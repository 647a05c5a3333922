//! ShardKV command runner
//!
//! Boots an in-process shard set and runs commands against it.
//!
//! # Examples
//!
//! ```bash
//! # Fill four shards and print the size histogram
//! shardkv --shards 4 run "DEBUG POPULATE 100000 key 32 RAND" "DEBUG OBJHIST"
//!
//! # Several commands in one argument
//! shardkv run "SET a 1 EX 10; DEBUG OBJECT a"
//!
//! # Show the effective configuration
//! shardkv --config shardkv.toml config
//! ```

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use shardkv::command::Reply;
use shardkv::{ServerConfig, Service};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// ShardKV - sharded in-memory key-value store
#[derive(Parser, Debug)]
#[command(name = "shardkv")]
#[command(version = shardkv::VERSION)]
#[command(about = "ShardKV - sharded in-memory key-value store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "SHARDKV_CONFIG")]
    config: Option<PathBuf>,

    /// Number of shards (overrides the configuration)
    #[arg(long, global = true)]
    shards: Option<usize>,

    /// Number of populate workers (overrides the configuration)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Snapshot directory (overrides the configuration)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "SHARDKV_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run commands in order against a fresh shard set
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Commands to run; `;` separates several commands in one argument
    #[arg(required = true)]
    commands: Vec<String>,

    /// Database index the commands run against
    #[arg(long, default_value = "0")]
    db: u16,

    /// Print Prometheus metrics after the last command
    #[arg(long)]
    metrics: bool,

    /// Stop at the first error reply
    #[arg(long)]
    fail_fast: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = effective_config(&cli)?;
    match cli.command {
        Commands::Run(args) => run_command(config, args).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("ShardKV {}", shardkv::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "shardkv.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn effective_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(shards) = cli.shards {
        config.shard_count = shards;
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if let Some(dir) = &cli.dir {
        config.dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Splits arguments into commands on `;` and whitespace
fn parse_commands(raw: &[String]) -> Vec<Vec<Bytes>> {
    raw.iter()
        .flat_map(|arg| arg.split(';'))
        .map(|cmd| {
            cmd.split_whitespace()
                .map(|tok| Bytes::copy_from_slice(tok.as_bytes()))
                .collect::<Vec<_>>()
        })
        .filter(|cmd| !cmd.is_empty())
        .collect()
}

async fn run_command(config: ServerConfig, args: RunArgs) -> anyhow::Result<()> {
    let service = Service::new(config)?;
    let commands = parse_commands(&args.commands);
    info!(commands = commands.len(), db = args.db, "Running commands");

    let mut failures = 0;
    for cmd in &commands {
        let line = cmd
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        println!("> {}", line);

        let reply = service.execute(args.db, cmd).await;
        println!("{}", reply);
        if let Reply::Error(msg) = &reply {
            failures += 1;
            error!(command = %line, error = %msg, "Command failed");
            if args.fail_fast {
                break;
            }
        }
    }

    if args.metrics {
        print!("{}", shardkv::metrics::render());
    }
    if failures > 0 {
        anyhow::bail!("{} command(s) failed", failures);
    }
    Ok(())
}

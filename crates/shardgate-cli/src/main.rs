//! # Shardgate CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Route a workload through a 4-shard in-memory cluster
//! shardgate simulate --shards 4 --docs 5000 --batch-size 200
//!
//! # Same, with router settings from a file
//! shardgate simulate --config shardgate.json
//!
//! # Show the configuration the router would run with
//! shardgate config --config shardgate.json
//! ```
//!
//! Configuration files are JSON; every field is optional:
//!
//! ```json
//! {"command_retry": {"max_attempts": 3}, "cursors": {"default_batch_size": 50}}
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use shardgate_cli::simulate::{self, SimulationOptions};
use shardgate_router::RouterConfig;

/// Shardgate - request router for a partitioned document cluster
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Simulate(SimulateArgs),
    Config(ConfigArgs),
}

/// Arguments for a simulated workload.
///
/// The workload inserts `--docs` documents into a collection partitioned
/// across `--shards` shards, reads them back through a router cursor and
/// counts them with a command. The summary, including the router's metrics
/// snapshot, is printed as JSON on stdout.
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
/// run a workload against an in-memory cluster
struct SimulateArgs {
    /// number of shards in the simulated cluster
    #[argh(option, short = 's', default = "3")]
    shards: usize,

    /// number of documents to insert
    #[argh(option, short = 'd', default = "1000")]
    docs: usize,

    /// documents requested per batch (0 lets the router decide)
    #[argh(option, short = 'b', long = "batch-size", default = "0")]
    batch_size: i32,

    /// path to a JSON router configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// override the number of command attempts on a stale topology
    #[argh(option, long = "max-command-attempts")]
    max_command_attempts: Option<usize>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "config")]
/// print the effective router configuration
struct ConfigArgs {
    /// path to a JSON router configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,
}

fn load_config(path: Option<&str>) -> Result<RouterConfig> {
    match path {
        Some(path) => RouterConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => Ok(RouterConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // logs go to stderr so stdout stays machine-readable
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate(args) => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(attempts) = args.max_command_attempts {
                config = config.with_max_command_attempts(attempts);
            }
            config.validate()?;

            let options = SimulationOptions {
                shards: args.shards,
                documents: args.docs,
                batch_size: args.batch_size,
            };
            tracing::info!(
                "Simulating {} document(s) across {} shard(s)",
                options.documents,
                options.shards
            );

            let summary = simulate::run(&options, config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Config(args) => {
            let config = load_config(args.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

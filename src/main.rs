//! keygate binary: parse the CLI, load config, provision the root account,
//! then hand off to the gateway serve loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use keygate::auth::SqliteAuthStore;
use keygate::config::Config;
use keygate::{bootstrap, gateway};

#[derive(Parser)]
#[command(name = "keygate", version, about = "Small, fast identity service")]
struct Cli {
    /// Path to the config file (default: ./keygate.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Load and validate the config, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Command::Serve { host, port } => {
            let store = Arc::new(SqliteAuthStore::open(&config.database.path)?);
            bootstrap::ensure_root(&config, store.as_ref())?;

            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            gateway::run_gateway(&host, port, &config, store).await
        }
        Command::CheckConfig => {
            println!("config ok");
            Ok(())
        }
    }
}

/// RUST_LOG wins when set; otherwise default to our own info-level spans.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keygate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

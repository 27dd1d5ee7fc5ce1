use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use driftwire::cluster::MemoryProviderMap;
use driftwire::config;
use driftwire::error::ServerError;
use driftwire::storage::MemoryStorage;

#[derive(Parser)]
#[command(name = "driftwire", about = "Realtime record-synchronization server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:6021")]
    bind: String,

    /// Optional TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the server's cluster identity.
    #[arg(long)]
    server_name: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        tracing::error!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> driftwire::Result<()> {
    let mut options = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => config::Options::default(),
    };
    if let Some(server_name) = cli.server_name {
        options.server_name = server_name;
    }
    if options.server_name.is_empty() {
        options.server_name = uuid::Uuid::new_v4().to_string();
    }

    let listener = TcpListener::bind(&cli.bind).map_err(|source| ServerError::Bind {
        addr: cli.bind.clone(),
        source,
    })?;
    tracing::info!(bind = %cli.bind, server_name = %options.server_name, "starting");

    driftwire::server::run(
        options,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryProviderMap::new()),
        listener,
    )
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

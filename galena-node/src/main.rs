use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use galena_config::GalenaConfig;
use galena_node::{init_logging, run_node, Interrupted};

#[derive(Parser)]
#[command(name = "galena-node", version, about = "galena proof-of-work node")]
struct Cli {
    /// Bind IP
    #[arg(long)]
    host: Option<String>,
    /// Bind port
    #[arg(long)]
    port: Option<u16>,
    /// Bootstrap peers, comma separated <IP>:<PORT>
    #[arg(long, value_delimiter = ',')]
    seeds: Option<Vec<String>>,
    /// Keep every block instead of the bounded cache
    #[arg(long)]
    full_node: bool,
    /// In-memory budget for non-full nodes, in KB
    #[arg(long)]
    cache: Option<u64>,
    /// Control socket path (unix) / pipe name (windows)
    #[arg(long)]
    socket_path: Option<String>,
    /// Verbose logging
    #[arg(long)]
    debug: bool,
    /// Log to this file instead of stderr
    #[arg(long)]
    logging_filename: Option<String>,
    /// Disable logging entirely
    #[arg(long)]
    no_logging: bool,
    /// Optional TOML config file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

fn build_config(cli: &Cli) -> anyhow::Result<GalenaConfig> {
    let mut config = GalenaConfig::load(cli.config.as_deref())?;
    if let Some(host) = &cli.host {
        config.network.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(seeds) = &cli.seeds {
        config.network.seeds = seeds.clone();
    }
    if cli.full_node {
        config.global.full_node = true;
    }
    if let Some(cache) = cli.cache {
        config.global.cache_kb = cache;
    }
    if let Some(path) = &cli.socket_path {
        config.network.socket_path = path.clone();
    }
    if cli.debug {
        config.global.debug = true;
    }
    if let Some(filename) = &cli.logging_filename {
        config.logger.filename = Some(filename.clone());
    }
    if cli.no_logging {
        config.logger.logging = false;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bad configuration: {err:#}");
            return ExitCode::from(2);
        }
    };
    if let Err(err) = init_logging(&config) {
        eprintln!("could not set up logging: {err:#}");
        return ExitCode::from(2);
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start runtime: {err:#}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run_node(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is::<Interrupted>() => ExitCode::from(1),
        Err(err) => {
            tracing::error!(%err, "node stopped with a fatal error");
            ExitCode::from(2)
        }
    }
}

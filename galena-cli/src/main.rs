//! Command-line client for a running node: connects to the control socket,
//! sends one command line, prints the result and decodes the error bitset.

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use galena_config::DEFAULT_SOCKET_PATH;
use galena_node::{CliCommand, CliError};

#[derive(Parser)]
#[command(name = "galena-cli", version, about = "talk to a running galena node")]
struct Cli {
    /// Node control socket path (unix) / pipe name (windows)
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send coins to a recipient public key
    Trx { recipient: String, amount: u64 },
    /// Print the wallet balance
    Balance,
    /// Print a block by hash, or the last one
    Block {
        /// Block hash; omit with --last for the tip
        hash: Option<String>,
        #[arg(long)]
        last: bool,
    },
    /// Show pending transactions
    Mempool,
    /// List current neighbors
    Neighbors,
    /// Control the miner
    Mining {
        /// on | off | state
        action: String,
    },
}

impl Command {
    fn encode(&self) -> Result<(CliCommand, Vec<String>)> {
        Ok(match self {
            Command::Trx { recipient, amount } => (
                CliCommand::Trx,
                vec![recipient.clone(), amount.to_string()],
            ),
            Command::Balance => (CliCommand::Balance, vec![]),
            Command::Block { hash, last } => {
                let arg = match (hash, last) {
                    (Some(hash), false) => hash.clone(),
                    (None, true) => "--last".to_string(),
                    _ => anyhow::bail!("pass a block hash or --last"),
                };
                (CliCommand::Block, vec![arg])
            }
            Command::Mempool => (CliCommand::Mempool, vec![]),
            Command::Neighbors => (CliCommand::Neighbors, vec![]),
            Command::Mining { action } => (CliCommand::Mining, vec![action.clone()]),
        })
    }
}

#[cfg(unix)]
async fn exchange(socket_path: &str, line: &str) -> Result<(String, u32)> {
    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("is the node running? no socket at {socket_path}"))?;
    talk(stream, line).await
}

#[cfg(windows)]
async fn exchange(socket_path: &str, line: &str) -> Result<(String, u32)> {
    use tokio::net::windows::named_pipe::ClientOptions;
    let stream = ClientOptions::new()
        .open(socket_path)
        .with_context(|| format!("is the node running? no pipe at {socket_path}"))?;
    talk(stream, line).await
}

async fn talk<S>(stream: S, line: &str) -> Result<(String, u32)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(line.as_bytes()).await?;
    let mut result = String::new();
    stream.read_line(&mut result).await?;
    let mut bits = String::new();
    stream.read_line(&mut bits).await?;
    let bits: u32 = bits.trim().parse().context("malformed error bitset")?;
    Ok((result.trim_end().to_string(), bits))
}

async fn run(cli: Cli) -> Result<bool> {
    let (code, args) = cli.command.encode()?;
    let line = if args.is_empty() {
        format!("{}\n", code as u8)
    } else {
        format!("{} {}\n", code as u8, args.join(" "))
    };
    let (result, bits) = exchange(&cli.socket_path, &line).await?;
    if !result.is_empty() {
        // pretty-print JSON payloads, pass anything else through
        match serde_json::from_str::<serde_json::Value>(&result) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(_) => println!("{result}"),
        }
    }
    let errors = CliError::from_bits_truncate(bits);
    for message in errors.messages() {
        eprintln!("{message}");
    }
    Ok(errors.is_empty())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start runtime: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

//! The local control socket: a line-oriented command protocol a separate
//! CLI binary speaks over a unix socket (or a named pipe on windows).
//!
//! Request: `<command_code> <arg> ...\n`. Reply: one line of result
//! payload, then one line with the OR-combined error bitset.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::context::Context;

/// Command codes of the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CliCommand {
    Trx = 1,
    Balance = 2,
    Block = 3,
    Mempool = 4,
    Neighbors = 5,
    Mining = 6,
}

impl CliCommand {
    pub fn from_code(code: u8) -> Option<Self> {
        use CliCommand::*;
        Some(match code {
            1 => Trx,
            2 => Balance,
            3 => Block,
            4 => Mempool,
            5 => Neighbors,
            6 => Mining,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Error bits; several can be reported at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CliError: u32 {
        const BAD_USAGE = 1;
        const NOT_FOUND = 1 << 1;
        const TRX_PROBLEM = 1 << 2;
        const MINING_ON = 1 << 3;
        const MINING_OFF = 1 << 4;
    }
}

impl CliError {
    pub const NOTHING: CliError = CliError::empty();

    /// Human-readable rendering of every set bit.
    pub fn messages(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(CliError::BAD_USAGE) {
            out.push("ERROR: bad usage for command");
        }
        if self.contains(CliError::NOT_FOUND) {
            out.push("ERROR: not found your request");
        }
        if self.contains(CliError::TRX_PROBLEM) {
            out.push("ERROR: problem in build and send transaction");
        }
        if self.contains(CliError::MINING_ON) {
            out.push("ERROR: mining was already working");
        }
        if self.contains(CliError::MINING_OFF) {
            out.push("ERROR: mining has already been stopped");
        }
        out
    }
}

pub struct ControlServer {
    ctx: Arc<Context>,
}

impl ControlServer {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[cfg(unix)]
    pub async fn start(self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.ctx.config.network.socket_path.clone();
        if std::path::Path::new(&path).exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
        info!(path, "control socket is listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                handle_stream(ctx, stream).await;
            });
        }
    }

    #[cfg(windows)]
    pub async fn start(self) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let path = self.ctx.config.network.socket_path.clone();
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        info!(path, "control pipe is listening");
        loop {
            server.connect().await?;
            let connected = server;
            server = ServerOptions::new().create(&path)?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                handle_stream(ctx, connected).await;
            });
        }
    }
}

async fn handle_stream<S>(ctx: Arc<Context>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    if let Err(err) = stream.read_line(&mut line).await {
        error!(%err, "could not read control command");
        return;
    }
    debug!(command = line.trim(), "control command received");
    let (result, errors) = dispatch(&ctx, line.trim()).await;
    let reply = format!("{result}\n{}\n", errors.bits());
    if let Err(err) = stream.get_mut().write_all(reply.as_bytes()).await {
        error!(%err, "could not write control reply");
    }
}

async fn dispatch(ctx: &Arc<Context>, line: &str) -> (String, CliError) {
    let mut parts = line.split_whitespace();
    let code = parts
        .next()
        .and_then(|c| c.parse::<u8>().ok())
        .and_then(CliCommand::from_code);
    let args: Vec<&str> = parts.collect();
    match code {
        Some(command) => execute(ctx, command, &args).await,
        None => (String::new(), CliError::BAD_USAGE),
    }
}

/// Run one control command against the node state.
pub async fn execute(ctx: &Arc<Context>, command: CliCommand, args: &[&str]) -> (String, CliError) {
    let mut errors = CliError::NOTHING;
    let mut result = String::new();
    match command {
        CliCommand::Trx => {
            let (recipient, amount) = match (args.first(), args.get(1).and_then(|a| a.parse().ok()))
            {
                (Some(recipient), Some(amount)) => (recipient.to_string(), amount),
                _ => return (result, CliError::BAD_USAGE),
            };
            let sent = ctx
                .wallet
                .send_coin(&recipient, amount, &ctx.mempool, &ctx.unspent, &ctx.node)
                .await;
            if !sent {
                errors |= CliError::TRX_PROBLEM;
            }
        }
        CliCommand::Balance => {
            result = ctx.wallet.balance(&ctx.unspent.read()).to_string();
        }
        CliCommand::Block => match args.first() {
            Some(&"--last") => match ctx.chain.read().last_block() {
                Some(block) => result = serde_json::to_string(block).unwrap_or_default(),
                None => errors |= CliError::NOT_FOUND,
            },
            Some(hash) => {
                let chain = ctx.chain.read();
                match chain.search(hash) {
                    Some(index) => {
                        result = serde_json::to_string(&chain.blocks[index]).unwrap_or_default()
                    }
                    None => errors |= CliError::NOT_FOUND,
                }
            }
            None => errors |= CliError::BAD_USAGE,
        },
        CliCommand::Mempool => {
            let mempool = ctx.mempool.read();
            result = json!({
                "count": mempool.len(),
                "in_mining": mempool.mining_hashes(),
            })
            .to_string();
        }
        CliCommand::Neighbors => {
            let hostnames: Vec<String> = ctx
                .node
                .neighbors()
                .iter()
                .map(|a| a.hostname())
                .collect();
            result = serde_json::to_string(&hostnames).unwrap_or_default();
        }
        CliCommand::Mining => match args.first() {
            Some(&"on") => {
                if ctx.flags.is_paused() {
                    ctx.flags.resume();
                } else {
                    errors |= CliError::MINING_ON;
                }
            }
            Some(&"off") => {
                if !ctx.flags.is_paused() {
                    ctx.flags.pause();
                } else {
                    errors |= CliError::MINING_OFF;
                }
            }
            Some(&"state") => {
                result = if ctx.flags.is_paused() {
                    "stopped".into()
                } else {
                    "running".into()
                };
            }
            _ => errors |= CliError::BAD_USAGE,
        },
    }
    (result, errors)
}

//! Node assembly: composition root, message handler, mining task, control
//! socket and the supervisor that runs them.

pub mod context;
pub mod control;
pub mod handler;
pub mod mining;

pub use context::Context;
pub use control::{CliCommand, CliError, ControlServer};
pub use handler::ProcessingHandler;

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, Level};

use galena_config::GalenaConfig;

/// The node was stopped by a signal; maps to exit code 1.
#[derive(Debug, Error)]
#[error("interrupted")]
pub struct Interrupted;

pub fn init_logging(config: &GalenaConfig) -> Result<()> {
    if !config.logger.logging {
        return Ok(());
    }
    let level = if config.global.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match &config.logger.filename {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
        }
    }
    Ok(())
}

/// Bring the node up: build the context, discover neighbors, adopt the
/// network's chain, then run the listener, the control socket and the
/// mining task until one of them dies or a signal arrives.
pub async fn run_node(config: GalenaConfig) -> Result<()> {
    let ctx = Context::build(config).await?;
    ctx.node
        .set_handler(Arc::new(ProcessingHandler::new(Arc::clone(&ctx))));

    // An empty seed list is fine: the node runs standalone and still mines.
    let network_chain = ctx.node.start_up(&ctx.config.network.seeds, true).await;
    if !network_chain.is_empty() {
        ctx.flags.pause();
        let check = {
            let mut chain = ctx.chain.write();
            let mut unspent = ctx.unspent.write();
            chain.resolve(&network_chain, &mut unspent, &ctx.difficulty)
        };
        ctx.flags.resume();
        info!(ok = check.ok, height = ctx.chain.read().height(), "adopted network chain");
    }

    let listen = tokio::spawn(Arc::clone(&ctx.node).listen());
    let control = tokio::spawn(ControlServer::new(Arc::clone(&ctx)).start());
    let _mining = if ctx.config.global.mining {
        Some(tokio::spawn(mining::mining_task(Arc::clone(&ctx))))
    } else {
        None
    };

    tokio::select! {
        result = listen => {
            error!("listener stopped");
            result??;
        }
        result = control => {
            error!("control socket stopped");
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            ctx.flags.pause();
            ctx.node.reset();
            return Err(Interrupted.into());
        }
    }
    Ok(())
}

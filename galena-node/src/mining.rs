//! The mining task: run the miner forever, gossip what it finds, and react
//! to what the neighbors say about it.

use std::sync::Arc;

use tracing::{info, warn};

use galena_core::Block;
use galena_storage::BlockStore;
use galena_network::{Errno, NeighborError};

use crate::context::Context;

/// Loop the miner until the task is cancelled. Each mined block is
/// persisted, gossiped, and the neighbor verdicts acted upon.
pub async fn mining_task(ctx: Arc<Context>) {
    let miner = ctx.miner();
    loop {
        let Some(block) = miner.mine(None).await else {
            // attempt abandoned (reorg or fresher tip); rebuild and retry
            tokio::task::yield_now().await;
            continue;
        };
        if let Some(store) = &ctx.store {
            if let Err(err) = store.insert_block(&block).await {
                warn!(%err, "could not persist mined block");
            }
        }
        let errors = ctx.node.send_mined_block(&block).await;
        handle_gossip_errors(&ctx, &block, errors).await;
    }
}

/// §4.12: BAD_BLOCK_VALIDATION triggers a self-recheck (and local rollback
/// when the neighbor was right); OBSOLETE_BLOCK means the neighbor is
/// ahead, so catch up from them. Anything else is recorded and the
/// broadcast goes on.
async fn handle_gossip_errors(ctx: &Arc<Context>, block: &Block, errors: Vec<NeighborError>) {
    for error in errors {
        match error.errno {
            Errno::BadBlockValidation => {
                if self_recheck_failed(ctx, block) {
                    warn!(hash = %block.block_hash, "neighbor was right, rolling our block back");
                    roll_back_tip(ctx, block);
                    break;
                }
                info!(peer = %error.addr.hostname(), "neighbor rejected a block we re-validated fine");
            }
            Errno::ObsoleteBlock => {
                info!(peer = %error.addr.hostname(), "neighbor is ahead, catching up");
                if let Some(blocks) = ctx.node.fetch_blocks(&error.addr, 0).await {
                    ctx.flags.pause();
                    let check = {
                        let mut chain = ctx.chain.write();
                        let mut unspent = ctx.unspent.write();
                        chain.resolve(&blocks, &mut unspent, &ctx.difficulty)
                    };
                    ctx.flags.resume();
                    if check.ok {
                        ctx.flags.restart();
                    } else {
                        warn!(?check, "catch-up chain failed validation");
                    }
                }
            }
            other => {
                warn!(peer = %error.addr.hostname(), ?other, "neighbor rejected our block");
            }
        }
    }
}

/// Re-validate our own tip the way a receiver would: against the unspent
/// set as of its predecessor.
fn self_recheck_failed(ctx: &Arc<Context>, block: &Block) -> bool {
    let chain = ctx.chain.read();
    let unspent = ctx.unspent.read();
    if chain.last_block_hash() != block.block_hash {
        // the tip moved on; nothing to recheck
        return false;
    }
    let mut before = unspent.clone();
    block.revert_unspent(&mut before);
    let validation = block.is_valid(&before, &block.previous_hash, &ctx.difficulty);
    !validation.is_all()
}

fn roll_back_tip(ctx: &Arc<Context>, block: &Block) {
    ctx.flags.pause();
    {
        let mut chain = ctx.chain.write();
        let mut unspent = ctx.unspent.write();
        if chain.last_block_hash() == block.block_hash {
            block.revert_unspent(&mut unspent);
            chain.blocks.pop();
        }
    }
    ctx.flags.resume();
    ctx.flags.restart();
}

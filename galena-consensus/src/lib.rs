//! The mining loop: nonce search over the current tip, interruptible by the
//! message handlers through a set of shared flags.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use galena_core::{Block, Blockchain, Difficulty, Mempool, Trx, UnspentCoins};

/// Nonces tried between scheduler yields; the network task must stay
/// responsive while the search is hot.
const NONCE_BATCH: u64 = 512;

/// Cooperative interruption contract between the miner and the chain
/// mutation paths. All flags are read at every iteration boundary.
#[derive(Debug, Default)]
pub struct MinerFlags {
    /// Abandon the current attempt and rebuild against the new tip.
    pub start_over: AtomicBool,
    /// Set once the current attempt found a valid nonce.
    pub mined_new: AtomicBool,
    /// Pause the search; the holder of a chain critical section raises
    /// this and lowers it when done.
    pub stop_mining: AtomicBool,
    /// Restart the nonce from zero on the next iteration.
    pub reset_nonce: AtomicBool,
}

impl MinerFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Raise `stop_mining` around a chain mutation.
    pub fn pause(&self) {
        self.stop_mining.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stop_mining.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.stop_mining.load(Ordering::SeqCst)
    }

    /// Ask the miner to rebuild against the (changed) tip.
    pub fn restart(&self) {
        self.start_over.store(true, Ordering::SeqCst);
    }
}

pub struct Miner {
    chain: Arc<RwLock<Blockchain>>,
    unspent: Arc<RwLock<UnspentCoins>>,
    mempool: Arc<RwLock<Mempool>>,
    flags: Arc<MinerFlags>,
    difficulty: Difficulty,
    /// Wire-form public key the subsidy pays to.
    public_key: String,
}

impl Miner {
    pub fn new(
        chain: Arc<RwLock<Blockchain>>,
        unspent: Arc<RwLock<UnspentCoins>>,
        mempool: Arc<RwLock<Mempool>>,
        flags: Arc<MinerFlags>,
        difficulty: Difficulty,
        public_key: String,
    ) -> Self {
        Self {
            chain,
            unspent,
            mempool,
            flags,
            difficulty,
            public_key,
        }
    }

    pub fn flags(&self) -> Arc<MinerFlags> {
        Arc::clone(&self.flags)
    }

    /// One mining attempt. Searches nonces over a block keyed to the tip
    /// (or over `setup_block` when supplied), folding in mempool arrivals,
    /// until the hash meets the difficulty, the tip advances underneath
    /// us, or `start_over` fires.
    ///
    /// On success the block is appended locally (validation skipped — we
    /// mined it ourselves), its transactions leave the mempool, and the
    /// block is returned for the caller to gossip.
    pub async fn mine(&self, setup_block: Option<Block>) -> Option<Block> {
        let mut block = match setup_block {
            Some(block) => block,
            None => {
                let chain = self.chain.read();
                let subsidy = Trx::subsidy(chain.height() + 1, self.public_key.clone());
                chain.setup_new_block(subsidy, &self.mempool.read())
            }
        };
        let baseline_height = block.height.saturating_sub(1);
        let mut baseline: HashSet<String> =
            block.trx_hashes().into_iter().skip(1).collect();

        self.flags.mined_new.store(false, Ordering::SeqCst);
        self.flags.start_over.store(false, Ordering::SeqCst);
        debug!(height = block.height, "mining attempt started");

        loop {
            if self.flags.start_over.swap(false, Ordering::SeqCst) {
                debug!("mining attempt abandoned: start over");
                return None;
            }
            if self.chain.read().height() > baseline_height {
                debug!("mining attempt abandoned: tip advanced");
                return None;
            }
            if self.flags.reset_nonce.swap(false, Ordering::SeqCst) {
                block.set_nonce(0);
            }
            if self.flags.stop_mining.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
                continue;
            }

            self.merge_fresh_transactions(&mut block, &mut baseline);

            let mut found = false;
            for _ in 0..NONCE_BATCH {
                block.block_hash = block.calc_hash();
                if self.difficulty.met_by(&block.block_hash) {
                    found = true;
                    break;
                }
                block.nonce += 1;
            }
            if found {
                self.flags.mined_new.store(true, Ordering::SeqCst);
                break;
            }
            tokio::task::yield_now().await;
        }

        if !self.commit(&block) {
            debug!("tip moved before the mined block could be committed");
            return None;
        }
        info!(height = block.height, hash = %block.block_hash, "mined a block");
        Some(block)
    }

    /// Newer mempool admissions join the in-flight block, up to its
    /// capacity; the Merkle root and hash are rebuilt when they do.
    fn merge_fresh_transactions(&self, block: &mut Block, baseline: &mut HashSet<String>) {
        let mempool = self.mempool.read();
        let room = mempool
            .max_mining
            .saturating_sub(block.transactions.len().saturating_sub(1));
        if room == 0 {
            return;
        }
        let fresh: Vec<Trx> = mempool
            .iter_mining()
            .filter(|t| !baseline.contains(&t.hash))
            .take(room)
            .cloned()
            .collect();
        drop(mempool);
        if fresh.is_empty() {
            return;
        }
        for trx in fresh {
            debug!(hash = %trx.hash, "folding mempool transaction into attempt");
            baseline.insert(trx.hash.clone());
            block.add_trx(trx);
        }
    }

    /// Append the mined block and strip its transactions from the mempool.
    /// Refused if the tip moved since the attempt started. Lock order:
    /// chain, unspent, mempool.
    fn commit(&self, block: &Block) -> bool {
        let mut chain = self.chain.write();
        let mut unspent = self.unspent.write();
        let mut mempool = self.mempool.write();
        if chain.last_block_hash() != block.previous_hash {
            return false;
        }
        chain.add_new_block(block.clone(), &mut unspent, true, &self.difficulty);
        let mined: Vec<String> = block
            .transactions
            .iter()
            .filter(|t| !t.is_subsidy)
            .map(|t| t.hash.clone())
            .collect();
        mempool.remove_many(&mined);
        true
    }
}

//! The composition root: every shared subsystem handle in one place,
//! passed explicitly to the handlers and the miner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use galena_config::GalenaConfig;
use galena_consensus::{Miner, MinerFlags};
use galena_core::{Blockchain, Difficulty, Mempool, UnspentCoins};
use galena_network::{Addr, Node};
use galena_storage::SqliteStore;
use galena_wallet::{default_wallet_dir, Wallet};

pub struct Context {
    pub config: GalenaConfig,
    pub chain: Arc<RwLock<Blockchain>>,
    pub unspent: Arc<RwLock<UnspentCoins>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub wallet: Arc<Wallet>,
    pub flags: Arc<MinerFlags>,
    pub difficulty: Difficulty,
    pub node: Arc<Node>,
    pub store: Option<Arc<SqliteStore>>,
}

impl Context {
    pub async fn build(config: GalenaConfig) -> Result<Arc<Self>> {
        let wallet_dir = config
            .wallet_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_wallet_dir);
        let wallet = Arc::new(Wallet::open(&wallet_dir)?);
        info!(public_key = %wallet.public_key(), "wallet ready");

        let chain = if config.global.full_node {
            Blockchain::new(Vec::new())
        } else {
            Blockchain::with_cache(config.global.cache_kb)
        };
        let difficulty = Difficulty::from_shift(config.global.difficulty_shift);

        let node = Node::new(
            Addr::with_key(
                config.network.host.clone(),
                config.network.port,
                wallet.public_key(),
            ),
            config.network.max_neighbors,
            Duration::from_secs(config.network.timeout_secs),
        );

        let store = match &config.database.path {
            Some(path) => Some(Arc::new(SqliteStore::open(path).await?)),
            None => None,
        };

        Ok(Arc::new(Self {
            mempool: Arc::new(RwLock::new(Mempool::new(config.global.max_mining))),
            chain: Arc::new(RwLock::new(chain)),
            unspent: Arc::new(RwLock::new(UnspentCoins::new())),
            wallet,
            flags: MinerFlags::new(),
            difficulty,
            node,
            store,
            config,
        }))
    }

    pub fn miner(&self) -> Miner {
        Miner::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.unspent),
            Arc::clone(&self.mempool),
            Arc::clone(&self.flags),
            self.difficulty,
            self.wallet.public_key(),
        )
    }
}

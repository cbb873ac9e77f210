//! The wallet: owns the node's keypair, reads balances out of the unspent
//! set and sends coins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{info, warn};

use galena_core::{Coin, Mempool, Trx, UnspentCoins};
use galena_crypto::{KeyPair, SigPair};
use galena_network::Node;

pub struct Wallet {
    keys: KeyPair,
}

impl Wallet {
    /// Load the keypair under `dir`, generating and persisting a fresh one
    /// the first time.
    pub fn open(dir: &Path) -> Result<Self> {
        let keys = match KeyPair::load(dir) {
            Ok(keys) => keys,
            Err(_) => {
                let keys = KeyPair::generate();
                keys.save(dir)?;
                info!(dir = %dir.display(), "generated a new wallet key");
                keys
            }
        };
        Ok(Self { keys })
    }

    /// An in-memory wallet with no key files.
    pub fn ephemeral() -> Self {
        Self {
            keys: KeyPair::generate(),
        }
    }

    /// Wire form of the public key.
    pub fn public_key(&self) -> String {
        self.keys.public_wire()
    }

    pub fn sign(&self, msg_hash: &str) -> Result<SigPair> {
        Ok(self.keys.sign(msg_hash)?)
    }

    /// Sum of the unspent values this key owns.
    pub fn balance(&self, unspent: &UnspentCoins) -> u64 {
        self.own_coins(unspent)
            .values()
            .flatten()
            .map(|c| c.value)
            .sum()
    }

    /// Our unspent coins, grouped by creating transaction.
    pub fn own_coins(&self, unspent: &UnspentCoins) -> HashMap<String, Vec<Coin>> {
        unspent.coins_of(&self.public_key())
    }

    /// Build, sign, locally admit and gossip a payment. `false` when the
    /// funds do not cover it or the mempool rejects it; neighbor errors
    /// are logged but do not undo the local admission.
    pub async fn send_coin(
        &self,
        recipient: &str,
        value: u64,
        mempool: &RwLock<Mempool>,
        unspent: &RwLock<UnspentCoins>,
        node: &Node,
    ) -> bool {
        let sender = self.public_key();
        let trx = {
            let unspent = unspent.read();
            match Trx::build(&unspent.coins_of(&sender), &sender, recipient, value) {
                Ok(trx) => trx,
                Err(err) => {
                    warn!(%err, "could not build transaction");
                    return false;
                }
            }
        };
        let Ok(signature) = self.keys.sign(&trx.hash) else {
            warn!("could not sign transaction");
            return false;
        };
        let accepted = {
            let unspent = unspent.read();
            mempool.write().add(trx.clone(), &signature, &sender, &unspent)
        };
        if !accepted {
            warn!(hash = %trx.hash, "mempool rejected our own transaction");
            return false;
        }
        let errors = node.send_new_trx(&trx, &signature, &sender).await;
        if !errors.is_empty() {
            warn!(rejected_by = errors.len(), hash = %trx.hash, "neighbors rejected transaction");
        }
        true
    }
}

/// Where keys live when no directory is configured.
pub fn default_wallet_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".galena")
        .join("keys")
}

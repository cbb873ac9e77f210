//! Ledger model: coins, transactions, blocks, the unspent-coin set, the
//! chain itself and the mempool.

pub mod block;
pub mod blockchain;
pub mod mempool;
pub mod merkle;
pub mod trx;
pub mod utxo;

pub use block::{Block, BlockValidation};
pub use blockchain::{Blockchain, ChainCheck};
pub use mempool::Mempool;
pub use merkle::MerkleTree;
pub use trx::{Coin, Trx, TrxError};
pub use utxo::UnspentCoins;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed block reward paid to the miner by the first transaction of a block.
pub const SUBSIDY: u64 = 50;

/// 2022-01-01T00:00:00Z. No valid transaction predates the network.
pub const GENESIS_EPOCH: i64 = 1_640_995_200;

/// Default capacity of the mempool's mining sublist.
pub const DEFAULT_MAX_MINING: usize = 10;

/// Default in-memory budget for non-full nodes, in kilobytes.
pub const DEFAULT_CACHE_KB: u64 = 1500;

/// Default difficulty: a 256-bit all-ones target shifted right 24 bits.
pub const DEFAULT_DIFFICULTY_SHIFT: u32 = 24;

pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The proof-of-work target. A block hash, read as a 256-bit big-endian
/// integer, must be less than or equal to it. Process-wide constant,
/// configured once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difficulty(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl Difficulty {
    /// `(2^256 - 1) >> shift`.
    pub fn from_shift(shift: u32) -> Self {
        let mut target = [0xffu8; 32];
        let full = (shift / 8) as usize;
        for byte in target.iter_mut().take(full.min(32)) {
            *byte = 0;
        }
        if full < 32 {
            target[full] = 0xff >> (shift % 8);
        }
        Difficulty(target)
    }

    /// Does a hex block hash satisfy this target?
    pub fn met_by(&self, hash_hex: &str) -> bool {
        match hex::decode(hash_hex) {
            Ok(bytes) if bytes.len() == 32 => bytes.as_slice() <= &self.0[..],
            _ => false,
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::from_shift(DEFAULT_DIFFICULTY_SHIFT)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(de)?;
        let decoded = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

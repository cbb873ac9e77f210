//! Coins (UTXO entries) and transactions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utxo::UnspentCoins;
use crate::{now_ts, sha256_hex, GENESIS_EPOCH, SUBSIDY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrxError {
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
}

/// One unspent (or spent) output. Owned by the transaction that created it;
/// the unspent-coin index holds copies, never back-references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coin {
    pub owner: String,
    pub value: u64,
    #[serde(default)]
    pub created_trx_hash: String,
    #[serde(default)]
    pub out_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spending_trx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_index: Option<u32>,
}

impl Coin {
    pub fn new(owner: impl Into<String>, value: u64) -> Self {
        Self {
            owner: owner.into(),
            value,
            created_trx_hash: String::new(),
            out_index: 0,
            spending_trx_hash: None,
            in_index: None,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.spending_trx_hash.is_some()
    }

    /// Coin identity: the spending slot index once spent, the output slot
    /// before that.
    pub fn coin_hash(&self) -> String {
        let index = self.in_index.unwrap_or(self.out_index);
        sha256_hex(&format!(
            "{}{}{}{}",
            self.value, self.owner, self.created_trx_hash, index
        ))
    }

    /// Same unspent output? Compares the creating slot, ignoring any
    /// spending annotations stamped on one side.
    pub fn same_output(&self, other: &Coin) -> bool {
        self.owner == other.owner
            && self.value == other.value
            && self.created_trx_hash == other.created_trx_hash
            && self.out_index == other.out_index
    }
}

/// A transfer of coins. `inputs` reference unspent coins, `outputs` are the
/// coins it mints. The first transaction of a block is the subsidy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trx {
    pub inputs: Vec<Coin>,
    pub outputs: Vec<Coin>,
    /// Sum of output values.
    pub value: u64,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_block: Option<u64>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub is_subsidy: bool,
    pub hash: String,
}

impl Trx {
    /// The block reward: no inputs, one output of the fixed subsidy value.
    pub fn subsidy(block_height: u64, miner_public_key: impl Into<String>) -> Self {
        let mut trx = Self {
            inputs: Vec::new(),
            outputs: vec![Coin::new(miner_public_key, SUBSIDY)],
            value: SUBSIDY,
            time: now_ts(),
            include_block: Some(block_height),
            sender: String::new(),
            is_subsidy: true,
            hash: String::new(),
        };
        trx.seal();
        trx
    }

    pub fn new(
        block_height: u64,
        sender: impl Into<String>,
        inputs: Vec<Coin>,
        outputs: Vec<Coin>,
    ) -> Self {
        Self::with_time(block_height, sender, inputs, outputs, now_ts())
    }

    pub fn with_time(
        block_height: u64,
        sender: impl Into<String>,
        inputs: Vec<Coin>,
        outputs: Vec<Coin>,
        time: i64,
    ) -> Self {
        let value = outputs.iter().map(|c| c.value).sum();
        let mut trx = Self {
            inputs,
            outputs,
            value,
            time,
            include_block: Some(block_height),
            sender: sender.into(),
            is_subsidy: false,
            hash: String::new(),
        };
        trx.seal();
        trx
    }

    /// Build a spend of `value` from `sender` to `recipient`, selecting
    /// inputs greedily from `owner_coins` (the sender's unspent coins
    /// grouped by creating transaction).
    pub fn build(
        owner_coins: &HashMap<String, Vec<Coin>>,
        sender: &str,
        recipient: &str,
        value: u64,
    ) -> Result<Self, TrxError> {
        let mut inputs = Vec::new();
        let mut gathered = 0u64;
        'select: for coins in owner_coins.values() {
            for coin in coins {
                if coin.owner != sender {
                    continue;
                }
                gathered += coin.value;
                inputs.push(coin.clone());
                if gathered >= value {
                    break 'select;
                }
            }
        }
        if gathered < value {
            return Err(TrxError::InsufficientFunds {
                needed: value,
                available: gathered,
            });
        }
        let mut outputs = vec![Coin::new(recipient, value)];
        if gathered > value {
            outputs.push(Coin::new(sender, gathered - value));
        }
        Ok(Self::new(0, sender, inputs, outputs))
    }

    /// Identity: sha256 over input owners, output owners, value and time.
    /// A subsidy has no senders; its containing height takes that slot so
    /// two rewards for the same key never collide within one second.
    pub fn calc_hash(&self) -> String {
        let senders: String = if self.is_subsidy {
            self.include_block.unwrap_or_default().to_string()
        } else {
            self.inputs.iter().map(|c| c.owner.as_str()).collect()
        };
        let recipients: String = self.outputs.iter().map(|c| c.owner.as_str()).collect();
        sha256_hex(&format!("{senders}{recipients}{}{}", self.value, self.time))
    }

    /// Compute the hash, then stamp it on the outputs (creating slot) and
    /// the inputs (spending slot).
    fn seal(&mut self) {
        self.hash = self.calc_hash();
        for (i, coin) in self.outputs.iter_mut().enumerate() {
            coin.created_trx_hash = self.hash.clone();
            coin.out_index = i as u32;
        }
        for (i, coin) in self.inputs.iter_mut().enumerate() {
            coin.spending_trx_hash = Some(self.hash.clone());
            coin.in_index = Some(i as u32);
        }
    }

    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|c| c.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|c| c.value).sum()
    }

    /// Local validity against the unspent set: every input must sit
    /// unspent at its claimed slot, value must balance (subsidy exempt),
    /// the timestamp must postdate the genesis epoch and every output must
    /// carry this transaction's hash.
    pub fn check(&self, unspent: &UnspentCoins) -> bool {
        for coin in &self.inputs {
            if !unspent.contains_coin(coin) {
                return false;
            }
        }
        if !self.is_subsidy && self.input_value() != self.output_value() {
            return false;
        }
        if self.time <= GENESIS_EPOCH {
            return false;
        }
        self.outputs.iter().all(|c| c.created_trx_hash == self.hash)
    }
}

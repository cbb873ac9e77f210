//! Global unspent-coin index, keyed by creating-transaction hash.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::trx::{Coin, Trx};

/// For every transaction with at least one unspent output: its output slots
/// in order, `None` where the slot has been spent. An entry disappears only
/// when all its slots are spent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnspentCoins(HashMap<String, Vec<Option<Coin>>>);

impl UnspentCoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Is this exact output present and still unspent?
    pub fn contains_coin(&self, coin: &Coin) -> bool {
        self.0
            .get(&coin.created_trx_hash)
            .and_then(|slots| slots.get(coin.out_index as usize))
            .and_then(|slot| slot.as_ref())
            .map(|held| held.same_output(coin))
            .unwrap_or(false)
    }

    /// Register every output of `trx` under its hash.
    pub fn insert_outputs(&mut self, trx: &Trx) {
        self.0.insert(
            trx.hash.clone(),
            trx.outputs.iter().cloned().map(Some).collect(),
        );
    }

    /// Null the slot `coin` occupies; drop the entry once fully spent.
    pub fn spend(&mut self, coin: &Coin) -> bool {
        let Some(slots) = self.0.get_mut(&coin.created_trx_hash) else {
            return false;
        };
        let Some(slot) = slots.get_mut(coin.out_index as usize) else {
            return false;
        };
        if slot.as_ref().map(|held| held.same_output(coin)) != Some(true) {
            return false;
        }
        *slot = None;
        if slots.iter().all(Option::is_none) {
            self.0.remove(&coin.created_trx_hash);
        }
        true
    }

    /// Undo a spend: put the coin back in its creating slot, recreating the
    /// entry if the spend had removed it. The restored copy carries no
    /// spending annotations.
    pub fn restore(&mut self, coin: &Coin) {
        let slots = self
            .0
            .entry(coin.created_trx_hash.clone())
            .or_insert_with(Vec::new);
        let index = coin.out_index as usize;
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        let mut fresh = coin.clone();
        fresh.spending_trx_hash = None;
        fresh.in_index = None;
        slots[index] = Some(fresh);
    }

    /// Drop the whole entry for a transaction (used when reverting its
    /// block).
    pub fn remove_outputs(&mut self, trx_hash: &str) {
        self.0.remove(trx_hash);
    }

    /// Sum of all unspent values.
    pub fn total_value(&self) -> u64 {
        self.0
            .values()
            .flatten()
            .flatten()
            .map(|c| c.value)
            .sum()
    }

    /// The unspent coins owned by `owner`, grouped by creating transaction.
    pub fn coins_of(&self, owner: &str) -> HashMap<String, Vec<Coin>> {
        let mut out = HashMap::new();
        for (hash, slots) in &self.0 {
            let mine: Vec<Coin> = slots
                .iter()
                .flatten()
                .filter(|c| c.owner == owner)
                .cloned()
                .collect();
            if !mine.is_empty() {
                out.insert(hash.clone(), mine);
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Option<Coin>>)> {
        self.0.iter()
    }
}

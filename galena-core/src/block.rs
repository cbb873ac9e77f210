//! Blocks: header fields, transaction list, hashing and validation.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::merkle::MerkleTree;
use crate::trx::Trx;
use crate::utxo::UnspentCoins;
use crate::{now_ts, sha256_hex, Difficulty, SUBSIDY};

bitflags! {
    /// Outcome of block validation; a block is acceptable only when all
    /// three flags are set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockValidation: u8 {
        const DIFFICULTY = 1;
        const TRX = 1 << 1;
        const PREVIOUS_HASH = 1 << 2;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub previous_hash: String,
    /// 1 for the first block.
    pub height: u64,
    pub nonce: u64,
    pub time: i64,
    /// Index 0 is the subsidy when present.
    pub transactions: Vec<Trx>,
    pub merkle_root: String,
    pub block_hash: String,
}

impl Block {
    pub fn new(previous_hash: String, height: u64, subsidy: Trx) -> Self {
        let mut block = Self {
            previous_hash,
            height,
            nonce: 0,
            time: now_ts(),
            transactions: vec![subsidy],
            merkle_root: String::new(),
            block_hash: String::new(),
        };
        block.refresh();
        block
    }

    /// Append a transaction, stamping its containing height, and refresh
    /// the Merkle root and block hash.
    pub fn add_trx(&mut self, mut trx: Trx) {
        trx.include_block = Some(self.height);
        self.transactions.push(trx);
        self.refresh();
    }

    pub fn trx_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|t| t.hash.clone()).collect()
    }

    /// Recompute the Merkle root and the block hash from current contents.
    pub fn refresh(&mut self) {
        self.merkle_root = MerkleTree::build(&self.trx_hashes()).root_hash().to_owned();
        self.block_hash = self.calc_hash();
    }

    /// Identity: sha256(merkle_root ‖ nonce ‖ previous_hash ‖ time).
    pub fn calc_hash(&self) -> String {
        sha256_hex(&format!(
            "{}{}{}{}",
            self.merkle_root, self.nonce, self.previous_hash, self.time
        ))
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
        self.block_hash = self.calc_hash();
    }

    pub fn merkle_tree(&self) -> MerkleTree {
        MerkleTree::build(&self.trx_hashes())
    }

    /// Apply this block to the unspent set: drop spent inputs, register
    /// fresh outputs.
    pub fn update_unspent(&self, set: &mut UnspentCoins) {
        for trx in &self.transactions {
            for coin in &trx.inputs {
                set.spend(coin);
            }
            set.insert_outputs(trx);
        }
    }

    /// Exact inverse of [`Self::update_unspent`], used when this block is
    /// rolled back during a reorganization.
    pub fn revert_unspent(&self, set: &mut UnspentCoins) {
        for trx in self.transactions.iter().rev() {
            set.remove_outputs(&trx.hash);
            for coin in &trx.inputs {
                set.restore(coin);
            }
        }
    }

    /// Every transaction valid against `unspent` (the set as of this
    /// block's predecessor), the subsidy well-formed, and the recorded
    /// Merkle root consistent with the list.
    pub fn check_trx(&self, unspent: &UnspentCoins) -> bool {
        for trx in &self.transactions {
            if trx.is_subsidy
                && !(trx.inputs.is_empty()
                    && trx.outputs.len() == 1
                    && trx.outputs[0].value == SUBSIDY)
            {
                return false;
            }
            if !trx.check(unspent) {
                return false;
            }
        }
        self.merkle_root == MerkleTree::build(&self.trx_hashes()).root_hash()
    }

    pub fn is_valid(
        &self,
        unspent: &UnspentCoins,
        pre_hash: &str,
        difficulty: &Difficulty,
    ) -> BlockValidation {
        let mut validation = BlockValidation::empty();
        if difficulty.met_by(&self.block_hash) && self.block_hash == self.calc_hash() {
            validation |= BlockValidation::DIFFICULTY;
        }
        if self.check_trx(unspent) {
            validation |= BlockValidation::TRX;
        }
        if self.previous_hash == pre_hash {
            validation |= BlockValidation::PREVIOUS_HASH;
        }
        validation
    }

    /// Rough in-memory footprint, used for the non-full-node cache budget.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) fn mine_for_test(block: &mut Block, difficulty: &Difficulty) {
    while !difficulty.met_by(&block.block_hash) {
        block.set_nonce(block.nonce + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trx::Coin;

    fn easy() -> Difficulty {
        Difficulty::from_shift(2)
    }

    #[test]
    fn add_trx_refreshes_root_and_hash() {
        let mut block = Block::new(String::new(), 1, Trx::subsidy(1, "miner"));
        let before = (block.merkle_root.clone(), block.block_hash.clone());
        block.add_trx(Trx::new(1, "a", vec![], vec![Coin::new("b", 5)]));
        assert_ne!(block.merkle_root, before.0);
        assert_ne!(block.block_hash, before.1);
        assert_eq!(block.transactions[1].include_block, Some(1));
    }

    #[test]
    fn mined_block_is_fully_valid() {
        let mut block = Block::new(String::new(), 1, Trx::subsidy(1, "miner"));
        mine_for_test(&mut block, &easy());
        let validation = block.is_valid(&UnspentCoins::new(), "", &easy());
        assert!(validation.is_all());
    }

    #[test]
    fn tampered_stored_hash_fails_difficulty() {
        let mut block = Block::new(String::new(), 1, Trx::subsidy(1, "miner"));
        mine_for_test(&mut block, &easy());
        block.block_hash = format!("ff{}", "0".repeat(62));
        let validation = block.is_valid(&UnspentCoins::new(), "", &easy());
        assert!(!validation.contains(BlockValidation::DIFFICULTY));
    }

    #[test]
    fn wrong_previous_hash_flagged() {
        let mut block = Block::new("bogus".into(), 2, Trx::subsidy(2, "miner"));
        mine_for_test(&mut block, &easy());
        let validation = block.is_valid(&UnspentCoins::new(), "expected", &easy());
        assert!(!validation.contains(BlockValidation::PREVIOUS_HASH));
        assert!(validation.contains(BlockValidation::DIFFICULTY));
    }

    #[test]
    fn oversized_subsidy_rejected() {
        let mut fake = Trx::subsidy(1, "miner");
        fake.outputs[0].value = SUBSIDY * 2;
        let block = Block::new(String::new(), 1, fake);
        assert!(!block.check_trx(&UnspentCoins::new()));
    }

    #[test]
    fn update_then_revert_restores_set() {
        let funding = Trx::subsidy(1, "alice");
        let mut first = Block::new(String::new(), 1, funding.clone());
        first.refresh();
        let mut unspent = UnspentCoins::new();
        first.update_unspent(&mut unspent);
        let after_first = unspent.clone();

        let spend = Trx::new(
            2,
            "alice",
            funding.outputs.clone(),
            vec![Coin::new("bob", 50)],
        );
        let mut second = Block::new(first.block_hash.clone(), 2, Trx::subsidy(2, "alice"));
        second.add_trx(spend);
        second.update_unspent(&mut unspent);
        assert!(!unspent.contains_coin(&funding.outputs[0]));

        second.revert_unspent(&mut unspent);
        assert_eq!(unspent, after_first);
    }

    #[test]
    fn serde_roundtrip_reproduces_hash() {
        let mut block = Block::new(String::new(), 1, Trx::subsidy(1, "miner"));
        mine_for_test(&mut block, &easy());
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
        assert_eq!(back.calc_hash(), back.block_hash);
    }
}

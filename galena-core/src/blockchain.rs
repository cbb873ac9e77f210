//! The ordered block list: append validation, fork detection and
//! reorganization with unspent-set rewind/reapply.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block::{Block, BlockValidation};
use crate::mempool::Mempool;
use crate::trx::Trx;
use crate::utxo::UnspentCoins;
use crate::{Difficulty, DEFAULT_CACHE_KB};

/// Result of validating a candidate chain or of a resolve attempt.
/// Validation failures are reported, never thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheck {
    pub ok: bool,
    pub bad_index: Option<usize>,
    #[serde(with = "validation_bits")]
    pub validation: Option<BlockValidation>,
}

impl ChainCheck {
    pub fn good() -> Self {
        Self {
            ok: true,
            bad_index: None,
            validation: None,
        }
    }

    pub fn bad(index: usize, validation: BlockValidation) -> Self {
        Self {
            ok: false,
            bad_index: Some(index),
            validation: Some(validation),
        }
    }
}

mod validation_bits {
    use super::BlockValidation;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        v: &Option<BlockValidation>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match v {
            Some(bits) => ser.serialize_some(&bits.bits()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<BlockValidation>, D::Error> {
        let raw: Option<u8> = Option::deserialize(de)?;
        Ok(raw.map(BlockValidation::from_bits_truncate))
    }
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    pub blocks: Vec<Block>,
    /// Full nodes keep every block; others evict under cache pressure.
    pub is_full_node: bool,
    /// In-memory budget for non-full nodes, in bytes.
    pub cache_bytes: usize,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Blockchain {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            is_full_node: true,
            cache_bytes: DEFAULT_CACHE_KB as usize * 1000,
        }
    }

    pub fn with_cache(cache_kb: u64) -> Self {
        Self {
            blocks: Vec::new(),
            is_full_node: false,
            cache_bytes: cache_kb as usize * 1000,
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.last().map(|b| b.height).unwrap_or(0)
    }

    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Hash of the tip, or "" for an empty chain (the genesis predecessor).
    pub fn last_block_hash(&self) -> String {
        self.blocks
            .last()
            .map(|b| b.block_hash.clone())
            .unwrap_or_default()
    }

    /// A fresh block keyed to the current tip, carrying `subsidy` first and
    /// then up to `max_mining` mempool transactions in admission order.
    pub fn setup_new_block(&self, subsidy: Trx, mempool: &Mempool) -> Block {
        let mut block = Block::new(self.last_block_hash(), self.height() + 1, subsidy);
        for trx in mempool.iter_mining().take(mempool.max_mining) {
            block.add_trx(trx.clone());
        }
        block
    }

    /// Validate and append. On full validity (or when validation is
    /// skipped for a locally mined block) the block is appended and the
    /// unspent set updated; non-full nodes then evict the oldest blocks
    /// past their cache budget.
    pub fn add_new_block(
        &mut self,
        block: Block,
        unspent: &mut UnspentCoins,
        ignore_validation: bool,
        difficulty: &Difficulty,
    ) -> BlockValidation {
        let validation = if ignore_validation {
            BlockValidation::all()
        } else {
            block.is_valid(unspent, &self.last_block_hash(), difficulty)
        };
        if validation.is_all() {
            block.update_unspent(unspent);
            debug!(height = block.height, hash = %block.block_hash, "block appended");
            self.blocks.push(block);
            self.evict_over_budget();
        }
        validation
    }

    fn evict_over_budget(&mut self) {
        if self.is_full_node {
            return;
        }
        let mut total: usize = self.blocks.iter().map(Block::size_bytes).sum();
        while total > self.cache_bytes && self.blocks.len() > 1 {
            let evicted = self.blocks.remove(0);
            total -= evicted.size_bytes();
            debug!(height = evicted.height, "evicted block past cache budget");
        }
    }

    /// Validate a candidate chain sequentially. `unspent` is the state as
    /// of the first block's predecessor; a copy is updated block by block
    /// so later blocks see earlier effects.
    pub fn check_chain(
        blocks: &[Block],
        unspent: &UnspentCoins,
        difficulty: &Difficulty,
    ) -> ChainCheck {
        let mut working = unspent.clone();
        let mut pre_hash: Option<String> = None;
        for (i, block) in blocks.iter().enumerate() {
            // The predecessor of the first block is only known when the
            // candidate starts the chain; otherwise its linkage is vouched
            // for by the caller's divergence search.
            let expected = match &pre_hash {
                Some(hash) => hash.clone(),
                None if block.height == 1 => String::new(),
                None => block.previous_hash.clone(),
            };
            let validation = block.is_valid(&working, &expected, difficulty);
            if !validation.is_all() {
                return ChainCheck::bad(i, validation);
            }
            block.update_unspent(&mut working);
            pre_hash = Some(block.block_hash.clone());
        }
        ChainCheck::good()
    }

    /// Find the divergence point: the match between a local block and a
    /// received block closest to the received tip (the longest matching
    /// suffix). Returns how many blocks each side carries past that point;
    /// with no common block at all, both full lengths.
    pub fn find_different(&self, new_blocks: &[Block]) -> (usize, usize) {
        for (j, candidate) in new_blocks.iter().enumerate().rev() {
            if let Some(i) = self
                .blocks
                .iter()
                .rposition(|b| b.block_hash == candidate.block_hash)
            {
                return (self.blocks.len() - 1 - i, new_blocks.len() - 1 - j);
            }
        }
        (self.blocks.len(), new_blocks.len())
    }

    /// Reconcile with a competing chain: validate the incoming blocks,
    /// rewind the divergent local suffix (rolling its effects out of the
    /// unspent set), then apply the received suffix. A received chain with
    /// no common ancestor only wins when strictly longer; equal-length
    /// chains keep the local one.
    pub fn resolve(
        &mut self,
        new_blocks: &[Block],
        unspent: &mut UnspentCoins,
        difficulty: &Difficulty,
    ) -> ChainCheck {
        if new_blocks.is_empty() {
            return ChainCheck::good();
        }
        let (mut k_local, mut k_new) = self.find_different(new_blocks);
        // A received suffix of all-new blocks shares no block with us, but
        // may still link onto one of ours by previous_hash (the GET_BLOCKS
        // catch-up path).
        if k_local == self.blocks.len() && !self.blocks.is_empty() {
            if let Some(i) = self
                .blocks
                .iter()
                .rposition(|b| b.block_hash == new_blocks[0].previous_hash)
            {
                k_local = self.blocks.len() - 1 - i;
                k_new = new_blocks.len();
            }
        }
        let no_ancestor = k_local == self.blocks.len();
        if no_ancestor && new_blocks.len() <= self.blocks.len() {
            debug!("received chain is not longer; keeping local chain");
            return ChainCheck::good();
        }
        if k_new == 0 {
            return ChainCheck::good();
        }

        let starts_chain = new_blocks[0].height == 1;
        let (mut working, first_new, check_offset) = if starts_chain {
            // Complete chain received: replay it from nothing. Blocks
            // before the divergence hash-match ours, so the replayed set
            // equals rewind+reapply.
            (UnspentCoins::new(), 0usize, 0usize)
        } else {
            // Suffix received: rewind our divergent tail on a copy first.
            let first = new_blocks.len() - k_new;
            if first > 0 && new_blocks[first].previous_hash != new_blocks[first - 1].block_hash {
                return ChainCheck::bad(
                    first,
                    BlockValidation::all().difference(BlockValidation::PREVIOUS_HASH),
                );
            }
            let mut copy = unspent.clone();
            for block in self.blocks[self.blocks.len() - k_local..].iter().rev() {
                block.revert_unspent(&mut copy);
            }
            (copy, first, first)
        };

        let checked = Self::check_chain(&new_blocks[first_new..], &working, difficulty);
        if !checked.ok {
            return ChainCheck {
                ok: false,
                bad_index: checked.bad_index.map(|i| i + check_offset),
                validation: checked.validation,
            };
        }
        for block in &new_blocks[first_new..] {
            block.update_unspent(&mut working);
        }

        self.blocks.truncate(self.blocks.len() - k_local);
        self.blocks
            .extend_from_slice(&new_blocks[new_blocks.len() - k_new..]);
        *unspent = working;
        info!(
            height = self.height(),
            reverted = k_local,
            applied = k_new,
            "chain resolved"
        );
        ChainCheck::good()
    }

    /// Index of the block with this hash, searching from the tip. Evicted
    /// blocks are not found; disk is only consulted by explicit fetches.
    pub fn search(&self, key_hash: &str) -> Option<usize> {
        self.blocks.iter().rposition(|b| b.block_hash == key_hash)
    }

    pub fn get_hashes(&self, first: usize, last: Option<usize>) -> Vec<String> {
        self.slice(first, last)
            .iter()
            .map(|b| b.block_hash.clone())
            .collect()
    }

    pub fn get_data(&self, first: usize, last: Option<usize>) -> Vec<Block> {
        self.slice(first, last).to_vec()
    }

    fn slice(&self, first: usize, last: Option<usize>) -> &[Block] {
        let end = last.unwrap_or(self.blocks.len()).min(self.blocks.len());
        let start = first.min(end);
        &self.blocks[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::mine_for_test;
    use crate::trx::Coin;
    use crate::{DEFAULT_MAX_MINING, SUBSIDY};

    const SHIFT: u32 = 2;

    fn easy() -> Difficulty {
        Difficulty::from_shift(SHIFT)
    }

    fn mine_next(chain: &mut Blockchain, unspent: &mut UnspentCoins, miner: &str) {
        let subsidy = Trx::subsidy(chain.height() + 1, miner);
        let mut block = chain.setup_new_block(subsidy, &Mempool::new(DEFAULT_MAX_MINING));
        mine_for_test(&mut block, &easy());
        let validation = chain.add_new_block(block, unspent, false, &easy());
        assert!(validation.is_all());
    }

    fn chain_of(n: usize, miner: &str) -> (Blockchain, UnspentCoins) {
        let mut chain = Blockchain::default();
        let mut unspent = UnspentCoins::new();
        for _ in 0..n {
            mine_next(&mut chain, &mut unspent, miner);
        }
        (chain, unspent)
    }

    /// Extend a copy of `base` by `n` blocks mined by `miner`.
    fn extended(base: &(Blockchain, UnspentCoins), n: usize, miner: &str) -> (Blockchain, UnspentCoins) {
        let mut chain = base.0.clone();
        let mut unspent = base.1.clone();
        for _ in 0..n {
            mine_next(&mut chain, &mut unspent, miner);
        }
        (chain, unspent)
    }

    #[test]
    fn height_tracks_appends() {
        let (chain, unspent) = chain_of(3, "miner");
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.blocks.len(), 3);
        assert_eq!(unspent.total_value(), 3 * SUBSIDY);
    }

    #[test]
    fn appended_blocks_meet_difficulty() {
        let (chain, _) = chain_of(3, "miner");
        for block in &chain.blocks {
            assert!(easy().met_by(&block.block_hash));
        }
    }

    #[test]
    fn check_chain_accepts_honest_chain() {
        let (chain, _) = chain_of(3, "miner");
        let res = Blockchain::check_chain(&chain.blocks, &UnspentCoins::new(), &easy());
        assert_eq!(res, ChainCheck::good());
    }

    #[test]
    fn check_chain_reports_bad_hash_index() {
        let (mut chain, _) = chain_of(3, "miner");
        chain.blocks[2].block_hash = format!("ff{}", "0".repeat(62));
        let res = Blockchain::check_chain(&chain.blocks, &UnspentCoins::new(), &easy());
        assert!(!res.ok);
        assert_eq!(res.bad_index, Some(2));
    }

    #[test]
    fn check_chain_reports_bad_previous_hash() {
        let (mut chain, _) = chain_of(3, "miner");
        chain.blocks[1].previous_hash = "0".into();
        mine_for_test(&mut chain.blocks[1], &easy());
        let res = Blockchain::check_chain(&chain.blocks, &UnspentCoins::new(), &easy());
        assert!(!res.ok);
        assert_eq!(res.bad_index, Some(1));
    }

    #[test]
    fn find_different_identical_copy() {
        let (chain, _) = chain_of(1, "miner");
        assert_eq!(chain.find_different(&chain.blocks), (0, 0));
    }

    #[test]
    fn find_different_longer_extension() {
        let base = chain_of(1, "miner");
        let (longer, _) = extended(&base, 2, "miner");
        assert_eq!(base.0.find_different(&longer.blocks), (0, 2));
    }

    #[test]
    fn find_different_no_common_history() {
        let (a, _) = chain_of(2, "alice");
        let (b, _) = chain_of(3, "bob");
        assert_eq!(a.find_different(&b.blocks), (2, 3));
    }

    #[test]
    fn resolve_adopts_longer_parallel_fork() {
        let base = chain_of(1, "miner");
        let (mut ours, mut our_unspent) = extended(&base, 2, "alice");
        let (theirs, their_unspent) = extended(&base, 3, "bob");

        let res = ours.resolve(&theirs.blocks, &mut our_unspent, &easy());
        assert_eq!(res, ChainCheck::good());
        assert_eq!(ours.blocks, theirs.blocks);
        assert_eq!(our_unspent, their_unspent);
    }

    #[test]
    fn resolve_extends_partial_chain() {
        let base = chain_of(2, "miner");
        let (mut ours, mut our_unspent) = (base.0.clone(), base.1.clone());
        let (theirs, their_unspent) = extended(&base, 1, "miner");

        let res = ours.resolve(&theirs.blocks, &mut our_unspent, &easy());
        assert_eq!(res, ChainCheck::good());
        assert_eq!(ours.blocks, theirs.blocks);
        assert_eq!(our_unspent, their_unspent);
    }

    #[test]
    fn resolve_replaces_fully_different_longer_chain() {
        let (mut ours, mut our_unspent) = chain_of(2, "alice");
        let (theirs, their_unspent) = chain_of(3, "bob");

        let res = ours.resolve(&theirs.blocks, &mut our_unspent, &easy());
        assert_eq!(res, ChainCheck::good());
        assert_eq!(ours.blocks, theirs.blocks);
        assert_eq!(our_unspent, their_unspent);
    }

    #[test]
    fn resolve_accepts_suffix_linked_by_previous_hash() {
        // the GET_BLOCKS catch-up path sends only the blocks we lack
        let base = chain_of(2, "miner");
        let (mut ours, mut our_unspent) = (base.0.clone(), base.1.clone());
        let (theirs, their_unspent) = extended(&base, 2, "miner");
        let suffix = theirs.get_data(2, None);
        assert_eq!(suffix.len(), 2);

        let res = ours.resolve(&suffix, &mut our_unspent, &easy());
        assert_eq!(res, ChainCheck::good());
        assert_eq!(ours.blocks, theirs.blocks);
        assert_eq!(our_unspent, their_unspent);
    }

    #[test]
    fn resolve_keeps_local_on_equal_length() {
        let (mut ours, mut our_unspent) = chain_of(2, "alice");
        let (theirs, _) = chain_of(2, "bob");
        let before = ours.blocks.clone();

        let res = ours.resolve(&theirs.blocks, &mut our_unspent, &easy());
        assert_eq!(res, ChainCheck::good());
        assert_eq!(ours.blocks, before);
    }

    #[test]
    fn resolve_rejects_bad_chain() {
        let base = chain_of(1, "miner");
        let (mut ours, mut our_unspent) = (base.0.clone(), base.1.clone());
        let (mut theirs, _) = extended(&base, 2, "bob");
        let last = theirs.blocks.len() - 1;
        theirs.blocks[last].previous_hash = "nonsense".into();
        mine_for_test(&mut theirs.blocks[last], &easy());

        let before_blocks = ours.blocks.clone();
        let before_unspent = our_unspent.clone();
        let res = ours.resolve(&theirs.blocks, &mut our_unspent, &easy());
        assert!(!res.ok);
        assert_eq!(res.bad_index, Some(2));
        assert_eq!(ours.blocks, before_blocks, "failed resolve must not touch the chain");
        assert_eq!(our_unspent, before_unspent);
    }

    #[test]
    fn resolve_reorg_updates_unspent_like_direct_application() {
        // A mines [X, Y]; B mines [X', Y', Z']; after resolving, A's set
        // equals what applying B's blocks directly produces.
        let (mut a_chain, mut a_unspent) = chain_of(2, "a");
        let (b_chain, _) = chain_of(3, "b");

        let res = a_chain.resolve(&b_chain.blocks, &mut a_unspent, &easy());
        assert_eq!(res, ChainCheck::good());

        let mut direct = UnspentCoins::new();
        for block in &b_chain.blocks {
            block.update_unspent(&mut direct);
        }
        assert_eq!(a_unspent, direct);
        assert_eq!(a_unspent.total_value(), 3 * SUBSIDY);
    }

    #[test]
    fn setup_new_block_embeds_mempool_in_order() {
        let (chain, unspent) = chain_of(1, "miner");
        let mut mempool = Mempool::new(DEFAULT_MAX_MINING);
        let keys: Vec<_> = (0..3).map(|_| galena_crypto::KeyPair::generate()).collect();
        for (i, key) in keys.iter().enumerate() {
            let trx = Trx::new(
                0,
                key.public_wire(),
                vec![],
                vec![Coin::new("recipient", (i as u64 + 1) * 10)],
            );
            // zero-input transactions are only valid for subsidies, so feed
            // the mempool directly for ordering purposes
            mempool.insert_unchecked(trx);
        }
        let block = chain.setup_new_block(Trx::subsidy(2, "miner"), &mempool);
        assert_eq!(block.transactions.len(), 4);
        assert!(block.transactions[0].is_subsidy);
        assert_eq!(block.transactions[1].value, 10);
        assert_eq!(block.transactions[3].value, 30);
        let _ = unspent;
    }

    #[test]
    fn search_finds_blocks_by_hash() {
        let (chain, _) = chain_of(3, "miner");
        let hash = chain.blocks[1].block_hash.clone();
        assert_eq!(chain.search(&hash), Some(1));
        assert_eq!(chain.search("missing"), None);
    }

    #[test]
    fn get_range_helpers() {
        let (chain, _) = chain_of(3, "miner");
        assert_eq!(chain.get_hashes(0, None).len(), 3);
        assert_eq!(chain.get_data(1, None).len(), 2);
        assert_eq!(chain.get_data(1, Some(2))[0], chain.blocks[1]);
        assert!(chain.get_data(9, None).is_empty());
    }

    #[test]
    fn non_full_node_evicts_oldest() {
        let mut chain = Blockchain::with_cache(0);
        chain.cache_bytes = 1; // force eviction after every append
        let mut unspent = UnspentCoins::new();
        mine_next(&mut chain, &mut unspent, "miner");
        mine_next(&mut chain, &mut unspent, "miner");
        assert_eq!(chain.blocks.len(), 1);
        assert_eq!(chain.height(), 2, "height follows the tip, not the cache");
    }
}

//! Pending transactions awaiting inclusion, plus the bounded FIFO sublist
//! the miner draws from.

use std::collections::HashMap;

use galena_crypto::SigPair;
use tracing::debug;

use crate::trx::Trx;
use crate::utxo::UnspentCoins;

/// Either a transaction hash or a transaction can name a mempool entry.
pub trait MempoolKey {
    fn mempool_key(&self) -> &str;
}

impl MempoolKey for str {
    fn mempool_key(&self) -> &str {
        self
    }
}

impl MempoolKey for String {
    fn mempool_key(&self) -> &str {
        self
    }
}

impl MempoolKey for Trx {
    fn mempool_key(&self) -> &str {
        &self.hash
    }
}

#[derive(Debug, Clone)]
pub struct Mempool {
    transactions: HashMap<String, Trx>,
    /// Hashes queued for the next mined block, in admission order.
    in_mining: Vec<String>,
    pub max_mining: usize,
}

impl Mempool {
    pub fn new(max_mining: usize) -> Self {
        Self {
            transactions: HashMap::new(),
            in_mining: Vec::new(),
            max_mining,
        }
    }

    /// Admit a transaction: rejected when already present, when the
    /// signature over its hash does not verify against the sender key, or
    /// when it fails local validation against the unspent set. Admitted
    /// transactions join `in_mining` FIFO while there is room.
    pub fn add(
        &mut self,
        trx: Trx,
        sig: &SigPair,
        sender_public_key: &str,
        unspent: &UnspentCoins,
    ) -> bool {
        if self.transactions.contains_key(&trx.hash) {
            debug!(hash = %trx.hash, "duplicate transaction rejected");
            return false;
        }
        if !matches!(galena_crypto::verify(&trx.hash, sig, sender_public_key), Ok(true)) {
            debug!(hash = %trx.hash, "transaction signature rejected");
            return false;
        }
        if !trx.check(unspent) {
            debug!(hash = %trx.hash, "transaction failed validation");
            return false;
        }
        self.insert_unchecked(trx);
        true
    }

    /// Insert without the admission gates; local callers that already
    /// validated (and tests) use this.
    pub(crate) fn insert_unchecked(&mut self, trx: Trx) {
        let hash = trx.hash.clone();
        self.transactions.insert(hash.clone(), trx);
        if self.in_mining.len() < self.max_mining && !self.in_mining.contains(&hash) {
            self.in_mining.push(hash);
        }
    }

    pub fn remove(&mut self, hash: &str) -> bool {
        if self.transactions.remove(hash).is_none() {
            return false;
        }
        self.in_mining.retain(|h| h != hash);
        // freed mining slots refill in map order; admission order is only
        // tracked for entries that queued normally
        for hash in self.transactions.keys() {
            if self.in_mining.len() >= self.max_mining {
                break;
            }
            if !self.in_mining.contains(hash) {
                self.in_mining.push(hash.clone());
            }
        }
        true
    }

    /// Drop every listed transaction (used after a block is mined or
    /// accepted).
    pub fn remove_many(&mut self, hashes: &[String]) {
        for hash in hashes {
            self.remove(hash);
        }
    }

    pub fn contains<K: MempoolKey + ?Sized>(&self, key: &K) -> bool {
        self.transactions.contains_key(key.mempool_key())
    }

    pub fn get(&self, hash: &str) -> Option<&Trx> {
        self.transactions.get(hash)
    }

    /// Transactions queued for mining, in admission order.
    pub fn iter_mining(&self) -> impl Iterator<Item = &Trx> {
        self.in_mining
            .iter()
            .filter_map(|hash| self.transactions.get(hash))
    }

    pub fn mining_hashes(&self) -> Vec<String> {
        self.in_mining.clone()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trx::Coin;
    use galena_crypto::KeyPair;

    /// A signed spend of a freshly minted subsidy.
    fn funded_trx(key: &KeyPair, unspent: &mut UnspentCoins, recipient: &str) -> (Trx, SigPair) {
        let funding = Trx::subsidy(1, key.public_wire());
        unspent.insert_outputs(&funding);
        let trx = Trx::build(
            &unspent.coins_of(&key.public_wire()),
            &key.public_wire(),
            recipient,
            crate::SUBSIDY,
        )
        .unwrap();
        let sig = key.sign(&trx.hash).unwrap();
        (trx, sig)
    }

    #[test]
    fn add_accepts_valid_transaction() {
        let key = KeyPair::generate();
        let mut unspent = UnspentCoins::new();
        let (trx, sig) = funded_trx(&key, &mut unspent, "bob");
        let mut mempool = Mempool::new(10);
        assert!(mempool.add(trx.clone(), &sig, &key.public_wire(), &unspent));
        assert!(mempool.contains(&trx));
        assert!(mempool.contains(trx.hash.as_str()));
        assert_eq!(mempool.mining_hashes(), vec![trx.hash]);
    }

    #[test]
    fn add_rejects_duplicates() {
        let key = KeyPair::generate();
        let mut unspent = UnspentCoins::new();
        let (trx, sig) = funded_trx(&key, &mut unspent, "bob");
        let mut mempool = Mempool::new(10);
        assert!(mempool.add(trx.clone(), &sig, &key.public_wire(), &unspent));
        assert!(!mempool.add(trx, &sig, &key.public_wire(), &unspent));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn add_rejects_wrong_signer() {
        let key = KeyPair::generate();
        let impostor = KeyPair::generate();
        let mut unspent = UnspentCoins::new();
        let (trx, _) = funded_trx(&key, &mut unspent, "bob");
        let forged = impostor.sign(&trx.hash).unwrap();
        let mut mempool = Mempool::new(10);
        assert!(!mempool.add(trx, &forged, &key.public_wire(), &unspent));
        assert!(mempool.is_empty());
    }

    #[test]
    fn add_rejects_unknown_inputs() {
        let key = KeyPair::generate();
        let mut unspent = UnspentCoins::new();
        let (trx, sig) = funded_trx(&key, &mut unspent, "bob");
        let mut mempool = Mempool::new(10);
        assert!(!mempool.add(trx, &sig, &key.public_wire(), &UnspentCoins::new()));
        let _ = unspent;
    }

    #[test]
    fn mining_list_is_capacity_bounded_fifo() {
        let mut mempool = Mempool::new(2);
        let mut hashes = Vec::new();
        for i in 0..4 {
            let trx = Trx::new(0, "s", vec![], vec![Coin::new("r", 10 + i)]);
            hashes.push(trx.hash.clone());
            mempool.insert_unchecked(trx);
        }
        assert_eq!(mempool.len(), 4, "overflow stays in the map");
        assert_eq!(mempool.mining_hashes(), hashes[..2].to_vec());
        let queued: Vec<_> = mempool.iter_mining().map(|t| t.hash.clone()).collect();
        assert_eq!(queued, hashes[..2].to_vec());
    }

    #[test]
    fn remove_refills_mining_slots() {
        let mut mempool = Mempool::new(1);
        let a = Trx::new(0, "s", vec![], vec![Coin::new("r", 1)]);
        let b = Trx::new(0, "s", vec![], vec![Coin::new("r", 2)]);
        mempool.insert_unchecked(a.clone());
        mempool.insert_unchecked(b.clone());
        assert_eq!(mempool.mining_hashes(), vec![a.hash.clone()]);

        assert!(mempool.remove(&a.hash));
        assert_eq!(mempool.mining_hashes(), vec![b.hash.clone()]);
        assert!(!mempool.remove(&a.hash));
    }

    #[test]
    fn remove_many_clears_mined_set() {
        let mut mempool = Mempool::new(4);
        let trxs: Vec<_> = (0..3)
            .map(|i| Trx::new(0, "s", vec![], vec![Coin::new("r", 5 + i)]))
            .collect();
        for trx in &trxs {
            mempool.insert_unchecked(trx.clone());
        }
        let mined: Vec<String> = trxs[..2].iter().map(|t| t.hash.clone()).collect();
        mempool.remove_many(&mined);
        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.mining_hashes(), vec![trxs[2].hash.clone()]);
    }
}

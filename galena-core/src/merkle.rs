//! Merkle accumulator over transaction hashes.
//!
//! Nodes live in an index arena; child and parent links are indices rather
//! than owning edges. When a level has an odd number of nodes the trailing
//! node is carried up unmodified.

use crate::sha256_hex;

#[derive(Debug, Clone)]
struct Node {
    hash: String,
    parent: Option<usize>,
    /// Index of the sibling paired with this node, plus which side the
    /// sibling sits on. A carried-up node has none at that level.
    sibling: Option<(usize, Side)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<Node>,
    leaves: Vec<usize>,
    root: Option<usize>,
}

impl MerkleTree {
    pub fn build(leaf_hashes: &[String]) -> Self {
        let mut nodes: Vec<Node> = leaf_hashes
            .iter()
            .map(|h| Node {
                hash: h.clone(),
                parent: None,
                sibling: None,
            })
            .collect();
        let leaves: Vec<usize> = (0..nodes.len()).collect();
        if nodes.is_empty() {
            return Self {
                nodes,
                leaves,
                root: None,
            };
        }

        let mut level = leaves.clone();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / 2 + 1);
            let mut chunks = level.chunks_exact(2);
            for pair in &mut chunks {
                let (l, r) = (pair[0], pair[1]);
                let hash = sha256_hex(&format!("{}{}", nodes[l].hash, nodes[r].hash));
                let parent = nodes.len();
                nodes.push(Node {
                    hash,
                    parent: None,
                    sibling: None,
                });
                nodes[l].parent = Some(parent);
                nodes[l].sibling = Some((r, Side::Right));
                nodes[r].parent = Some(parent);
                nodes[r].sibling = Some((l, Side::Left));
                next.push(parent);
            }
            // odd trailing node rides up to the next level untouched
            if let [last] = chunks.remainder() {
                next.push(*last);
            }
            level = next;
        }
        let root = Some(level[0]);
        Self {
            nodes,
            leaves,
            root,
        }
    }

    /// Root hash; a single leaf is its own root, an empty tree hashes to "".
    pub fn root_hash(&self) -> &str {
        match self.root {
            Some(i) => &self.nodes[i].hash,
            None => "",
        }
    }

    pub fn len_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Inclusion proof for the first leaf carrying `leaf_hash`: the sibling
    /// hashes from leaf to root plus a side bit per entry (1 = sibling on
    /// the right). Carried-up levels contribute no entry.
    pub fn get_proof(&self, leaf_hash: &str) -> Option<(Vec<String>, Vec<u8>)> {
        let pos = self
            .leaves
            .iter()
            .position(|&i| self.nodes[i].hash == leaf_hash)?;
        self.get_proof_by_index(pos)
    }

    pub fn get_proof_by_index(&self, index: usize) -> Option<(Vec<String>, Vec<u8>)> {
        let mut current = *self.leaves.get(index)?;
        let mut hashes = Vec::new();
        let mut bits = Vec::new();
        loop {
            if let Some((sib, side)) = self.nodes[current].sibling {
                hashes.push(self.nodes[sib].hash.clone());
                bits.push(if side == Side::Right { 1 } else { 0 });
            }
            match self.nodes[current].parent {
                Some(p) => current = p,
                None => break,
            }
        }
        Some((hashes, bits))
    }

    /// Rebuild the root from a leaf hash and a proof and compare.
    pub fn verify_proof(
        leaf_hash: &str,
        hashes: &[String],
        bits: &[u8],
        expected_root: &str,
    ) -> bool {
        if hashes.len() != bits.len() {
            return false;
        }
        let mut acc = leaf_hash.to_owned();
        for (hash, bit) in hashes.iter().zip(bits) {
            acc = if *bit == 1 {
                sha256_hex(&format!("{acc}{hash}"))
            } else {
                sha256_hex(&format!("{hash}{acc}"))
            };
        }
        acc == expected_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(&format!("leaf-{i}"))).collect()
    }

    #[test]
    fn single_leaf_root_is_leaf() {
        let hashes = leaves(1);
        let tree = MerkleTree::build(&hashes);
        assert_eq!(tree.root_hash(), hashes[0]);
        let (proof, bits) = tree.get_proof(&hashes[0]).unwrap();
        assert!(proof.is_empty() && bits.is_empty());
        assert!(MerkleTree::verify_proof(&hashes[0], &proof, &bits, tree.root_hash()));
    }

    #[test]
    fn two_leaves_root() {
        let hashes = leaves(2);
        let tree = MerkleTree::build(&hashes);
        let expected = sha256_hex(&format!("{}{}", hashes[0], hashes[1]));
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn odd_leaf_carried_up() {
        let hashes = leaves(3);
        let tree = MerkleTree::build(&hashes);
        let left = sha256_hex(&format!("{}{}", hashes[0], hashes[1]));
        let expected = sha256_hex(&format!("{}{}", left, hashes[2]));
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 1..=8 {
            let hashes = leaves(n);
            let tree = MerkleTree::build(&hashes);
            for leaf in &hashes {
                let (proof, bits) = tree.get_proof(leaf).unwrap();
                assert!(
                    MerkleTree::verify_proof(leaf, &proof, &bits, tree.root_hash()),
                    "proof failed for {n} leaves"
                );
            }
        }
    }

    #[test]
    fn wrong_leaf_fails_proof() {
        let hashes = leaves(4);
        let tree = MerkleTree::build(&hashes);
        let (proof, bits) = tree.get_proof(&hashes[0]).unwrap();
        assert!(!MerkleTree::verify_proof(&hashes[1], &proof, &bits, tree.root_hash()));
    }

    #[test]
    fn unknown_leaf_has_no_proof() {
        let tree = MerkleTree::build(&leaves(4));
        assert!(tree.get_proof("deadbeef").is_none());
    }
}

use crate::core::{Hash256, Transaction};
use crate::utils::double_sha256;

/// Merkle tree over transaction ids
///
/// Parents are the double SHA-256 of `left || right`. A level with an odd number of nodes
/// pairs its last node with itself, and a single id is its own root.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    // levels[0] holds the leaves, the last level holds the root
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn new(transactions: &[Transaction]) -> MerkleTree {
        let ids: Vec<Hash256> = transactions.iter().map(Transaction::id).collect();
        Self::from_hashes(&ids)
    }

    pub fn from_hashes(hashes: &[Hash256]) -> MerkleTree {
        let mut levels = vec![hashes.to_vec()];
        while levels.last().map_or(false, |level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| Self::hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        MerkleTree { levels }
    }

    /// Root hash; all zeros for an empty tree.
    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
        let mut combined = [0u8; 64];
        combined[..32].copy_from_slice(left);
        combined[32..].copy_from_slice(right);
        double_sha256(&combined)
    }
}

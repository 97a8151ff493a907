use crate::config::ChainConfig;
use crate::core::{
    reward, DifficultyAdjustment, Hash256, MerkleTree, ProofOfWork, Transaction,
};
use crate::error::Result;
use crate::utils::{deserialize, serialize, sha256_hash};
use crate::wallet::address_to_locking_key;
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

pub const BLOCK_VERSION: u32 = 1;

/// Sentinel `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: Hash256 = [0u8; 32];

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    version: u32,
    previous_hash: Hash256,
    merkle_root: Hash256,
    timestamp: i64, // Unix milliseconds
    target: Hash256,
    nonce: u64,
}

impl BlockHeader {
    pub fn new(
        previous_hash: Hash256,
        merkle_root: Hash256,
        timestamp: i64,
        target: Hash256,
    ) -> BlockHeader {
        BlockHeader {
            version: BLOCK_VERSION,
            previous_hash,
            merkle_root,
            timestamp,
            target,
            nonce: 0,
        }
    }

    /// Every field except the nonce, in hashing order
    pub(crate) fn pow_prefix(&self) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(4 + 32 + 32 + 8 + 32 + 8);
        data_bytes.extend(self.version.to_be_bytes());
        data_bytes.extend(self.previous_hash);
        data_bytes.extend(self.merkle_root);
        data_bytes.extend(self.timestamp.to_be_bytes());
        data_bytes.extend(self.target);
        data_bytes
    }

    pub fn hash(&self) -> Hash256 {
        let mut data_bytes = self.pow_prefix();
        data_bytes.extend(self.nonce.to_be_bytes());
        sha256_hash(&data_bytes)
    }

    pub fn get_version(&self) -> u32 {
        self.version
    }

    pub fn get_previous_hash(&self) -> &Hash256 {
        &self.previous_hash
    }

    pub fn get_merkle_root(&self) -> &Hash256 {
        &self.merkle_root
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_target(&self) -> &Hash256 {
        &self.target
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    pub fn set_target(&mut self, target: Hash256) {
        self.target = target;
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
    height: u64,
}

impl Block {
    /// Unsolved block over `transactions` (nonce 0, Merkle root filled in).
    pub fn new_candidate(
        previous_hash: Hash256,
        transactions: Vec<Transaction>,
        height: u64,
        target: Hash256,
        timestamp: i64,
    ) -> Block {
        let merkle_root = MerkleTree::new(&transactions).root();
        Block {
            header: BlockHeader::new(previous_hash, merkle_root, timestamp, target),
            transactions,
            height,
        }
    }

    /// Candidate solved with an unbounded nonce search.
    pub fn new_block(
        previous_hash: Hash256,
        transactions: Vec<Transaction>,
        height: u64,
        target: Hash256,
        timestamp: i64,
    ) -> Block {
        let mut block =
            Block::new_candidate(previous_hash, transactions, height, target, timestamp);
        let (nonce, hash) = ProofOfWork::new_proof_of_work(block.header.clone()).run();
        block.header.set_nonce(nonce);
        info!(
            "Proof-of-work completed for block {} at height {height}",
            HEXLOWER.encode(&hash)
        );
        block
    }

    /// Reassemble a block from received or hand-built parts; nothing is recomputed.
    pub fn from_parts(header: BlockHeader, transactions: Vec<Transaction>, height: u64) -> Block {
        Block {
            header,
            transactions,
            height,
        }
    }

    /// The genesis block is a pure function of the chain config, so every node derives the
    /// same one and commits it locally.
    pub fn generate_genesis_block(config: &ChainConfig) -> Result<Block> {
        let locking_key = match &config.genesis_address {
            Some(address) => address_to_locking_key(address)?,
            None => [0u8; 20],
        };
        let coinbase = Transaction::new_coinbase_tx(locking_key, reward(0, config), 0);
        Ok(Block::new_block(
            GENESIS_PREVIOUS_HASH,
            vec![coinbase],
            0,
            DifficultyAdjustment::initial_target(config),
            config.genesis_timestamp,
        ))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn serialized_size(&self) -> usize {
        self.serialize().map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash())
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.header.set_nonce(nonce);
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_previous_hash(&self) -> &Hash256 {
        self.header.get_previous_hash()
    }

    pub fn get_merkle_root(&self) -> &Hash256 {
        self.header.get_merkle_root()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.header.get_timestamp()
    }

    pub fn get_target(&self) -> &Hash256 {
        self.header.get_target()
    }

    pub fn get_nonce(&self) -> u64 {
        self.header.get_nonce()
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn calculate_merkle_root(&self) -> Hash256 {
        MerkleTree::new(&self.transactions).root()
    }

    pub fn verify_merkle_root(&self) -> bool {
        self.calculate_merkle_root() == *self.header.get_merkle_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn easy_config() -> ChainConfig {
        ChainConfig {
            initial_difficulty_bits: 4,
            pow_limit_bits: 1,
            ..ChainConfig::default()
        }
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let config = easy_config();
        let a = Block::generate_genesis_block(&config).unwrap();
        let b = Block::generate_genesis_block(&config).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get_height(), 0);
        assert_eq!(*a.get_previous_hash(), GENESIS_PREVIOUS_HASH);
        assert!(a.get_transactions()[0].is_coinbase());
        assert!(ProofOfWork::validate(a.header()));
        assert!(a.verify_merkle_root());
    }

    #[test]
    fn test_genesis_depends_on_config() {
        let config = easy_config();
        let other = ChainConfig {
            genesis_timestamp: config.genesis_timestamp + 1,
            ..easy_config()
        };
        assert_ne!(
            Block::generate_genesis_block(&config).unwrap().hash(),
            Block::generate_genesis_block(&other).unwrap().hash()
        );
    }

    #[test]
    fn test_header_hash_covers_every_field() {
        let header = BlockHeader::new([1u8; 32], [2u8; 32], 42, [0xffu8; 32]);
        let base = header.hash();

        let mut changed = header.clone();
        changed.set_nonce(1);
        assert_ne!(changed.hash(), base);

        let mut changed = header.clone();
        changed.set_target([0x7fu8; 32]);
        assert_ne!(changed.hash(), base);

        let other_parent = BlockHeader::new([9u8; 32], [2u8; 32], 42, [0xffu8; 32]);
        assert_ne!(other_parent.hash(), base);

        let other_time = BlockHeader::new([1u8; 32], [2u8; 32], 43, [0xffu8; 32]);
        assert_ne!(other_time.hash(), base);
    }

    #[test]
    fn test_swapped_transactions_break_merkle_root() {
        let a = Transaction::new_coinbase_tx([1u8; 20], 10, 1);
        let b = Transaction::new_coinbase_tx([2u8; 20], 10, 1);
        let block = Block::new_candidate([0u8; 32], vec![a.clone(), b.clone()], 1, [0xff; 32], 0);
        assert!(block.verify_merkle_root());

        let swapped = Block::from_parts(block.header().clone(), vec![b, a], 1);
        assert!(!swapped.verify_merkle_root());
    }

    #[test]
    fn test_block_serialization() {
        let block = Block::generate_genesis_block(&easy_config()).unwrap();
        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }
}

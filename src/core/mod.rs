//! Core ledger functionality
//!
//! Blocks, transactions, the Merkle and proof-of-work rules, the reward and difficulty
//! schedule, and the ledger store that ties them together.

pub mod block;
pub mod blockchain;
pub mod difficulty;
pub mod merkle;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;

/// 256-bit hash, also used for big-endian targets
pub type Hash256 = [u8; 32];

/// RIPEMD-160 of the SHA-256 of a public key
pub type LockingKey = [u8; 20];

pub use block::{Block, BlockHeader, BLOCK_VERSION};
pub use blockchain::{Blockchain, BlockchainIterator, MAX_FUTURE_BLOCK_TIME};
pub use difficulty::DifficultyAdjustment;
pub use merkle::MerkleTree;
pub use monetary::{
    format_coins, issued_before, reward, MIN_TRANSACTION_FEE, SATOSHIS_PER_COIN,
};
pub use proof_of_work::{ProofOfWork, SearchLimits, SearchOutcome};
pub use transaction::{OutPoint, TXInput, TXOutput, Transaction, TransactionKind};

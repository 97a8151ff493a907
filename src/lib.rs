//! # CpyTro Chain - a small proof-of-work ledger
//!
//! A single-binary node: it keeps a UTXO ledger in sled, mines blocks on its own thread and
//! syncs with peers over plain TCP.
//!
//! ## Layout
//! - `core/`: blocks, transactions, Merkle roots, proof of work, the reward and difficulty
//!   schedule, and the ledger store (`Blockchain`) with its `commit` validation
//! - `miner/`: the mining state machine and the `BlockBroadcaster` seam
//! - `network/`: framed wire messages, the peer set and the P2P server
//! - `storage/`: the in-memory UTXO set and the mempool
//! - `wallet/`: ECDSA P-256 keys, base58check addresses, signing
//! - `config/`: TOML settings for consensus, the node and the miner
//! - `utils/`: hashing, signatures and bincode helpers
//! - `cli/`: command-line parsing
//!
//! ## Where to start
//! 1. `core/blockchain.rs` for `commit` and the validation order
//! 2. `core/transaction.rs` for how value moves and how inputs are authorized
//! 3. `miner/mod.rs` for how candidates are assembled and searched
//! 4. `network/server.rs` for how peers exchange blocks

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod miner;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::{ChainConfig, Config, MiningConfig, NodeConfig};
pub use core::{
    format_coins, reward, Block, BlockHeader, Blockchain, DifficultyAdjustment, Hash256,
    LockingKey, MerkleTree, OutPoint, ProofOfWork, TXInput, TXOutput, Transaction,
    MIN_TRANSACTION_FEE,
};
pub use error::{BlockchainError, RejectReason, Result};
pub use miner::{BlockBroadcaster, MineOutcome, Miner, MinerHandle, MinerState, MiningStatus};
pub use network::{request_status, send_tx, Envelope, NodeStatus, Package, Server};
pub use storage::{MemoryPool, UTXOSet};
pub use utils::{current_timestamp, sha256_hash};
pub use wallet::{
    address_to_locking_key, convert_address, public_key_to_locking_key, validate_address,
    Wallet, Wallets,
};

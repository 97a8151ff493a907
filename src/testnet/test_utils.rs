//! Test utilities for ledger, miner and network tests

use crate::config::{ChainConfig, MiningConfig, NodeConfig};
use crate::core::{Block, Blockchain, ProofOfWork};
use crate::miner::BlockBroadcaster;
use std::sync::Mutex;
use tempfile::TempDir;

/// Consensus parameters cheap enough to mine in a unit test
pub fn test_chain_config() -> ChainConfig {
    ChainConfig {
        initial_difficulty_bits: 1,
        pow_limit_bits: 1,
        adjustment_interval: 10_000,
        genesis_timestamp: 1_700_000_000_000,
        ..ChainConfig::default()
    }
}

pub fn mining_config() -> MiningConfig {
    MiningConfig {
        miner_address: None,
        check_interval: 64,
        max_iterations: u64::MAX,
        max_search_secs: 60,
        throttle_millis: 0,
    }
}

pub fn node_config(port: u16) -> NodeConfig {
    NodeConfig {
        listen_addr: format!("127.0.0.1:{port}"),
        max_peer_strikes: 3,
        mining_enabled: false,
        ..NodeConfig::default()
    }
}

/// A ledger in a temporary directory, removed on drop
pub struct TestLedger {
    pub blockchain: Blockchain,
    _dir: TempDir,
}

impl Default for TestLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLedger {
    pub fn new() -> TestLedger {
        Self::with_config(test_chain_config())
    }

    pub fn with_config(config: ChainConfig) -> TestLedger {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let blockchain = Blockchain::create_blockchain_with_path(&dir.path().join("ledger"), &config)
            .expect("Failed to create test ledger");
        TestLedger {
            blockchain,
            _dir: dir,
        }
    }

    /// Targets hard enough that a search bounded to a single attempt practically never
    /// succeeds, while genesis still mines in well under a second.
    pub fn hard_config() -> ChainConfig {
        ChainConfig {
            initial_difficulty_bits: 16,
            ..test_chain_config()
        }
    }

    /// Find a nonce for `block` against the target already in its header.
    pub fn solve(&self, mut block: Block) -> Block {
        let (nonce, _) = ProofOfWork::new_proof_of_work(block.header().clone()).run();
        block.set_nonce(nonce);
        block
    }
}

/// Broadcaster that remembers every block it was handed
#[derive(Default)]
pub struct RecordingBroadcaster {
    blocks: Mutex<Vec<Block>>,
}

impl RecordingBroadcaster {
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().expect("broadcaster lock").clone()
    }
}

impl BlockBroadcaster for RecordingBroadcaster {
    fn broadcast_block(&self, block: &Block) {
        self.blocks
            .lock()
            .expect("broadcaster lock")
            .push(block.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledgers_share_genesis() {
        let first = TestLedger::new();
        let second = TestLedger::new();
        assert_eq!(first.blockchain.tip_hash(), second.blockchain.tip_hash());
        assert_eq!(first.blockchain.height(), 1);
    }

    #[test]
    fn test_solve_meets_target() {
        let ledger = TestLedger::new();
        let candidate = ledger
            .blockchain
            .new_candidate_block([1u8; 20], vec![])
            .unwrap();
        let block = ledger.solve(candidate);
        assert!(ProofOfWork::validate(block.header()));
    }
}

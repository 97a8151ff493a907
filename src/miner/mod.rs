//! Block production
//!
//! One `Miner` runs on a dedicated thread: it assembles a candidate on the current tip,
//! searches nonces in bounded slices, and commits what it finds. The search gives up early
//! when asked to stop, when the tip moves under it, or when its iteration/time budget runs
//! out; in every one of those cases the drained transactions go back to the mempool.

use crate::config::MiningConfig;
use crate::core::{
    Block, Blockchain, Hash256, LockingKey, ProofOfWork, SearchLimits, SearchOutcome,
    Transaction,
};
use crate::error::{BlockchainError, RejectReason, Result};
use crate::storage::MemoryPool;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Bytes kept free in a block for the header, the coinbase and encoding overhead
const COINBASE_RESERVE: usize = 1024;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum MinerState {
    #[default]
    Idle,
    Assembling,
    Searching,
    Found,
    Cancelled,
    TimedOut,
}

#[derive(
    Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct MiningStatus {
    pub state: MinerState,
    pub blocks_mined: u64,
    /// Base units paid to the miner key by committed coinbases
    pub earned: u64,
    pub hashes_tried: u64,
    /// Hashes per second over the last search
    pub hash_rate: u64,
    pub last_rejection: Option<String>,
    pub last_block_hash: Option<Hash256>,
}

/// How one mining round ended
#[derive(Debug, Clone, PartialEq)]
pub enum MineOutcome {
    Found(Block),
    /// The solved block failed `commit`, usually because a peer's block landed first
    Rejected(RejectReason),
    Cancelled,
    TimedOut,
    /// The tip moved during the search
    Stale,
}

/// Where freshly committed local blocks are announced
pub trait BlockBroadcaster: Send + Sync {
    fn broadcast_block(&self, block: &Block);
}

/// Broadcaster for a node with no peers
pub struct NoBroadcast;

impl BlockBroadcaster for NoBroadcast {
    fn broadcast_block(&self, _block: &Block) {}
}

/// Shared view of a running miner: its status and its stop flag
#[derive(Clone, Default)]
pub struct MinerHandle {
    stop: Arc<AtomicBool>,
    status: Arc<RwLock<MiningStatus>>,
}

impl MinerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MiningStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<F: FnOnce(&mut MiningStatus)>(&self, f: F) {
        f(&mut self.status.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn set_state(&self, state: MinerState) {
        self.update(|status| status.state = state);
    }
}

pub struct Miner {
    blockchain: Blockchain,
    mempool: Arc<MemoryPool>,
    broadcaster: Arc<dyn BlockBroadcaster>,
    miner_key: LockingKey,
    limits: SearchLimits,
    handle: MinerHandle,
}

impl Miner {
    pub fn new(
        blockchain: Blockchain,
        mempool: Arc<MemoryPool>,
        broadcaster: Arc<dyn BlockBroadcaster>,
        miner_key: LockingKey,
        config: &MiningConfig,
    ) -> Miner {
        let limits = SearchLimits {
            check_interval: config.check_interval,
            max_iterations: config.max_iterations,
            max_duration: Duration::from_secs(config.max_search_secs),
            throttle: Duration::from_millis(config.throttle_millis),
        };
        Miner {
            blockchain,
            mempool,
            broadcaster,
            miner_key,
            limits,
            handle: MinerHandle::default(),
        }
    }

    pub fn handle(&self) -> MinerHandle {
        self.handle.clone()
    }

    /// Mine until stopped. Returns early only on a fatal storage error.
    pub fn run(&self) -> Result<()> {
        info!(
            "Miner started at height {} with check interval {}",
            self.blockchain.height(),
            self.limits.check_interval
        );
        while !self.handle.is_stopped() {
            match self.mine_once() {
                Ok(MineOutcome::Found(block)) => {
                    info!("Mined block {} at height {}", block.hash_hex(), block.get_height());
                }
                Ok(MineOutcome::Rejected(reason)) => {
                    warn!("Mined block rejected ({}), reassembling", reason.rule());
                }
                Ok(MineOutcome::Stale) => debug!("Tip moved during search, reassembling"),
                Ok(MineOutcome::TimedOut) => debug!("Search budget exhausted, reassembling"),
                Ok(MineOutcome::Cancelled) => break,
                Err(e) => {
                    error!("Miner stopping: {e}");
                    self.handle.set_state(MinerState::Idle);
                    return Err(e);
                }
            }
        }
        self.handle.set_state(MinerState::Idle);
        info!("Miner stopped");
        Ok(())
    }

    /// One assemble/search/commit round.
    pub fn mine_once(&self) -> Result<MineOutcome> {
        let result = self.mine_round();
        self.handle.set_state(MinerState::Idle);
        result
    }

    fn mine_round(&self) -> Result<MineOutcome> {
        self.handle.set_state(MinerState::Assembling);
        let transactions = self.collect_transactions()?;
        let mut candidate = match self
            .blockchain
            .new_candidate_block(self.miner_key, transactions.clone())
        {
            Ok(candidate) => candidate,
            Err(e) => {
                self.mempool.return_unmined(transactions);
                return Err(e);
            }
        };
        let parent = *candidate.get_previous_hash();

        self.handle.set_state(MinerState::Searching);
        let started = Instant::now();
        let mut stale = false;
        let outcome = ProofOfWork::new_proof_of_work(candidate.header().clone()).search(
            &self.limits,
            || {
                if self.handle.is_stopped() {
                    return true;
                }
                stale = self.blockchain.tip_hash() != parent;
                stale
            },
        );
        self.record_search(outcome.attempts(), started.elapsed());

        let nonce = match outcome {
            SearchOutcome::Found { nonce, .. } => nonce,
            SearchOutcome::Interrupted { .. } => {
                self.mempool.return_unmined(transactions);
                if stale {
                    return Ok(MineOutcome::Stale);
                }
                self.handle.set_state(MinerState::Cancelled);
                return Ok(MineOutcome::Cancelled);
            }
            SearchOutcome::Exhausted { .. } => {
                self.mempool.return_unmined(transactions);
                self.handle.set_state(MinerState::TimedOut);
                return Ok(MineOutcome::TimedOut);
            }
        };

        candidate.set_nonce(nonce);
        self.handle.set_state(MinerState::Found);
        match self.blockchain.commit(&candidate) {
            Ok(()) => {
                self.mempool.remove_mined(&candidate);
                let earned = candidate.get_transactions()[0].output_value().unwrap_or(0);
                let hash = candidate.hash();
                self.handle.update(|status| {
                    status.blocks_mined += 1;
                    status.earned = status.earned.saturating_add(earned);
                    status.last_block_hash = Some(hash);
                });
                self.broadcaster.broadcast_block(&candidate);
                Ok(MineOutcome::Found(candidate))
            }
            Err(BlockchainError::Rejected(reason)) => {
                self.mempool.return_unmined(transactions);
                self.handle
                    .update(|status| status.last_rejection = Some(reason.rule().to_string()));
                Ok(MineOutcome::Rejected(reason))
            }
            Err(e) => {
                self.mempool.return_unmined(transactions);
                Err(e)
            }
        }
    }

    // Drain the mempool and keep only what is valid against the current UTXO set
    fn collect_transactions(&self) -> Result<Vec<Transaction>> {
        let config = self.blockchain.config();
        let budget = config.max_block_size.saturating_sub(COINBASE_RESERVE);
        let max_count = config.max_block_transactions.saturating_sub(1);

        let mut drained = self.mempool.drain_eligible(budget);
        if drained.len() > max_count {
            let overflow = drained.split_off(max_count);
            self.mempool.return_unmined(overflow);
        }

        let mut spent = HashSet::new();
        let mut accepted = Vec::with_capacity(drained.len());
        let mut pending = drained.into_iter();
        while let Some(tx) = pending.next() {
            match self.blockchain.validate_transaction(&tx, &spent) {
                Ok(_) => {
                    spent.extend(tx.get_vin().iter().map(|vin| vin.outpoint()));
                    accepted.push(tx);
                }
                Err(e) if e.is_fatal() => {
                    accepted.push(tx);
                    accepted.extend(pending);
                    self.mempool.return_unmined(accepted);
                    return Err(e);
                }
                Err(e) => debug!("Dropping transaction {} from mempool: {e}", tx.id_hex()),
            }
        }
        Ok(accepted)
    }

    fn record_search(&self, attempts: u64, elapsed: Duration) {
        let millis = elapsed.as_millis().max(1) as u64;
        self.handle.update(|status| {
            status.hashes_tried = status.hashes_tried.saturating_add(attempts);
            status.hash_rate = attempts.saturating_mul(1000) / millis;
        });
    }
}

// The ledger store: every accepted block, the transaction index and the UTXO set, all in sled.
// `commit` is the only way anything gets written, and it validates before it writes.

use crate::config::ChainConfig;
use crate::core::block::GENESIS_PREVIOUS_HASH;
use crate::core::{
    issued_before, reward, Block, DifficultyAdjustment, Hash256, LockingKey, OutPoint,
    ProofOfWork, TXOutput, Transaction,
};
use crate::error::{BlockchainError, RejectReason, Result};
use crate::storage::utxo_set::{decode_outpoint_key, outpoint_key, owner_key};
use crate::storage::UTXOSet;
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

const BLOCKS_TREE: &str = "blocks"; // height (BE) -> block
const TRANSACTIONS_TREE: &str = "transactions"; // txid -> height (BE) ++ position (BE)
const UTXO_TREE: &str = "utxo"; // txid ++ index (BE) -> output
const UTXO_BY_KEY_TREE: &str = "utxo_by_key"; // locking key ++ txid ++ index -> ()
const META_TREE: &str = "meta";

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash";
/// How far past the local clock a block timestamp may be, in milliseconds
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60 * 1000;
const EMPTY_VALUE: &[u8] = &[];
const BLOCK_COUNT_KEY: &str = "block_count";

struct ChainState {
    tip: Option<Block>,
}

impl ChainState {
    fn height(&self) -> u64 {
        self.tip.as_ref().map_or(0, |tip| tip.get_height() + 1)
    }

    fn tip_hash(&self) -> Hash256 {
        self.tip
            .as_ref()
            .map_or(GENESIS_PREVIOUS_HASH, |tip| tip.hash())
    }
}

// What a validated block does to the store
struct BlockDelta {
    spent: Vec<(OutPoint, TXOutput)>,
    created: Vec<(OutPoint, TXOutput)>,
    locations: Vec<(Hash256, u32)>,
}

/// Cheap-to-clone handle on the ledger.
///
/// Reads take the state read lock and `commit` holds the write lock from validation through
/// the sled write, so a reader sees the chain either before or after a block, never between.
#[derive(Clone)]
pub struct Blockchain {
    state: Arc<RwLock<ChainState>>,
    config: Arc<ChainConfig>,
    db: Db,
    blocks: Tree,
    transactions: Tree,
    utxo: Tree,
    utxo_by_key: Tree,
    meta: Tree,
}

impl Blockchain {
    /// Open (or create) the store at `path`; the chain may be empty.
    pub fn open(path: &Path, config: &ChainConfig) -> Result<Blockchain> {
        let db = sled::open(path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let open_tree = |name: &str| {
            db.open_tree(name).map_err(|e| {
                BlockchainError::Database(format!("Failed to open {name} tree: {e}"))
            })
        };

        let blockchain = Blockchain {
            state: Arc::new(RwLock::new(ChainState { tip: None })),
            config: Arc::new(config.clone()),
            blocks: open_tree(BLOCKS_TREE)?,
            transactions: open_tree(TRANSACTIONS_TREE)?,
            utxo: open_tree(UTXO_TREE)?,
            utxo_by_key: open_tree(UTXO_BY_KEY_TREE)?,
            meta: open_tree(META_TREE)?,
            db,
        };

        let block_count = match blockchain.meta.get(BLOCK_COUNT_KEY)? {
            Some(bytes) => read_u64(&bytes)?,
            None => 0,
        };
        if block_count > 0 {
            let tip = blockchain.block_at(block_count - 1)?.ok_or_else(|| {
                BlockchainError::Database(format!("Tip block {} missing", block_count - 1))
            })?;
            info!(
                "Opened ledger at {} with {block_count} blocks, tip {}",
                path.display(),
                tip.hash_hex()
            );
            blockchain.write_state().tip = Some(tip);
        }
        Ok(blockchain)
    }

    /// Open the store at `path`, committing the genesis block if it is empty.
    pub fn create_blockchain_with_path(path: &Path, config: &ChainConfig) -> Result<Blockchain> {
        let blockchain = Self::open(path, config)?;
        if blockchain.height() == 0 {
            let genesis = Block::generate_genesis_block(config)?;
            info!("Creating genesis block {}", genesis.hash_hex());
            blockchain.commit(&genesis)?;
        }
        Ok(blockchain)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Highest committed block
    pub fn tip(&self) -> Option<Block> {
        self.read_state().tip.clone()
    }

    /// Number of committed blocks, which is also the height of the next block
    pub fn height(&self) -> u64 {
        self.read_state().height()
    }

    /// Hash the next block must name as its parent
    pub fn tip_hash(&self) -> Hash256 {
        self.read_state().tip_hash()
    }

    /// Validate `block` against the current tip and apply it atomically.
    ///
    /// A rejection leaves the store untouched and comes back as
    /// `BlockchainError::Rejected`.
    pub fn commit(&self, block: &Block) -> Result<()> {
        let mut state = self.write_state();
        let delta = match self.validate_block(&state, block) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(
                    "Rejected block {} at height {}: {e}",
                    block.hash_hex(),
                    block.get_height()
                );
                return Err(e);
            }
        };

        self.write_block(block, &delta)?;
        state.tip = Some(block.clone());
        info!(
            "Committed block {} at height {} ({} transactions)",
            block.hash_hex(),
            block.get_height(),
            block.get_transactions().len()
        );
        Ok(())
    }

    fn validate_block(&self, state: &ChainState, block: &Block) -> Result<BlockDelta> {
        let height = state.height();
        if *block.get_previous_hash() != state.tip_hash() {
            return Err(RejectReason::PreviousHashMismatch.into());
        }
        if block.get_height() != height {
            return Err(RejectReason::HeightMismatch {
                expected: height,
                actual: block.get_height(),
            }
            .into());
        }

        if !ProofOfWork::validate(block.header()) {
            return Err(RejectReason::InsufficientProofOfWork.into());
        }
        if *block.get_target() != self.expected_target(state)? {
            return Err(RejectReason::UnexpectedTarget.into());
        }

        if let Some(parent) = &state.tip {
            if block.get_timestamp() < parent.get_timestamp() {
                return Err(RejectReason::TimestampTooOld {
                    parent: parent.get_timestamp(),
                    actual: block.get_timestamp(),
                }
                .into());
            }
        }
        let latest = current_timestamp()?.saturating_add(MAX_FUTURE_BLOCK_TIME);
        if block.get_timestamp() > latest {
            return Err(RejectReason::TimestampTooFarAhead {
                latest,
                actual: block.get_timestamp(),
            }
            .into());
        }

        if !block.verify_merkle_root() {
            return Err(RejectReason::MerkleRootMismatch.into());
        }

        let transactions = block.get_transactions();
        let coinbase = transactions.first().ok_or(RejectReason::EmptyBlock)?;
        if !coinbase.is_coinbase() {
            return Err(RejectReason::MissingCoinbase.into());
        }
        if !coinbase.get_vin().is_empty() || coinbase.get_locktime() != height {
            return Err(RejectReason::MalformedCoinbase.into());
        }
        if let Some(index) = transactions.iter().skip(1).position(Transaction::is_coinbase) {
            return Err(RejectReason::MisplacedCoinbase { index: index + 1 }.into());
        }

        let expected_reward = reward(height, &self.config);
        let coinbase_value = coinbase.output_value().ok_or(RejectReason::ValueOverflow)?;
        if coinbase_value != expected_reward {
            return Err(RejectReason::CoinbaseValueMismatch {
                expected: expected_reward,
                actual: coinbase_value,
            }
            .into());
        }

        let mut spent_in_block = HashSet::new();
        let mut seen_txids = HashSet::new();
        let mut delta = BlockDelta {
            spent: vec![],
            created: vec![],
            locations: vec![],
        };
        for (position, tx) in transactions.iter().enumerate() {
            let txid = tx.id();
            if !seen_txids.insert(txid) {
                return Err(RejectReason::DuplicateTransaction {
                    txid: HEXLOWER.encode(&txid),
                }
                .into());
            }
            self.ensure_not_committed(&txid)?;
            if position > 0 {
                let (_, consumed) = self.check_transaction(tx, &txid, &spent_in_block)?;
                for (outpoint, output) in consumed {
                    spent_in_block.insert(outpoint);
                    delta.spent.push((outpoint, output));
                }
            }
            for (index, output) in tx.get_vout().iter().enumerate() {
                delta
                    .created
                    .push((OutPoint::new(txid, index as u32), output.clone()));
            }
            delta.locations.push((txid, position as u32));
        }

        if transactions.len() > self.config.max_block_transactions {
            return Err(RejectReason::TooManyTransactions {
                count: transactions.len(),
                max: self.config.max_block_transactions,
            }
            .into());
        }
        let size = block.serialized_size();
        if size > self.config.max_block_size {
            return Err(RejectReason::BlockTooLarge {
                size,
                max: self.config.max_block_size,
            }
            .into());
        }

        Ok(delta)
    }

    // Input/value rules for one non-coinbase transaction against the stored UTXO set.
    // Returns the fee and the outputs it consumes.
    fn check_transaction(
        &self,
        tx: &Transaction,
        txid: &Hash256,
        spent_in_block: &HashSet<OutPoint>,
    ) -> Result<(u64, Vec<(OutPoint, TXOutput)>)> {
        let txid_hex = HEXLOWER.encode(txid);
        if tx.get_vin().is_empty() {
            return Err(RejectReason::MissingInputs { txid: txid_hex }.into());
        }

        let mut consumed: Vec<(OutPoint, TXOutput)> = vec![];
        let mut inputs_total = 0u64;
        for (idx, vin) in tx.get_vin().iter().enumerate() {
            let outpoint = vin.outpoint();
            if spent_in_block.contains(&outpoint) || consumed.iter().any(|(op, _)| *op == outpoint)
            {
                return Err(RejectReason::DoubleSpend {
                    txid: outpoint.txid_hex(),
                    index: outpoint.index,
                }
                .into());
            }
            let output = self
                .load_utxo(&outpoint)?
                .ok_or_else(|| RejectReason::UnknownOutput {
                    txid: outpoint.txid_hex(),
                    index: outpoint.index,
                })?;
            if !tx.verify_input(idx, output.get_locking_key()) {
                return Err(RejectReason::InvalidSignature {
                    txid: txid_hex,
                    input: idx,
                }
                .into());
            }
            inputs_total = inputs_total
                .checked_add(output.get_value())
                .ok_or(RejectReason::ValueOverflow)?;
            consumed.push((outpoint, output));
        }

        let outputs_total = tx.output_value().ok_or(RejectReason::ValueOverflow)?;
        if outputs_total > inputs_total {
            return Err(RejectReason::OutputsExceedInputs {
                txid: txid_hex,
                inputs: inputs_total,
                outputs: outputs_total,
            }
            .into());
        }
        Ok((inputs_total - outputs_total, consumed))
    }

    /// Check a loose transaction against the current UTXO set, treating `spent_in_block`
    /// as already consumed. Returns the fee. Coinbases are only valid inside a block.
    pub fn validate_transaction(
        &self,
        tx: &Transaction,
        spent_in_block: &HashSet<OutPoint>,
    ) -> Result<u64> {
        let _state = self.read_state();
        if tx.is_coinbase() {
            return Err(RejectReason::MisplacedCoinbase { index: 0 }.into());
        }
        let txid = tx.id();
        self.ensure_not_committed(&txid)?;
        let (fee, _) = self.check_transaction(tx, &txid, spent_in_block)?;
        Ok(fee)
    }

    // A txid may enter the ledger once; a second copy would overwrite its outputs.
    fn ensure_not_committed(&self, txid: &Hash256) -> Result<()> {
        if self.transactions.contains_key(txid)? {
            return Err(RejectReason::DuplicateTransaction {
                txid: HEXLOWER.encode(txid),
            }
            .into());
        }
        Ok(())
    }

    fn write_block(&self, block: &Block, delta: &BlockDelta) -> Result<()> {
        let height = block.get_height();
        let height_key = height.to_be_bytes();
        let block_bytes = block.serialize()?;
        let tip_hash = block.hash();
        let block_count = (height + 1).to_be_bytes();

        let locations: Vec<(Hash256, [u8; 12])> = delta
            .locations
            .iter()
            .map(|(txid, position)| {
                let mut location = [0u8; 12];
                location[..8].copy_from_slice(&height_key);
                location[8..].copy_from_slice(&position.to_be_bytes());
                (*txid, location)
            })
            .collect();
        let spent: Vec<([u8; 36], [u8; 56])> = delta
            .spent
            .iter()
            .map(|(outpoint, output)| {
                (
                    outpoint_key(outpoint),
                    owner_key(output.get_locking_key(), outpoint),
                )
            })
            .collect();
        let mut created: Vec<([u8; 36], [u8; 56], Vec<u8>)> = vec![];
        for (outpoint, output) in &delta.created {
            created.push((
                outpoint_key(outpoint),
                owner_key(output.get_locking_key(), outpoint),
                serialize(output)?,
            ));
        }

        (
            &self.blocks,
            &self.transactions,
            &self.utxo,
            &self.utxo_by_key,
            &self.meta,
        )
            .transaction(|(blocks, transactions, utxo, utxo_by_key, meta)| {
                blocks.insert(&height_key[..], block_bytes.as_slice())?;
                for (txid, location) in &locations {
                    transactions.insert(&txid[..], &location[..])?;
                }
                for (key, owner) in &spent {
                    utxo.remove(&key[..])?;
                    utxo_by_key.remove(&owner[..])?;
                }
                for (key, owner, bytes) in &created {
                    utxo.insert(&key[..], bytes.as_slice())?;
                    utxo_by_key.insert(&owner[..], EMPTY_VALUE)?;
                }
                meta.insert(TIP_BLOCK_HASH_KEY, &tip_hash[..])?;
                meta.insert(BLOCK_COUNT_KEY, &block_count[..])?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Database(format!("Failed to commit block at height {height}: {e}"))
            })?;

        self.db.flush()?;
        Ok(())
    }

    fn load_utxo(&self, outpoint: &OutPoint) -> Result<Option<TXOutput>> {
        match self.utxo.get(outpoint_key(outpoint))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// `(txid, index, value)` of every unspent output locked to `locking_key`.
    pub fn utxo_for(&self, locking_key: &LockingKey) -> Result<Vec<(Hash256, u32, u64)>> {
        let _state = self.read_state();
        let mut found = vec![];
        for item in self.utxo_by_key.scan_prefix(locking_key) {
            let (key, _) = item?;
            let outpoint = decode_outpoint_key(&key[20..]).ok_or_else(|| {
                BlockchainError::Database("Malformed utxo_by_key entry".to_string())
            })?;
            let output = self.load_utxo(&outpoint)?.ok_or_else(|| {
                BlockchainError::Database(format!(
                    "Owner index points at missing output {}:{}",
                    outpoint.txid_hex(),
                    outpoint.index
                ))
            })?;
            found.push((outpoint.txid, outpoint.index, output.get_value()));
        }
        Ok(found)
    }

    pub fn balance(&self, locking_key: &LockingKey) -> Result<u64> {
        self.utxo_for(locking_key)?
            .iter()
            .try_fold(0u64, |acc, (_, _, value)| acc.checked_add(*value))
            .ok_or_else(|| BlockchainError::Database("Balance overflow".to_string()))
    }

    pub fn block_at(&self, height: u64) -> Result<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` committed blocks starting at `from_height`, in height order.
    pub fn blocks_from(&self, from_height: u64, limit: usize) -> Result<Vec<Block>> {
        let mut blocks = vec![];
        for item in self.blocks.range(from_height.to_be_bytes()..).take(limit) {
            let (_, bytes) = item?;
            blocks.push(Block::deserialize(&bytes)?);
        }
        Ok(blocks)
    }

    /// Whether this exact block is already part of the chain
    pub fn has_block(&self, block: &Block) -> Result<bool> {
        Ok(self
            .block_at(block.get_height())?
            .map_or(false, |stored| stored.hash() == block.hash()))
    }

    /// Committed transaction with the height of the block holding it.
    pub fn find_transaction(&self, txid: &Hash256) -> Result<Option<(Transaction, u64)>> {
        let Some(location) = self.transactions.get(txid)? else {
            return Ok(None);
        };
        if location.len() != 12 {
            return Err(BlockchainError::Database(
                "Malformed transaction location".to_string(),
            ));
        }
        let height = read_u64(&location[..8])?;
        let position = location[8..]
            .try_into()
            .map(u32::from_be_bytes)
            .map_err(|_| BlockchainError::Database("Malformed transaction location".to_string()))?
            as usize;
        let block = self.block_at(height)?.ok_or_else(|| {
            BlockchainError::Database(format!("Indexed block {height} missing"))
        })?;
        Ok(block
            .get_transactions()
            .get(position)
            .cloned()
            .map(|tx| (tx, height)))
    }

    /// Copy of the stored UTXO set
    pub fn utxo_snapshot(&self) -> Result<UTXOSet> {
        let _state = self.read_state();
        let mut set = UTXOSet::new();
        for item in self.utxo.iter() {
            let (key, bytes) = item?;
            let outpoint = decode_outpoint_key(&key)
                .ok_or_else(|| BlockchainError::Database("Malformed utxo key".to_string()))?;
            set.insert(outpoint, deserialize(&bytes)?);
        }
        Ok(set)
    }

    /// Rebuild a UTXO set from `blocks` alone.
    pub fn replay(blocks: &[Block]) -> UTXOSet {
        UTXOSet::replay(blocks)
    }

    /// Recompute the stored UTXO trees from the committed blocks. Returns the number of
    /// unspent outputs.
    pub fn reindex_utxo(&self) -> Result<usize> {
        let state = self.write_state();
        let blocks = self.blocks_from(0, state.height() as usize)?;
        let set = UTXOSet::replay(&blocks);

        self.utxo.clear()?;
        self.utxo_by_key.clear()?;
        for (outpoint, output) in set.iter() {
            self.utxo
                .insert(outpoint_key(outpoint), serialize(output)?)?;
            self.utxo_by_key
                .insert(owner_key(output.get_locking_key(), outpoint), EMPTY_VALUE)?;
        }
        self.db.flush()?;
        info!("Reindexed {} unspent outputs", set.len());
        Ok(set.len())
    }

    /// Target the next block must carry
    pub fn next_target(&self) -> Result<Hash256> {
        let state = self.read_state();
        self.expected_target(&state)
    }

    fn expected_target(&self, state: &ChainState) -> Result<Hash256> {
        let Some(tip) = &state.tip else {
            return Ok(DifficultyAdjustment::initial_target(&self.config));
        };
        let height = tip.get_height() + 1;
        if !DifficultyAdjustment::is_adjustment_height(height, &self.config) {
            return Ok(*tip.get_target());
        }
        let timestamps = self.timestamps_before(height, self.config.adjustment_interval)?;
        Ok(DifficultyAdjustment::next_target(
            height,
            &timestamps,
            tip.get_target(),
            &self.config,
        ))
    }

    /// Timestamps of the last `count` committed blocks, oldest first.
    pub fn recent_timestamps(&self, count: u64) -> Result<Vec<i64>> {
        let state = self.read_state();
        self.timestamps_before(state.height(), count)
    }

    fn timestamps_before(&self, height: u64, count: u64) -> Result<Vec<i64>> {
        let start = height.saturating_sub(count);
        let mut timestamps = vec![];
        for item in self
            .blocks
            .range(start.to_be_bytes()..height.to_be_bytes())
        {
            let (_, bytes) = item?;
            timestamps.push(Block::deserialize(&bytes)?.get_timestamp());
        }
        Ok(timestamps)
    }

    /// Coins issued by every committed coinbase
    pub fn issued_supply(&self) -> u64 {
        issued_before(self.height(), &self.config)
    }

    /// Unsolved next block: coinbase paying `miner_key` the scheduled reward, then
    /// `transactions`, over the current tip and target.
    pub fn new_candidate_block(
        &self,
        miner_key: LockingKey,
        transactions: Vec<Transaction>,
    ) -> Result<Block> {
        let state = self.read_state();
        let height = state.height();
        let target = self.expected_target(&state)?;
        let coinbase = Transaction::new_coinbase_tx(miner_key, reward(height, &self.config), height);

        let mut block_transactions = Vec::with_capacity(transactions.len() + 1);
        block_transactions.push(coinbase);
        block_transactions.extend(transactions);

        debug!(
            "Assembled candidate at height {height} with {} transactions",
            block_transactions.len()
        );
        // Never stamp a candidate earlier than its parent, even if the clock stepped back
        let timestamp = match &state.tip {
            Some(parent) => current_timestamp()?.max(parent.get_timestamp()),
            None => current_timestamp()?,
        };
        Ok(Block::new_candidate(
            state.tip_hash(),
            block_transactions,
            height,
            target,
            timestamp,
        ))
    }

    /// Assemble, solve without bounds, and commit the next block.
    pub fn mine_block(
        &self,
        miner_key: LockingKey,
        transactions: Vec<Transaction>,
    ) -> Result<Block> {
        let mut block = self.new_candidate_block(miner_key, transactions)?;
        let (nonce, _) = ProofOfWork::new_proof_of_work(block.header().clone()).run();
        block.set_nonce(nonce);
        self.commit(&block)?;
        Ok(block)
    }

    /// Blocks from the tip back to genesis
    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator {
            blocks: self.blocks.clone(),
            next_height: self.tip().map(|tip| tip.get_height()),
        }
    }
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BlockchainError::Database("Malformed integer record".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

pub struct BlockchainIterator {
    blocks: Tree,
    next_height: Option<u64>,
}

impl Iterator for BlockchainIterator {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let height = self.next_height?;
        let data = self.blocks.get(height.to_be_bytes()).ok()??;
        let block = Block::deserialize(&data).ok()?;
        self.next_height = height.checked_sub(1);
        Some(block)
    }
}

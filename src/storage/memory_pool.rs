use crate::core::{Block, Hash256, OutPoint, Transaction};
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

/// Default cap on pending transactions
pub const DEFAULT_MEMPOOL_CAPACITY: usize = 5_000;

#[derive(Default)]
struct PoolInner {
    order: BTreeMap<i64, Hash256>,
    // txid -> (position in `order`, transaction, serialized size)
    entries: HashMap<Hash256, (i64, Transaction, usize)>,
    // outpoint -> pending transaction spending it
    spending: HashMap<OutPoint, Hash256>,
    next_back: i64,
    next_front: i64,
}

impl PoolInner {
    fn conflicts(&self, tx: &Transaction) -> bool {
        tx.get_vin()
            .iter()
            .any(|vin| self.spending.contains_key(&vin.outpoint()))
    }

    fn insert_at(&mut self, seq: i64, txid: Hash256, tx: Transaction) {
        let size = tx.serialized_size();
        for vin in tx.get_vin() {
            self.spending.insert(vin.outpoint(), txid);
        }
        self.order.insert(seq, txid);
        self.entries.insert(txid, (seq, tx, size));
    }

    fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let (seq, tx, _) = self.entries.remove(txid)?;
        self.order.remove(&seq);
        for vin in tx.get_vin() {
            self.spending.remove(&vin.outpoint());
        }
        Some(tx)
    }
}

/// Pending transactions in arrival order
///
/// The miner drains from the front and hands back whatever did not make it into a block,
/// which goes back to the front so it keeps its place. At most one pending transaction may
/// spend a given output; the first one seen wins.
pub struct MemoryPool {
    inner: RwLock<PoolInner>,
    capacity: usize,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        Self::with_capacity(DEFAULT_MEMPOOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(PoolInner::default()),
            capacity,
        }
    }

    /// Queue `tx` at the back. Returns false for duplicates, coinbases, transactions that
    /// spend an output another pending transaction already spends, and when the pool is full.
    pub fn add(&self, tx: Transaction) -> bool {
        if tx.is_coinbase() {
            return false;
        }
        match self.inner.write() {
            Ok(mut pool) => {
                let txid = tx.id();
                if pool.entries.contains_key(&txid) {
                    return false;
                }
                if pool.conflicts(&tx) {
                    debug!("Transaction {} conflicts with a pending spend", tx.id_hex());
                    return false;
                }
                if pool.entries.len() >= self.capacity {
                    debug!("Memory pool full, dropping transaction {}", tx.id_hex());
                    return false;
                }
                let seq = pool.next_back;
                pool.next_back += 1;
                pool.insert_at(seq, txid, tx);
                true
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                false
            }
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.entries.contains_key(txid),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    /// Take transactions from the front, in order, while their total serialized size stays
    /// within `max_bytes`. A transaction too large for the remaining room is left in place.
    pub fn drain_eligible(&self, max_bytes: usize) -> Vec<Transaction> {
        let mut pool = match self.inner.write() {
            Ok(pool) => pool,
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                return vec![];
            }
        };

        let mut remaining = max_bytes;
        let mut selected = vec![];
        for txid in pool.order.values() {
            if let Some((_, _, size)) = pool.entries.get(txid) {
                if *size <= remaining {
                    remaining -= size;
                    selected.push(*txid);
                }
            }
        }
        selected
            .iter()
            .filter_map(|txid| pool.remove(txid))
            .collect()
    }

    /// Put drained transactions back at the front, keeping their relative order. They were
    /// admitted once, so the capacity check does not apply; a spend that arrived while they
    /// were out of the pool keeps its place and the returned conflict is dropped.
    pub fn return_unmined(&self, txs: Vec<Transaction>) {
        match self.inner.write() {
            Ok(mut pool) => {
                for tx in txs.into_iter().rev() {
                    let txid = tx.id();
                    if pool.entries.contains_key(&txid) || pool.conflicts(&tx) {
                        continue;
                    }
                    pool.next_front -= 1;
                    let seq = pool.next_front;
                    pool.insert_at(seq, txid, tx);
                }
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    /// Drop everything `block` confirmed, plus pending transactions that spend an output the
    /// block already spent.
    pub fn remove_mined(&self, block: &Block) {
        let mut pool = match self.inner.write() {
            Ok(pool) => pool,
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
                return;
            }
        };

        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in block.get_transactions() {
            pool.remove(&tx.id());
            spent.extend(tx.get_vin().iter().map(|vin| vin.outpoint()));
        }

        let conflicting: Vec<Hash256> = spent
            .iter()
            .filter_map(|outpoint| pool.spending.get(outpoint).copied())
            .collect();
        for txid in conflicting {
            pool.remove(&txid);
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.entries.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every pending transaction in queue order
    pub fn get_all(&self) -> Vec<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool
                .order
                .values()
                .filter_map(|txid| pool.entries.get(txid).map(|(_, tx, _)| tx.clone()))
                .collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                Vec::new()
            }
        }
    }
}

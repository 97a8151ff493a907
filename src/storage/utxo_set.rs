use crate::core::{Block, Hash256, LockingKey, OutPoint, TXOutput};
use std::collections::BTreeMap;

/// `utxo` tree key: txid followed by the big-endian output index
pub(crate) fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.txid);
    key[32..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

pub(crate) fn decode_outpoint_key(bytes: &[u8]) -> Option<OutPoint> {
    if bytes.len() != 36 {
        return None;
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&bytes[..32]);
    let mut index = [0u8; 4];
    index.copy_from_slice(&bytes[32..]);
    Some(OutPoint::new(txid, u32::from_be_bytes(index)))
}

/// `utxo_by_key` tree key: locking key prefix so one owner's outputs are a prefix scan
pub(crate) fn owner_key(locking_key: &LockingKey, outpoint: &OutPoint) -> [u8; 56] {
    let mut key = [0u8; 56];
    key[..20].copy_from_slice(locking_key);
    key[20..].copy_from_slice(&outpoint_key(outpoint));
    key
}

/// In-memory view of the unspent outputs
///
/// The ledger store keeps the durable copy in sled; this type is what `replay` produces and
/// what `utxo_snapshot` reads back, so the two can be compared directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UTXOSet {
    outputs: BTreeMap<OutPoint, TXOutput>,
}

impl UTXOSet {
    pub fn new() -> UTXOSet {
        UTXOSet::default()
    }

    /// Rebuild the set by applying `blocks` in order from an empty set.
    pub fn replay<'a, I>(blocks: I) -> UTXOSet
    where
        I: IntoIterator<Item = &'a Block>,
    {
        let mut set = UTXOSet::new();
        for block in blocks {
            set.apply_block(block);
        }
        set
    }

    /// Spend every input and add every output of `block`. No validation happens here.
    pub fn apply_block(&mut self, block: &Block) {
        for tx in block.get_transactions() {
            for vin in tx.get_vin() {
                self.outputs.remove(&vin.outpoint());
            }
            let txid = tx.id();
            for (index, out) in tx.get_vout().iter().enumerate() {
                self.outputs
                    .insert(OutPoint::new(txid, index as u32), out.clone());
            }
        }
    }

    pub fn insert(&mut self, outpoint: OutPoint, output: TXOutput) {
        self.outputs.insert(outpoint, output);
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&TXOutput> {
        self.outputs.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.outputs.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &TXOutput)> {
        self.outputs.iter()
    }

    /// `(txid, index, value)` of every output locked to `locking_key`
    pub fn find_utxo(&self, locking_key: &LockingKey) -> Vec<(Hash256, u32, u64)> {
        self.outputs
            .iter()
            .filter(|(_, out)| out.is_locked_with_key(locking_key))
            .map(|(outpoint, out)| (outpoint.txid, outpoint.index, out.get_value()))
            .collect()
    }

    pub fn total_value(&self) -> u128 {
        self.outputs
            .values()
            .map(|out| u128::from(out.get_value()))
            .sum()
    }
}

// Transactions follow the UTXO model: each one consumes earlier outputs and creates new ones.
// The id is derived from the unsigned form, so signatures never change it.

use crate::core::blockchain::Blockchain;
use crate::core::{Hash256, LockingKey};
use crate::error::{BlockchainError, Result};
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_hash,
};
use crate::wallet::{public_key_to_locking_key, Wallet};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};

pub const TRANSACTION_VERSION: u32 = 1;

/// Reference to one output of an earlier transaction; the UTXO key
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> OutPoint {
        OutPoint { txid, index }
    }

    pub fn txid_hex(&self) -> String {
        HEXLOWER.encode(&self.txid)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum TransactionKind {
    Coinbase,
    Regular,
}

// An input says "I spend output #index of transaction prior_txid" and carries the proof
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    prior_txid: Hash256,
    output_index: u32,
    signature: Vec<u8>,  // ECDSA signature over the transaction id
    public_key: Vec<u8>, // Must hash to the spent output's locking key
}

impl TXInput {
    // Inputs start unsigned; `Transaction::sign` fills in the authorization
    pub fn new(outpoint: OutPoint) -> TXInput {
        TXInput {
            prior_txid: outpoint.txid,
            output_index: outpoint.index,
            signature: vec![],
            public_key: vec![],
        }
    }

    pub fn get_prior_txid(&self) -> &Hash256 {
        &self.prior_txid
    }

    pub fn get_output_index(&self) -> u32 {
        self.output_index
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prior_txid, self.output_index)
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    fn unsigned(&self) -> TXInput {
        TXInput::new(self.outpoint())
    }
}

// An output is value locked to whoever can sign for `locking_key`
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutput {
    value: u64,
    locking_key: LockingKey,
}

impl TXOutput {
    pub fn with_key(value: u64, locking_key: LockingKey) -> TXOutput {
        TXOutput { value, locking_key }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_locking_key(&self) -> &LockingKey {
        &self.locking_key
    }

    pub fn is_locked_with_key(&self, locking_key: &LockingKey) -> bool {
        self.locking_key.eq(locking_key)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    version: u32,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
    locktime: u64,
    kind: TransactionKind,
}

impl Transaction {
    /// Reward transaction for the block at `height`. The height goes into `locktime` so
    /// coinbases paying the same key the same amount still get distinct ids.
    pub fn new_coinbase_tx(locking_key: LockingKey, reward: u64, height: u64) -> Transaction {
        Transaction {
            version: TRANSACTION_VERSION,
            vin: vec![],
            vout: vec![TXOutput::with_key(reward, locking_key)],
            locktime: height,
            kind: TransactionKind::Coinbase,
        }
    }

    /// Unsigned regular transaction; call `sign` before relaying it.
    pub fn new_regular(spends: &[OutPoint], outputs: Vec<TXOutput>) -> Transaction {
        Transaction {
            version: TRANSACTION_VERSION,
            vin: spends.iter().copied().map(TXInput::new).collect(),
            vout: outputs,
            locktime: 0,
            kind: TransactionKind::Regular,
        }
    }

    /// Pay `amount` to `to` from the wallet's unspent outputs, returning change to the
    /// wallet and leaving `fee` unclaimed.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &LockingKey,
        amount: u64,
        fee: u64,
        blockchain: &Blockchain,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Wallet(
                "Amount must be positive".to_string(),
            ));
        }
        let total_needed = amount
            .checked_add(fee)
            .ok_or_else(|| BlockchainError::Wallet("Amount plus fee overflows".to_string()))?;

        let from = wallet.locking_key();
        let mut accumulated = 0u64;
        let mut spends = vec![];
        for (txid, index, value) in blockchain.utxo_for(&from)? {
            if accumulated >= total_needed {
                break;
            }
            accumulated += value;
            spends.push(OutPoint::new(txid, index));
        }

        if accumulated < total_needed {
            return Err(BlockchainError::Wallet(format!(
                "Insufficient funds: required {total_needed}, available {accumulated}"
            )));
        }

        let mut outputs = vec![TXOutput::with_key(amount, *to)];
        let change = accumulated - total_needed;
        if change > 0 {
            outputs.push(TXOutput::with_key(change, from));
        }

        let mut tx = Transaction::new_regular(&spends, outputs);
        wallet.sign(&mut tx)?;
        Ok(tx)
    }

    // Inputs stripped of their authorization; this is what the id and signatures cover
    fn trimmed_copy(&self) -> Transaction {
        Transaction {
            version: self.version,
            vin: self.vin.iter().map(TXInput::unsigned).collect(),
            vout: self.vout.clone(),
            locktime: self.locktime,
            kind: self.kind,
        }
    }

    /// Content hash of the unsigned form
    pub fn id(&self) -> Hash256 {
        match serialize(&self.trimmed_copy()) {
            Ok(bytes) => sha256_hash(&bytes),
            Err(e) => {
                log::error!("Transaction serialization failed during id calculation: {e}");
                sha256_hash(b"transaction_serialization_error")
            }
        }
    }

    pub fn id_hex(&self) -> String {
        HEXLOWER.encode(&self.id())
    }

    /// Attach `public_key` and a signature by `pkcs8` over the id to every input.
    pub fn sign(&mut self, pkcs8: &[u8], public_key: &[u8]) -> Result<()> {
        if self.is_coinbase() {
            return Err(BlockchainError::Crypto(
                "Coinbase transactions are not signed".to_string(),
            ));
        }
        let id = self.id();
        let signature = ecdsa_p256_sha256_sign_digest(pkcs8, &id)?;
        for vin in self.vin.iter_mut() {
            vin.public_key = public_key.to_vec();
            vin.signature = signature.clone();
        }
        Ok(())
    }

    /// Whether input `idx` proves the right to spend an output locked to `locking_key`.
    pub fn verify_input(&self, idx: usize, locking_key: &LockingKey) -> bool {
        let Some(vin) = self.vin.get(idx) else {
            return false;
        };
        if vin.public_key.is_empty() || vin.signature.is_empty() {
            return false;
        }
        if public_key_to_locking_key(&vin.public_key) != *locking_key {
            return false;
        }
        ecdsa_p256_sha256_sign_verify(&vin.public_key, &vin.signature, &self.id())
    }

    pub fn is_coinbase(&self) -> bool {
        self.kind == TransactionKind::Coinbase
    }

    /// Sum of output values, `None` on overflow
    pub fn output_value(&self) -> Option<u64> {
        self.vout
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.get_value()))
    }

    pub fn get_version(&self) -> u32 {
        self.version
    }

    pub fn get_kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn get_locktime(&self) -> u64 {
        self.locktime
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        self.serialize().map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }

    #[cfg(test)]
    pub(crate) fn vout_mut(&mut self) -> &mut Vec<TXOutput> {
        &mut self.vout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funding() -> OutPoint {
        OutPoint::new([7u8; 32], 0)
    }

    #[test]
    fn test_coinbase_shape() {
        let tx = Transaction::new_coinbase_tx([1u8; 20], 5_000, 3);
        assert!(tx.is_coinbase());
        assert!(tx.get_vin().is_empty());
        assert_eq!(tx.output_value(), Some(5_000));
        assert_eq!(tx.get_locktime(), 3);
    }

    #[test]
    fn test_coinbase_ids_differ_by_height() {
        let a = Transaction::new_coinbase_tx([1u8; 20], 5_000, 1);
        let b = Transaction::new_coinbase_tx([1u8; 20], 5_000, 2);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_id_ignores_signatures() {
        let wallet = Wallet::new().unwrap();
        let mut tx =
            Transaction::new_regular(&[funding()], vec![TXOutput::with_key(10, [2u8; 20])]);
        let unsigned_id = tx.id();
        wallet.sign(&mut tx).unwrap();
        assert_eq!(tx.id(), unsigned_id);
        assert!(!tx.get_vin()[0].get_signature().is_empty());
    }

    #[test]
    fn test_signature_verifies_against_owner_key() {
        let wallet = Wallet::new().unwrap();
        let other = Wallet::new().unwrap();
        let mut tx =
            Transaction::new_regular(&[funding()], vec![TXOutput::with_key(10, [2u8; 20])]);
        wallet.sign(&mut tx).unwrap();

        assert!(tx.verify_input(0, &wallet.locking_key()));
        assert!(!tx.verify_input(0, &other.locking_key()));
        assert!(!tx.verify_input(1, &wallet.locking_key()));
    }

    #[test]
    fn test_tampered_output_breaks_signature() {
        let wallet = Wallet::new().unwrap();
        let mut tx =
            Transaction::new_regular(&[funding()], vec![TXOutput::with_key(10, [2u8; 20])]);
        wallet.sign(&mut tx).unwrap();
        tx.vout_mut()[0] = TXOutput::with_key(10_000, [2u8; 20]);
        assert!(!tx.verify_input(0, &wallet.locking_key()));
    }

    #[test]
    fn test_unsigned_input_fails_verification() {
        let tx = Transaction::new_regular(&[funding()], vec![TXOutput::with_key(10, [2u8; 20])]);
        assert!(!tx.verify_input(0, &[0u8; 20]));
    }

    #[test]
    fn test_output_value_overflow() {
        let tx = Transaction::new_regular(
            &[funding()],
            vec![
                TXOutput::with_key(u64::MAX, [2u8; 20]),
                TXOutput::with_key(1, [2u8; 20]),
            ],
        );
        assert_eq!(tx.output_value(), None);
    }

    #[test]
    fn test_serialization_preserves_every_field() {
        let wallet = Wallet::new().unwrap();
        let mut tx = Transaction::new_regular(
            &[funding(), OutPoint::new([9u8; 32], 4)],
            vec![TXOutput::with_key(u64::MAX - 1, [3u8; 20])],
        );
        wallet.sign(&mut tx).unwrap();
        let decoded = Transaction::deserialize(&tx.serialize().unwrap()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.id(), tx.id());
    }
}

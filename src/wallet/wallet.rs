use crate::core::{LockingKey, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{base58_decode, base58_encode, ripemd160_digest, sha256_digest};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};

const VERSION: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;
const LOCKING_KEY_LEN: usize = 20;

/// An ECDSA P-256 key pair
#[derive(Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = crate::utils::new_key_pair()?;
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| {
                    BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
                })?;
        let public_key = key_pair.public_key().as_ref().to_vec();
        Ok(Wallet { pkcs8, public_key })
    }

    pub fn get_address(&self) -> String {
        convert_address(&self.locking_key())
    }

    pub fn locking_key(&self) -> LockingKey {
        public_key_to_locking_key(&self.public_key)
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    /// Authorize every input of `tx` with this key.
    pub fn sign(&self, tx: &mut Transaction) -> Result<()> {
        tx.sign(&self.pkcs8, &self.public_key)
    }
}

/// SHA-256 then RIPEMD-160 of a public key; the value outputs are locked to.
pub fn public_key_to_locking_key(public_key: &[u8]) -> LockingKey {
    let digest = ripemd160_digest(&sha256_digest(public_key));
    let mut locking_key = [0u8; LOCKING_KEY_LEN];
    locking_key.copy_from_slice(&digest[..LOCKING_KEY_LEN]);
    locking_key
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let first_sha = sha256_digest(payload);
    let second_sha = sha256_digest(first_sha.as_slice());
    second_sha[0..ADDRESS_CHECK_SUM_LEN].to_vec()
}

pub fn validate_address(address: &str) -> bool {
    address_to_locking_key(address).is_ok()
}

/// Decode a base58check address into the locking key it carries.
pub fn address_to_locking_key(address: &str) -> Result<LockingKey> {
    let payload = base58_decode(address)?;
    if payload.len() != 1 + LOCKING_KEY_LEN + ADDRESS_CHECK_SUM_LEN {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: wrong length"
        )));
    }

    let (body, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if body[0] != VERSION || checksum(body) != actual_checksum {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: bad version or checksum"
        )));
    }

    let mut locking_key = [0u8; LOCKING_KEY_LEN];
    locking_key.copy_from_slice(&body[1..]);
    Ok(locking_key)
}

/// version + locking key + checksum, base58 encoded
pub fn convert_address(locking_key: &LockingKey) -> String {
    let mut payload: Vec<u8> = vec![VERSION];
    payload.extend(locking_key);
    let checksum = checksum(payload.as_slice());
    payload.extend(checksum.as_slice());
    base58_encode(payload.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let wallet = Wallet::new().unwrap();
        let address = wallet.get_address();
        assert!(validate_address(&address));
        assert_eq!(address_to_locking_key(&address).unwrap(), wallet.locking_key());
    }

    #[test]
    fn test_corrupted_address_rejected() {
        let address = Wallet::new().unwrap().get_address();
        let mut chars: Vec<char> = address.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let corrupted: String = chars.into_iter().collect();
        assert!(!validate_address(&corrupted));
        assert!(!validate_address("not-base58-0OIl"));
        assert!(!validate_address(""));
    }

    #[test]
    fn test_locking_key_is_stable() {
        let wallet = Wallet::new().unwrap();
        assert_eq!(
            public_key_to_locking_key(wallet.get_public_key()),
            wallet.locking_key()
        );
        assert_ne!(wallet.locking_key(), Wallet::new().unwrap().locking_key());
    }
}

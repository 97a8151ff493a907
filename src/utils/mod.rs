//! Utility functions and helpers
//!
//! Hashing, signatures, base58 and bincode helpers used throughout the node.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, double_sha256,
    ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, new_key_pair,
    ripemd160_digest, sha256_digest, sha256_hash,
};

pub use serialization::{deserialize, deserialize_exact, serialize};

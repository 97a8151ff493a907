//! Data storage and persistence
//!
//! The UTXO set representation and its sled key layout, and the pending transaction pool.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::MemoryPool;
pub use utxo_set::UTXOSet;

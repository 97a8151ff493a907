//! Configuration management
//!
//! Consensus parameters, node settings and miner scheduling knobs, loaded from TOML.

pub mod settings;

pub use settings::{ChainConfig, Config, MiningConfig, NodeConfig};

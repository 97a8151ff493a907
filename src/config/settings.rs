use crate::core::monetary::SATOSHIS_PER_COIN;
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:8333";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";

/// Consensus parameters. Every node on a network must agree on these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Coinbase reward at height 0, in base units
    pub initial_reward: u64,
    /// Blocks between reward halvings
    pub halving_interval: u64,
    /// Halving count at which the reward is floored to zero
    pub max_halvings: u32,
    /// Hard cap on total issuance, in base units
    pub max_supply: u64,
    /// Blocks between difficulty retargets
    pub adjustment_interval: u64,
    /// Desired seconds between blocks
    pub target_block_time: u64,
    /// Largest factor a single retarget may move the target by
    pub retarget_max_factor: u64,
    /// Leading zero bits required of the genesis target
    pub initial_difficulty_bits: u32,
    /// Leading zero bits of the easiest target ever allowed
    pub pow_limit_bits: u32,
    /// Serialized block size limit in bytes
    pub max_block_size: usize,
    pub max_block_transactions: usize,
    /// Genesis header timestamp (Unix milliseconds)
    pub genesis_timestamp: i64,
    /// Address paid by the genesis coinbase; unset burns it
    pub genesis_address: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_reward: 500 * SATOSHIS_PER_COIN,
            halving_interval: 1_050_000,
            max_halvings: 32,
            max_supply: 210_000_000 * SATOSHIS_PER_COIN,
            adjustment_interval: 2027,
            target_block_time: 120,
            retarget_max_factor: 4,
            initial_difficulty_bits: 16,
            pow_limit_bits: 8,
            max_block_size: 1_000_000,
            max_block_transactions: 10_000,
            genesis_timestamp: 1_700_000_000_000,
            genesis_address: None,
        }
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.halving_interval == 0 || self.adjustment_interval == 0 {
            return Err(BlockchainError::Config(
                "halving_interval and adjustment_interval must be positive".to_string(),
            ));
        }
        if self.retarget_max_factor == 0 {
            return Err(BlockchainError::Config(
                "retarget_max_factor must be at least 1".to_string(),
            ));
        }
        if self.pow_limit_bits == 0
            || self.pow_limit_bits > self.initial_difficulty_bits
            || self.initial_difficulty_bits > 255
        {
            return Err(BlockchainError::Config(format!(
                "difficulty bits out of range: pow_limit_bits={}, initial_difficulty_bits={}",
                self.pow_limit_bits, self.initial_difficulty_bits
            )));
        }
        Ok(())
    }
}

/// Local node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    /// Peers dialed on startup
    pub peers: Vec<String>,
    pub max_open_connections: usize,
    /// Rejected blocks tolerated before a peer leaves the active set
    pub max_peer_strikes: u32,
    pub mining_enabled: bool,
    /// Connect and write timeout for outbound messages
    pub peer_timeout_millis: u64,
    /// Read timeout for inbound connections
    pub read_timeout_secs: u64,
    /// Seconds between Hello rounds to all known peers
    pub resync_interval_secs: u64,
    /// Pending transactions held before new submissions are dropped
    pub max_mempool_transactions: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_NODE_ADDR.to_string(),
            data_dir: PathBuf::from("./cpytro_data"),
            peers: vec![],
            max_open_connections: 8,
            max_peer_strikes: 3,
            mining_enabled: true,
            peer_timeout_millis: 5000,
            read_timeout_secs: 60,
            resync_interval_secs: 60,
            max_mempool_transactions: 5_000,
        }
    }
}

impl NodeConfig {
    /// Port part of `listen_addr`, announced to peers for dial-back.
    pub fn listening_port(&self) -> Result<u16> {
        self.listen_addr
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| {
                BlockchainError::Config(format!("Invalid listen address: {}", self.listen_addr))
            })
    }
}

/// Miner scheduling knobs. None of these affect block validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Address credited by locally mined coinbases
    pub miner_address: Option<String>,
    /// Nonce attempts between stop/stale/bound checks
    pub check_interval: u64,
    /// Nonce attempts before a candidate is abandoned
    pub max_iterations: u64,
    /// Wall-clock seconds before a candidate is abandoned
    pub max_search_secs: u64,
    /// Pause at every check; the energy-saving throttle
    pub throttle_millis: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            miner_address: None,
            check_interval: 4096,
            max_iterations: 50_000_000,
            max_search_secs: 60,
            throttle_millis: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chain: ChainConfig,
    pub node: NodeConfig,
    pub mining: MiningConfig,
}

impl Config {
    /// Load a TOML config file, falling back to defaults when no path is given.
    /// `NODE_ADDRESS` in the environment overrides the listen address.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml(&text)?
            }
            None => Config::default(),
        };

        if let Ok(addr) = env::var(NODE_ADDRESS_KEY) {
            config.node.listen_addr = addr;
        }
        config.chain.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.chain.validate()?;
        Ok(config)
    }

    /// Ledger database directory, one per listening port so several nodes share a machine.
    pub fn ledger_path(&self) -> Result<PathBuf> {
        let port = self.node.listening_port()?;
        Ok(self.node.data_dir.join(format!("node_{port}")))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.node.data_dir.join(crate::wallet::WALLET_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_network_parameters() {
        let config = Config::default();
        assert_eq!(config.chain.initial_reward, 500 * SATOSHIS_PER_COIN);
        assert_eq!(config.chain.halving_interval, 1_050_000);
        assert_eq!(config.chain.adjustment_interval, 2027);
        assert_eq!(config.chain.target_block_time, 120);
        assert_eq!(config.chain.max_block_size, 1_000_000);
        assert!(config.node.mining_enabled);
        assert!(config.chain.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [chain]
            halving_interval = 10
            initial_difficulty_bits = 4
            pow_limit_bits = 1

            [node]
            listen_addr = "127.0.0.1:9100"
            peers = ["127.0.0.1:9101"]
            "#,
        )
        .unwrap();

        assert_eq!(config.chain.halving_interval, 10);
        assert_eq!(config.chain.adjustment_interval, 2027);
        assert_eq!(config.node.listening_port().unwrap(), 9100);
        assert_eq!(config.node.peers, vec!["127.0.0.1:9101".to_string()]);
        assert_eq!(config.mining.check_interval, 4096);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml("[chain]\nhalving_interval = 0\n").unwrap_err();
        assert!(matches!(err, BlockchainError::Config(_)));

        let err = Config::from_toml("[chain]\npow_limit_bits = 20\ninitial_difficulty_bits = 10\n")
            .unwrap_err();
        assert!(matches!(err, BlockchainError::Config(_)));
    }

    #[test]
    fn test_ledger_path_is_per_port() {
        let mut config = Config::default();
        config.node.listen_addr = "127.0.0.1:2001".to_string();
        assert!(config.ledger_path().unwrap().ends_with("node_2001"));
    }
}

//! Monetary units and the coinbase reward schedule
//!
//! Values are integer base units; 1 coin = 100 000 000 base units. The reward halves every
//! `halving_interval` blocks, drops to zero after `max_halvings` halvings, and is clipped so
//! that total issuance never passes `max_supply`.

use crate::config::ChainConfig;

/// Number of base units in one coin
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Smallest fee a node relays or admits to its mempool (0.0001 coins)
pub const MIN_TRANSACTION_FEE: u64 = 10_000;

/// Reward scheduled by halvings alone, ignoring the supply cap.
fn scheduled_reward(height: u64, config: &ChainConfig) -> u64 {
    let era = height / config.halving_interval;
    if era >= u64::from(config.max_halvings) || era >= 64 {
        return 0;
    }
    config.initial_reward >> era
}

/// Issuance of heights `0..height` before the supply cap is applied.
fn uncapped_issuance(height: u64, config: &ChainConfig) -> u128 {
    let interval = config.halving_interval;
    let last_era = (height / interval).min(u64::from(config.max_halvings)).min(64);
    let mut total: u128 = 0;

    for era in 0..=last_era {
        let era_start = era * interval;
        if era_start >= height {
            break;
        }
        let blocks_in_era = (height - era_start).min(interval);
        total += u128::from(scheduled_reward(era_start, config)) * u128::from(blocks_in_era);
    }
    total
}

/// Total base units issued by coinbases at heights `0..height`.
pub fn issued_before(height: u64, config: &ChainConfig) -> u64 {
    uncapped_issuance(height, config).min(u128::from(config.max_supply)) as u64
}

/// Coinbase value for the block at `height`.
pub fn reward(height: u64, config: &ChainConfig) -> u64 {
    let remaining = config
        .max_supply
        .saturating_sub(issued_before(height, config));
    scheduled_reward(height, config).min(remaining)
}

/// Render base units as a fixed-point coin amount
pub fn format_coins(value: u64) -> String {
    format!(
        "{}.{:08} CPT",
        value / SATOSHIS_PER_COIN,
        value % SATOSHIS_PER_COIN
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_schedule() -> ChainConfig {
        ChainConfig {
            initial_reward: 1_000,
            halving_interval: 10,
            max_halvings: 4,
            max_supply: u64::MAX,
            ..ChainConfig::default()
        }
    }

    #[test]
    fn test_reward_halves_at_each_boundary() {
        let config = small_schedule();
        assert_eq!(reward(0, &config), 1_000);
        assert_eq!(reward(9, &config), 1_000);
        assert_eq!(reward(10, &config), 500);
        assert_eq!(reward(19, &config), 500);
        assert_eq!(reward(20, &config), 250);
        assert_eq!(reward(30, &config), 125);
    }

    #[test]
    fn test_reward_reaches_zero_at_cutoff() {
        let config = small_schedule();
        assert_eq!(reward(39, &config), 125);
        assert_eq!(reward(40, &config), 0);
        assert_eq!(reward(10_000, &config), 0);
    }

    #[test]
    fn test_reward_is_non_increasing() {
        let config = ChainConfig {
            max_supply: 12_000,
            ..small_schedule()
        };
        let mut previous = u64::MAX;
        for height in 0..100 {
            let current = reward(height, &config);
            assert!(current <= previous, "reward rose at height {height}");
            previous = current;
        }
    }

    #[test]
    fn test_supply_cap_is_never_exceeded() {
        let config = ChainConfig {
            max_supply: 12_345,
            ..small_schedule()
        };
        let total: u64 = (0..100).map(|h| reward(h, &config)).sum();
        assert_eq!(total, 12_345);
        assert_eq!(issued_before(100, &config), 12_345);
    }

    #[test]
    fn test_issued_before_matches_running_sum() {
        let config = small_schedule();
        let mut running = 0;
        for height in 0..60 {
            assert_eq!(issued_before(height, &config), running);
            running += reward(height, &config);
        }
    }

    #[test]
    fn test_default_schedule_respects_max_supply() {
        let config = ChainConfig::default();
        assert!(issued_before(u64::MAX / 2, &config) <= config.max_supply);
        assert_eq!(reward(0, &config), 500 * SATOSHIS_PER_COIN);
    }

    #[test]
    fn test_format_coins() {
        assert_eq!(format_coins(SATOSHIS_PER_COIN), "1.00000000 CPT");
        assert_eq!(format_coins(MIN_TRANSACTION_FEE), "0.00010000 CPT");
    }
}

use crate::config::ChainConfig;
use crate::core::Hash256;
use log::info;
use num_bigint::BigUint;

/// Difficulty retargeting over 256-bit targets
///
/// A target is the largest header hash (big-endian integer) accepted as proof of work.
/// It is recomputed every `adjustment_interval` blocks from how long the last window
/// took, and never moves by more than `retarget_max_factor` in one step.
pub struct DifficultyAdjustment;

impl DifficultyAdjustment {
    /// `2^(256 - bits)`: a target requiring roughly `bits` leading zero bits.
    pub fn target_from_bits(bits: u32) -> Hash256 {
        let bits = bits.clamp(1, 255);
        Self::to_target(&(BigUint::from(1u8) << (256 - bits) as usize))
    }

    pub fn initial_target(config: &ChainConfig) -> Hash256 {
        Self::target_from_bits(config.initial_difficulty_bits)
    }

    /// The easiest target a retarget may produce
    pub fn pow_limit(config: &ChainConfig) -> Hash256 {
        Self::target_from_bits(config.pow_limit_bits)
    }

    pub fn is_adjustment_height(height: u64, config: &ChainConfig) -> bool {
        height != 0 && height % config.adjustment_interval == 0
    }

    /// Target for the block at `height`.
    ///
    /// `recent_timestamps` are the timestamps (ms) of the blocks in the closing window,
    /// oldest first. Off-boundary heights keep `current_target`.
    pub fn next_target(
        height: u64,
        recent_timestamps: &[i64],
        current_target: &Hash256,
        config: &ChainConfig,
    ) -> Hash256 {
        if !Self::is_adjustment_height(height, config) || recent_timestamps.len() < 2 {
            return *current_target;
        }

        let first = recent_timestamps[0];
        let last = recent_timestamps[recent_timestamps.len() - 1];
        let expected = config
            .adjustment_interval
            .saturating_mul(config.target_block_time)
            .saturating_mul(1000)
            .max(1);
        let factor = config.retarget_max_factor.max(1);
        let lower = (expected / factor).max(1);
        let upper = expected.saturating_mul(factor);
        let actual = (last.saturating_sub(first).max(0) as u64).clamp(lower, upper);

        let scaled = Self::to_biguint(current_target) * BigUint::from(actual)
            / BigUint::from(expected);
        let limit = Self::to_biguint(&Self::pow_limit(config));
        let new_target = Self::to_target(&scaled.clamp(BigUint::from(1u8), limit));

        info!(
            "Retarget at height {height}: window took {actual}ms against {expected}ms, difficulty {} -> {}",
            Self::difficulty_bits(current_target),
            Self::difficulty_bits(&new_target)
        );
        new_target
    }

    /// Leading zero bits of a target, a human-readable difficulty figure
    pub fn difficulty_bits(target: &Hash256) -> u32 {
        let mut bits = 0;
        for byte in target {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    pub fn to_biguint(hash: &Hash256) -> BigUint {
        BigUint::from_bytes_be(hash)
    }

    /// Big-endian 32-byte form; values past 2^256 - 1 saturate.
    pub fn to_target(value: &BigUint) -> Hash256 {
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return [0xff; 32];
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        out
    }
}

use crate::core::{BlockHeader, Hash256};
use crate::utils::sha256_hash;
use num_bigint::BigUint;
use std::thread;
use std::time::{Duration, Instant};

/// Bounds on a single nonce search. None of these affect block validity.
#[derive(Debug, Clone)]
pub struct SearchLimits {
    /// Nonce attempts between interrupt/bound checks
    pub check_interval: u64,
    pub max_iterations: u64,
    pub max_duration: Duration,
    /// Pause taken at every check
    pub throttle: Duration,
}

impl Default for SearchLimits {
    fn default() -> Self {
        SearchLimits {
            check_interval: 4096,
            max_iterations: u64::MAX,
            max_duration: Duration::MAX,
            throttle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found { nonce: u64, hash: Hash256, attempts: u64 },
    /// The interrupt callback asked to stop
    Interrupted { attempts: u64 },
    /// The iteration or wall-clock bound was hit
    Exhausted { attempts: u64 },
}

impl SearchOutcome {
    pub fn attempts(&self) -> u64 {
        match self {
            SearchOutcome::Found { attempts, .. }
            | SearchOutcome::Interrupted { attempts }
            | SearchOutcome::Exhausted { attempts } => *attempts,
        }
    }
}

pub struct ProofOfWork {
    header: BlockHeader,
    target: BigUint,
}

impl ProofOfWork {
    pub fn new_proof_of_work(header: BlockHeader) -> ProofOfWork {
        let target = BigUint::from_bytes_be(header.get_target());
        ProofOfWork { header, target }
    }

    /// Hash read as a big-endian integer is strictly below the target
    pub fn meets_target(hash: &Hash256, target: &Hash256) -> bool {
        BigUint::from_bytes_be(hash) < BigUint::from_bytes_be(target)
    }

    pub fn validate(header: &BlockHeader) -> bool {
        Self::meets_target(&header.hash(), header.get_target())
    }

    /// Search nonces from 0 until one meets the target, without bounds.
    pub fn run(&self) -> (u64, Hash256) {
        let prefix = self.header.pow_prefix();
        let mut data = prefix.clone();
        let mut nonce = 0u64;
        loop {
            let hash = Self::hash_with_nonce(&mut data, prefix.len(), nonce);
            if BigUint::from_bytes_be(&hash) < self.target {
                return (nonce, hash);
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Bounded, interruptible search. `interrupt` is polled every `check_interval`
    /// attempts and stops the search when it returns true.
    pub fn search<F>(&self, limits: &SearchLimits, mut interrupt: F) -> SearchOutcome
    where
        F: FnMut() -> bool,
    {
        let check_interval = limits.check_interval.max(1);
        let started = Instant::now();
        let prefix = self.header.pow_prefix();
        let mut data = prefix.clone();
        let mut attempts = 0u64;

        for nonce in 0..=u64::MAX {
            if attempts > 0 && attempts % check_interval == 0 {
                if interrupt() {
                    return SearchOutcome::Interrupted { attempts };
                }
                if attempts >= limits.max_iterations || started.elapsed() >= limits.max_duration
                {
                    return SearchOutcome::Exhausted { attempts };
                }
                if !limits.throttle.is_zero() {
                    thread::sleep(limits.throttle);
                }
            }

            let hash = Self::hash_with_nonce(&mut data, prefix.len(), nonce);
            attempts += 1;
            if BigUint::from_bytes_be(&hash) < self.target {
                return SearchOutcome::Found {
                    nonce,
                    hash,
                    attempts,
                };
            }
        }
        SearchOutcome::Exhausted { attempts }
    }

    // The nonce is the last field of the header layout, so only its bytes change per attempt
    fn hash_with_nonce(data: &mut Vec<u8>, prefix_len: usize, nonce: u64) -> Hash256 {
        data.truncate(prefix_len);
        data.extend(nonce.to_be_bytes());
        sha256_hash(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DifficultyAdjustment;

    fn header(bits: u32) -> BlockHeader {
        BlockHeader::new(
            [0u8; 32],
            [3u8; 32],
            1_700_000_000_000,
            DifficultyAdjustment::target_from_bits(bits),
        )
    }

    #[test]
    fn test_meets_target_is_strict() {
        let target = [0x10u8; 32];
        assert!(ProofOfWork::meets_target(&[0x0fu8; 32], &target));
        assert!(!ProofOfWork::meets_target(&target, &target));
        assert!(!ProofOfWork::meets_target(&[0x11u8; 32], &target));
    }

    #[test]
    fn test_run_finds_valid_nonce() {
        let mut header = header(8);
        let (nonce, hash) = ProofOfWork::new_proof_of_work(header.clone()).run();
        header.set_nonce(nonce);
        assert_eq!(header.hash(), hash);
        assert!(ProofOfWork::validate(&header));
    }

    #[test]
    fn test_search_matches_run() {
        let header = header(6);
        let outcome =
            ProofOfWork::new_proof_of_work(header.clone()).search(&SearchLimits::default(), || {
                false
            });
        let (nonce, hash) = ProofOfWork::new_proof_of_work(header).run();
        match outcome {
            SearchOutcome::Found {
                nonce: found,
                hash: found_hash,
                attempts,
            } => {
                assert_eq!(found, nonce);
                assert_eq!(found_hash, hash);
                assert_eq!(attempts, nonce + 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_search_stops_at_iteration_bound() {
        // 255 leading zero bits is out of reach
        let limits = SearchLimits {
            check_interval: 100,
            max_iterations: 1_000,
            ..SearchLimits::default()
        };
        let outcome = ProofOfWork::new_proof_of_work(header(255)).search(&limits, || false);
        assert_eq!(outcome, SearchOutcome::Exhausted { attempts: 1_000 });
    }

    #[test]
    fn test_search_honours_interrupt() {
        let limits = SearchLimits {
            check_interval: 10,
            ..SearchLimits::default()
        };
        let mut polls = 0;
        let outcome = ProofOfWork::new_proof_of_work(header(255)).search(&limits, || {
            polls += 1;
            polls == 3
        });
        assert_eq!(outcome, SearchOutcome::Interrupted { attempts: 30 });
    }

    #[test]
    fn test_tampered_header_fails_validation() {
        let mut header = header(8);
        let (nonce, _) = ProofOfWork::new_proof_of_work(header.clone()).run();
        header.set_nonce(nonce);
        // Raising the difficulty far past what was solved
        let mut harder = header.clone();
        harder.set_target(DifficultyAdjustment::target_from_bits(200));
        assert!(!ProofOfWork::validate(&harder));
    }
}

//! Shared fixtures for unit tests: throwaway ledgers with cheap proof of work, node and
//! miner settings, and a broadcaster that records what it was sent.

pub mod test_utils;

pub use test_utils::*;

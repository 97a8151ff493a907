//! Error handling for the ledger node
//!
//! `BlockchainError` covers every failure the node can hit. Consensus rejections carry a
//! `RejectReason` so callers can tell "this block breaks rule N" apart from storage or
//! network trouble.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error types for ledger, mining and networking operations
#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Database-related errors (fatal: the ledger view can no longer be trusted)
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Peer protocol errors: malformed frames, timeouts, disconnects
    Network(String),
    /// Wallet operation errors
    Wallet(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Invalid address format
    InvalidAddress(String),
    /// A block or transaction failed a validation rule; nothing was applied
    Rejected(RejectReason),
}

impl BlockchainError {
    /// Storage failures must halt mining and commits instead of being swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BlockchainError::Database(_) | BlockchainError::Io(_))
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            BlockchainError::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Wallet(msg) => write!(f, "Wallet error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::Rejected(reason) => {
                write!(f, "Validation rejected ({}): {reason}", reason.rule())
            }
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<RejectReason> for BlockchainError {
    fn from(reason: RejectReason) -> Self {
        BlockchainError::Rejected(reason)
    }
}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}

/// The consensus rule a rejected block or transaction broke
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    PreviousHashMismatch,
    HeightMismatch { expected: u64, actual: u64 },
    InsufficientProofOfWork,
    UnexpectedTarget,
    TimestampTooOld { parent: i64, actual: i64 },
    TimestampTooFarAhead { latest: i64, actual: i64 },
    MerkleRootMismatch,
    EmptyBlock,
    MissingCoinbase,
    MisplacedCoinbase { index: usize },
    MalformedCoinbase,
    CoinbaseValueMismatch { expected: u64, actual: u64 },
    DuplicateTransaction { txid: String },
    MissingInputs { txid: String },
    UnknownOutput { txid: String, index: u32 },
    DoubleSpend { txid: String, index: u32 },
    InvalidSignature { txid: String, input: usize },
    OutputsExceedInputs { txid: String, inputs: u64, outputs: u64 },
    ValueOverflow,
    TooManyTransactions { count: usize, max: usize },
    BlockTooLarge { size: usize, max: usize },
}

impl RejectReason {
    /// Stable snake_case rule name, used in logs and status reports.
    pub fn rule(&self) -> &'static str {
        match self {
            RejectReason::PreviousHashMismatch => "previous_hash_mismatch",
            RejectReason::HeightMismatch { .. } => "height_mismatch",
            RejectReason::InsufficientProofOfWork => "insufficient_proof_of_work",
            RejectReason::UnexpectedTarget => "unexpected_target",
            RejectReason::TimestampTooOld { .. } => "timestamp_too_old",
            RejectReason::TimestampTooFarAhead { .. } => "timestamp_too_far_ahead",
            RejectReason::MerkleRootMismatch => "merkle_root_mismatch",
            RejectReason::EmptyBlock => "empty_block",
            RejectReason::MissingCoinbase => "missing_coinbase",
            RejectReason::MisplacedCoinbase { .. } => "misplaced_coinbase",
            RejectReason::MalformedCoinbase => "malformed_coinbase",
            RejectReason::CoinbaseValueMismatch { .. } => "coinbase_value_mismatch",
            RejectReason::DuplicateTransaction { .. } => "duplicate_transaction",
            RejectReason::MissingInputs { .. } => "missing_inputs",
            RejectReason::UnknownOutput { .. } => "unknown_output",
            RejectReason::DoubleSpend { .. } => "double_spend",
            RejectReason::InvalidSignature { .. } => "invalid_signature",
            RejectReason::OutputsExceedInputs { .. } => "outputs_exceed_inputs",
            RejectReason::ValueOverflow => "value_overflow",
            RejectReason::TooManyTransactions { .. } => "too_many_transactions",
            RejectReason::BlockTooLarge { .. } => "block_too_large",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PreviousHashMismatch => {
                write!(f, "previous hash does not match the current tip")
            }
            RejectReason::HeightMismatch { expected, actual } => {
                write!(f, "expected height {expected}, got {actual}")
            }
            RejectReason::InsufficientProofOfWork => write!(f, "header hash is not below target"),
            RejectReason::UnexpectedTarget => {
                write!(f, "target does not match the difficulty schedule")
            }
            RejectReason::TimestampTooOld { parent, actual } => {
                write!(f, "timestamp {actual} is earlier than parent timestamp {parent}")
            }
            RejectReason::TimestampTooFarAhead { latest, actual } => {
                write!(f, "timestamp {actual} is past the allowed {latest}")
            }
            RejectReason::MerkleRootMismatch => write!(f, "merkle root does not match transactions"),
            RejectReason::EmptyBlock => write!(f, "block has no transactions"),
            RejectReason::MissingCoinbase => write!(f, "first transaction is not a coinbase"),
            RejectReason::MisplacedCoinbase { index } => {
                write!(f, "coinbase transaction at position {index}")
            }
            RejectReason::MalformedCoinbase => {
                write!(f, "coinbase must have no inputs and carry the block height")
            }
            RejectReason::CoinbaseValueMismatch { expected, actual } => {
                write!(f, "coinbase pays {actual}, schedule allows {expected}")
            }
            RejectReason::DuplicateTransaction { txid } => {
                write!(f, "transaction {txid} is already in the ledger")
            }
            RejectReason::MissingInputs { txid } => {
                write!(f, "regular transaction {txid} has no inputs")
            }
            RejectReason::UnknownOutput { txid, index } => {
                write!(f, "input references missing or spent output {txid}:{index}")
            }
            RejectReason::DoubleSpend { txid, index } => {
                write!(f, "output {txid}:{index} spent twice in one block")
            }
            RejectReason::InvalidSignature { txid, input } => {
                write!(f, "input {input} of transaction {txid} is not authorized")
            }
            RejectReason::OutputsExceedInputs {
                txid,
                inputs,
                outputs,
            } => write!(
                f,
                "transaction {txid} spends {outputs} but only has {inputs} available"
            ),
            RejectReason::ValueOverflow => write!(f, "value arithmetic overflow"),
            RejectReason::TooManyTransactions { count, max } => {
                write!(f, "{count} transactions exceeds maximum of {max}")
            }
            RejectReason::BlockTooLarge { size, max } => {
                write!(f, "block size {size} exceeds maximum of {max} bytes")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display_names_rule() {
        let err: BlockchainError = RejectReason::PreviousHashMismatch.into();
        assert!(err.to_string().contains("previous_hash_mismatch"));
        assert_eq!(
            err.reject_reason(),
            Some(&RejectReason::PreviousHashMismatch)
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_storage_errors_are_fatal() {
        assert!(BlockchainError::Database("disk gone".to_string()).is_fatal());
        assert!(!BlockchainError::Network("timeout".to_string()).is_fatal());
    }
}

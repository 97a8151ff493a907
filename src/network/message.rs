//! Wire messages and framing
//!
//! Every message is one frame: a 4-byte big-endian payload length followed by a bincode
//! `Envelope`. Frames over `MAX_FRAME_SIZE`, unknown protocol versions and payloads with
//! trailing bytes are rejected before anything looks at the package.

use crate::core::{Block, Hash256, Transaction};
use crate::error::{BlockchainError, Result};
use crate::miner::MiningStatus;
use crate::utils::{deserialize_exact, serialize};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Peer addresses carried by one `Peers` reply
pub const MAX_PEER_ADDRESSES: usize = 10;
/// Blocks carried by one `Blocks` reply
pub const MAX_BLOCKS_PER_BATCH: usize = 64;
/// Serialized bytes carried by one `Blocks` reply
pub const MAX_BATCH_BYTES: usize = 8 * 1024 * 1024;

pub type NodeId = [u8; 16];

/// Operator view of a node, answered to `GetStatus`
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct NodeStatus {
    pub height: u64,
    pub tip_hash: Hash256,
    pub issued_supply: u64,
    pub mempool_size: u64,
    pub active_peers: u64,
    pub mining: MiningStatus,
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum Package {
    Hello { listening_port: u16, height: u64 },
    Peers { addresses: Vec<String> },
    NewBlock { block: Block },
    GetBlocks { from_height: u64 },
    Blocks { blocks: Vec<Block> },
    Tx { transaction: Transaction },
    GetStatus,
    Status { status: NodeStatus },
}

impl Package {
    pub fn kind(&self) -> &'static str {
        match self {
            Package::Hello { .. } => "hello",
            Package::Peers { .. } => "peers",
            Package::NewBlock { .. } => "new_block",
            Package::GetBlocks { .. } => "get_blocks",
            Package::Blocks { .. } => "blocks",
            Package::Tx { .. } => "tx",
            Package::GetStatus => "get_status",
            Package::Status { .. } => "status",
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Envelope {
    pub protocol_version: u32,
    pub node_id: NodeId,
    /// Port the sender accepts connections on; replies are dialed back to it
    pub listening_port: u16,
    pub package: Package,
}

impl Envelope {
    pub fn new(node_id: NodeId, listening_port: u16, package: Package) -> Envelope {
        Envelope {
            protocol_version: PROTOCOL_VERSION,
            node_id,
            listening_port,
            package,
        }
    }
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serialize(envelope)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(BlockchainError::Network(format!(
            "Frame of {} bytes exceeds maximum of {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend((payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

pub fn decode_payload(payload: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = deserialize_exact::<Envelope, MAX_FRAME_SIZE>(payload)?;
    if envelope.protocol_version != PROTOCOL_VERSION {
        return Err(BlockchainError::Network(format!(
            "Unsupported protocol version {}",
            envelope.protocol_version
        )));
    }
    Ok(envelope)
}

pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    writer.write_all(&encode_frame(envelope)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut length = [0u8; 4];
    match reader.read_exact(&mut length) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BlockchainError::Network(format!("Failed to read frame: {e}"))),
    }

    let length = u32::from_be_bytes(length) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(BlockchainError::Network(format!(
            "Frame of {length} bytes exceeds maximum of {MAX_FRAME_SIZE}"
        )));
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .map_err(|e| BlockchainError::Network(format!("Truncated frame: {e}")))?;
    decode_payload(&payload).map(Some)
}

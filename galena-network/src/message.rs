//! The wire message envelope and the typed payloads it carries.
//!
//! Every message is a JSON object with `status`, `type`, `src_addr`,
//! `dst_addr`, `pub_key` and `data` slots. `status` discriminates whether
//! `type` names a [`ConnectionCode`] or an [`Errno`]; in code the pair is
//! the single tagged [`PacketType`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use galena_core::{Block, Trx};

use crate::addr::Addr;

/// Hex (r, s) signature pair; matches `galena_crypto::SigPair`.
pub type SigPair = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionCode {
    OkMessage = 1,
    NewNeighbor = 2,
    NewNeighborsRequest = 3,
    NewNeighborsFind = 4,
    NotNeighbor = 5,
    MinedBlock = 6,
    ResolveBlockchain = 7,
    GetBlocks = 8,
    SendBlocks = 9,
    AddTrx = 10,
    PingPong = 11,
}

impl ConnectionCode {
    pub fn from_code(code: u8) -> Option<Self> {
        use ConnectionCode::*;
        Some(match code {
            1 => OkMessage,
            2 => NewNeighbor,
            3 => NewNeighborsRequest,
            4 => NewNeighborsFind,
            5 => NotNeighbor,
            6 => MinedBlock,
            7 => ResolveBlockchain,
            8 => GetBlocks,
            9 => SendBlocks,
            10 => AddTrx,
            11 => PingPong,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Errno {
    BadMessage = 1,
    BadTypeMessage = 2,
    BadBlockValidation = 3,
    BadTransaction = 4,
    ObsoleteBlock = 5,
}

impl Errno {
    pub fn from_code(code: u8) -> Option<Self> {
        use Errno::*;
        Some(match code {
            1 => BadMessage,
            2 => BadTypeMessage,
            3 => BadBlockValidation,
            4 => BadTransaction,
            5 => ObsoleteBlock,
            _ => return None,
        })
    }
}

/// The status/type pair as one tagged union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Conn(ConnectionCode),
    Err(Errno),
}

impl PacketType {
    pub fn status(&self) -> bool {
        matches!(self, PacketType::Conn(_))
    }

    pub fn code(&self) -> u8 {
        match self {
            PacketType::Conn(c) => *c as u8,
            PacketType::Err(e) => *e as u8,
        }
    }

    fn from_wire(status: bool, code: u8) -> Result<Self, MessageError> {
        if status {
            ConnectionCode::from_code(code)
                .map(PacketType::Conn)
                .ok_or(MessageError::UnknownType(code))
        } else {
            Errno::from_code(code)
                .map(PacketType::Err)
                .ok_or(MessageError::UnknownType(code))
        }
    }
}

impl From<ConnectionCode> for PacketType {
    fn from(code: ConnectionCode) -> Self {
        PacketType::Conn(code)
    }
}

impl From<Errno> for PacketType {
    fn from(errno: Errno) -> Self {
        PacketType::Err(errno)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message carries no recognizable type code {0}")]
    UnknownType(u8),
    #[error("bad address in envelope: {0}")]
    BadAddr(#[from] crate::addr::AddrError),
}

/// Exact bytes exchanged inside a frame.
#[derive(Serialize, Deserialize)]
struct RawMessage {
    status: bool,
    #[serde(rename = "type")]
    type_code: u8,
    src_addr: String,
    dst_addr: String,
    pub_key: Option<String>,
    #[serde(default)]
    data: Value,
}

/// A wire message. `addr` is the peer on the other side: destination when
/// composing, source after parsing (so a reply can go straight back).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: PacketType,
    pub addr: Addr,
    pub data: Value,
}

impl Message {
    pub fn new(kind: impl Into<PacketType>, addr: Addr) -> Self {
        Self {
            kind: kind.into(),
            addr,
            data: Value::Null,
        }
    }

    pub fn with_data<T: Serialize>(kind: impl Into<PacketType>, addr: Addr, payload: &T) -> Self {
        Self {
            kind: kind.into(),
            addr,
            data: serde_json::to_value(payload).expect("payload serializes"),
        }
    }

    /// Serialize the full envelope with `my_addr` as the source.
    pub fn create_message(&self, my_addr: &Addr) -> String {
        let raw = RawMessage {
            status: self.kind.status(),
            type_code: self.kind.code(),
            src_addr: my_addr.hostname(),
            dst_addr: self.addr.hostname(),
            pub_key: my_addr.pub_key.clone(),
            data: self.data.clone(),
        };
        serde_json::to_string(&raw).expect("envelope serializes")
    }

    /// Parse an envelope. The returned message's `addr` is the sender.
    pub fn from_str(raw: &str) -> Result<Self, MessageError> {
        let raw: RawMessage = serde_json::from_str(raw)?;
        let kind = PacketType::from_wire(raw.status, raw.type_code)?;
        let mut addr = Addr::from_hostname(&raw.src_addr)?;
        addr.pub_key = raw.pub_key;
        Ok(Self {
            kind,
            addr,
            data: raw.data,
        })
    }

    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

// Typed payloads, one per message kind that carries data.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNeighborData {
    pub new_node: String,
    pub new_pub_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborsRequestData {
    pub n_connections: u32,
    pub p2p_nodes: Vec<String>,
    pub passed_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborsFoundData {
    pub n_connections: u32,
    pub p2p_nodes: Vec<String>,
    pub passed_nodes: Vec<String>,
    pub for_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotNeighborData {
    pub node_hostname: String,
    pub pub_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinedBlockData {
    pub block: Block,
}

/// Payload of both RESOLVE_BLOCKCHAIN and SEND_BLOCKS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksData {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetBlocksData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_block: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_index: Option<u64>,
}

impl GetBlocksData {
    pub fn by_hash(hash: impl Into<String>) -> Self {
        Self {
            hash_block: Some(hash.into()),
            first_index: None,
        }
    }

    pub fn by_index(index: u64) -> Self {
        Self {
            hash_block: None,
            first_index: Some(index),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTrxData {
    pub trx: Trx,
    pub signature: SigPair,
    pub public_key: String,
    pub passed_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadBlockData {
    pub block_hash: String,
    pub block_index: u64,
    /// Bits of the failed `BlockValidation`.
    pub validation: u8,
}

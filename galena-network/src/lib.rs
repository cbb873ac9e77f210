//! Peer-to-peer plumbing: peer addresses, the framed wire protocol, the
//! message envelope and the node itself (listener, dialer, neighbor table,
//! gossip helpers).

pub mod addr;
pub mod connection;
pub mod message;
pub mod node;

pub use addr::{Addr, AddrError};
pub use connection::{read_framed, write_framed, Connection};
pub use message::{
    AddTrxData, BadBlockData, BlocksData, ConnectionCode, Errno, GetBlocksData, Message,
    MessageError, MinedBlockData, NeighborsFoundData, NeighborsRequestData, NewNeighborData,
    NotNeighborData, PacketType,
};
pub use node::{MessageHandler, NeighborError, Node, Peer};

use std::time::Duration;

/// Logical connection slots a node maintains. Tunable, but global for a
/// deployment.
pub const MAX_NEIGHBORS: usize = 2;

/// Default timeout for outbound dials and replies.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

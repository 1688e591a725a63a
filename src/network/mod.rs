//! Bitcoin P2P networking
//!
//! Wire messages and framing, single peers with their task queues, and
//! the peer group that keeps a set of them connected and syncing.

pub mod codec;
pub mod connection;
pub mod mempool;
pub mod message;
pub mod peer;
pub mod peer_group;
pub mod tasks;

pub use codec::{MessageCodec, WireError};
pub use connection::{channel_connection, PeerConnection, PeerConnector, RemotePeer, TcpConnector};
pub use mempool::MempoolTransactions;
pub use message::{
    InventoryItem, InventoryType, MerkleBlockMessage, Message, NetworkAddress, NetworkMessageParser,
    RejectMessage, ServiceFlags, VersionMessage, USER_AGENT,
};
pub use peer::{Peer, PeerError, PeerId, TaskEvent};
pub use peer_group::{
    PeerGroup, PeerGroupCommand, PeerGroupConfig, PeerGroupHandle, PeerGroupStatus, PeerStatus,
};
pub use tasks::{CompletedTask, PeerTask, TaskResponse, TaskTimeout};

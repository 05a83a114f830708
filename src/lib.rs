//! peernet - a self-organizing peer-to-peer overlay network
//!
//! Nodes discover each other through entry nodes, maintain a flat routing
//! table keyed by XOR distance between fixed-width identifiers, and
//! exchange point-to-point, relayed, and broadcast messages over
//! best-effort UDP without central coordination.
//!
//! # Modules
//!
//! - [`id`] - Fixed-width identifiers with XOR-distance arithmetic
//! - [`packet`] - Wire packet codec (cursor buffer, field encoding)
//! - [`routing`] - Flat routing table with nearest-peer selection
//! - [`transport`] - Abstract datagram transport and the UDP implementation
//! - [`node`] - The opcode state machine: handshake, join, relay, broadcast
//! - [`error`] - Error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use peernet::{PeerNode, UdpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), peernet::NetError> {
//! let transport = UdpTransport::bind("127.0.0.1".parse().unwrap(), 2000).await?;
//! let node = Arc::new(PeerNode::new(transport, vec!["127.0.0.1:2001".parse().unwrap()])?);
//!
//! let runner = node.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! node.broadcast("hello overlay").await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod id;
pub mod node;
pub mod packet;
pub mod routing;
pub mod transport;

pub use error::NetError;
pub use id::{BroadcastTag, PeerId, Uid, BROADCAST_TAG_LEN, PEER_ID_LEN};
pub use node::{Delivery, Opcode, PeerNode};
pub use packet::Packet;
pub use routing::{Peer, RoutingTable};
pub use transport::{Transport, UdpTransport, MAX_DATAGRAM};

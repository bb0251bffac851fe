//! # Burrow Core
//!
//! Node API for Burrow: reach a peer by public key and get an encrypted
//! datagram stream, whether or not either side sits behind a NAT.
//!
//! ## Connection flow
//!
//! ```text
//!  Client                                             Server
//!  ------                                             ------
//!  FindPeer(target) ---> closest nodes
//!  Pair::open, NAT sampling
//!  Noise IK request ---> relay ---> Router local --->  on_handshake
//!                                                       Pair::open, attempt id
//!  <--------------------------------------------------  Noise reply
//!
//!  server reachable:   dial listen address (+ pairing id)
//!  client reachable:   wait for the server to dial
//!  otherwise:          round one (Probe), round two (Punch), UDP probes
//!
//!  SecretStream <====================================> SecretStream
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use burrow_core::{ConnectOptions, Node, NodeConfig};
//! use burrow_crypto::KeyPair;
//! use burrow_discovery::{MemoryNetwork, NatBehavior};
//!
//! # async fn demo() -> burrow_core::Result<()> {
//! let net = MemoryNetwork::new();
//! let node = Node::new(net.add_node(false, NatBehavior::Open), NodeConfig::loopback());
//! let server = node.create_server(None)?;
//! server.listen(KeyPair::from_seed(&[1; 32])).await?;
//! while let Some(stream) = server.accept().await {
//!     let message = stream.recv().await?;
//!     stream.send(&message).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod policy;
pub mod server;
pub mod stream;

pub use config::{ClientConfig, MaintenanceConfig, NodeConfig, ServerConfig};
pub use error::{NodeError, Result};
pub use node::{ConnectOptions, Node};
pub use policy::{AllowAll, ConnectionPolicy};
pub use server::Server;
pub use stream::SecretStream;

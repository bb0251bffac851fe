//! Interface to the DHT substrate.
//!
//! Routing, k-buckets and token issuance live behind the [`Dht`] trait. The
//! connection pipeline only needs iterative queries towards a target, single
//! requests to a known node, and a hook to answer requests addressed to us.
//! [`memory::MemoryNetwork`] implements the trait in-process.

pub mod memory;

use crate::error::DhtError;
use async_trait::async_trait;
use burrow_transport::{DatagramSink, PoolSocket};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::mpsc;

/// RPC commands used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Liveness check; the reply reveals our observed address
    Ping,
    /// Fetch the announce record stored under a target
    FindPeer,
    /// Find the nodes closest to a target, collecting tokens
    Lookup,
    /// Store a signed announce record
    Announce,
    /// Remove a signed announce record
    Unannounce,
    /// Relay a Noise handshake
    PeerHandshake,
    /// Relay a holepunch payload
    PeerHolepunch,
}

/// A DHT node as seen in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    /// Where the node answered from
    pub addr: SocketAddrV4,
    /// Its routing id, when known
    pub id: Option<[u8; 32]>,
}

/// One reply collected by a query.
#[derive(Debug, Clone)]
pub struct QueryReply {
    /// The replying node
    pub from: NodeRef,
    /// Our address as the replying node saw it
    pub to: SocketAddrV4,
    /// Write token for a follow-up request to `from`
    pub token: Option<[u8; 32]>,
    /// Command-specific value
    pub value: Option<Vec<u8>>,
}

/// Reply to a single request.
#[derive(Debug, Clone)]
pub struct Response {
    /// The replying node
    pub from: NodeRef,
    /// Our address as the replying node saw it
    pub to: SocketAddrV4,
    /// Command-specific value
    pub value: Option<Vec<u8>>,
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Send from this pool socket instead of the node's main socket
    pub socket: Option<Arc<PoolSocket>>,
    /// Token obtained from an earlier query reply
    pub token: Option<[u8; 32]>,
}

/// A request addressed to the local node.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Command
    pub command: Command,
    /// Target, if the command carries one
    pub target: Option<[u8; 32]>,
    /// Payload
    pub value: Option<Vec<u8>>,
    /// Sender as observed by us
    pub from: SocketAddrV4,
    /// Token the sender echoed, already validated by the substrate
    pub token: Option<[u8; 32]>,
}

/// Answers requests addressed to the local node.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce a reply value. `None` means stay silent.
    async fn on_request(&self, request: IncomingRequest) -> Option<Vec<u8>>;
}

/// The DHT substrate as consumed by the connection pipeline.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Iterative query towards `target`. Replies stream in closest-first.
    fn query(&self, target: [u8; 32], command: Command, value: Option<Vec<u8>>) -> mpsc::Receiver<QueryReply>;

    /// Single request to `to`.
    async fn request(
        &self,
        target: Option<[u8; 32]>,
        command: Command,
        value: Option<Vec<u8>>,
        to: SocketAddrV4,
        options: RequestOptions,
    ) -> Result<Response, DhtError>;

    /// Whether this node believes it sits behind a NAT.
    fn firewalled(&self) -> bool;

    /// Our public address, once known.
    fn remote_address(&self) -> Option<SocketAddrV4>;

    /// Our routing id.
    fn node_id(&self) -> Option<[u8; 32]>;

    /// Up to `max` known nodes to ping for NAT samples.
    fn sample_nodes(&self, max: usize) -> Vec<SocketAddrV4>;

    /// Install the handler for incoming requests.
    fn set_handler(&self, handler: Arc<dyn RequestHandler>);

    /// Feed a DHT datagram that arrived on a pool socket.
    fn on_message(&self, _socket: &Arc<PoolSocket>, _data: &[u8], _from: SocketAddrV4) {}
}

/// Routes DHT traffic arriving on pool sockets into a [`Dht`].
pub struct DhtSink(pub Arc<dyn Dht>);

impl DatagramSink for DhtSink {
    fn on_datagram(&self, socket: &Arc<PoolSocket>, data: &[u8], from: SocketAddrV4) {
        self.0.on_message(socket, data, from);
    }
}

/// Drain a query, keeping every reply.
pub async fn collect(mut replies: mpsc::Receiver<QueryReply>) -> Vec<QueryReply> {
    let mut all = Vec::new();
    while let Some(reply) = replies.recv().await {
        all.push(reply);
    }
    all
}

//! Two-node test fixture for integration testing
//!
//! A server node and a client node on one in-memory DHT, plus three open
//! relay nodes the server announces to.
//!
//! # Example
//!
//! ```no_run
//! use burrow_discovery::NatBehavior;
//! use burrow_integration_tests::fixtures::TwoNodeFixture;
//!
//! # async fn demo() {
//! let fixture = TwoNodeFixture::new(NatBehavior::Consistent, NatBehavior::Consistent).await.unwrap();
//! let (client, server) = fixture.establish().await.unwrap();
//! client.send(b"ping").await.unwrap();
//! assert_eq!(server.recv().await.unwrap(), b"ping");
//! fixture.cleanup().await;
//! # }
//! ```

use crate::test_helpers::ci_timeout;
use burrow_core::{ConnectOptions, ConnectionPolicy, Node, NodeConfig, NodeError, SecretStream, Server};
use burrow_crypto::KeyPair;
use burrow_discovery::{MemoryDht, MemoryNetwork, NatBehavior};
use std::sync::Arc;
use std::time::Duration;

/// Relays every fixture starts with
const RELAYS: usize = 3;

/// Two-node test fixture
pub struct TwoNodeFixture {
    pub net: MemoryNetwork,
    pub config: NodeConfig,
    pub relays: Vec<Node>,
    pub server_node: Node,
    pub server_dht: Arc<MemoryDht>,
    pub client_node: Node,
    pub client_dht: Arc<MemoryDht>,
    pub server_keys: KeyPair,
    pub client_keys: KeyPair,
    pub server: Server,
}

impl TwoNodeFixture {
    /// Listening server behind `server_nat`, idle client behind
    /// `client_nat`. Anything but [`NatBehavior::Open`] is firewalled.
    pub async fn new(server_nat: NatBehavior, client_nat: NatBehavior) -> Result<Self, NodeError> {
        Self::with_policy(server_nat, client_nat, None).await
    }

    /// Same as [`TwoNodeFixture::new`] with a server-side policy.
    pub async fn with_policy(
        server_nat: NatBehavior,
        client_nat: NatBehavior,
        policy: Option<Arc<dyn ConnectionPolicy>>,
    ) -> Result<Self, NodeError> {
        let net = MemoryNetwork::new();
        let config = NodeConfig::loopback();
        let relays = (0..RELAYS)
            .map(|_| Node::new(net.add_node(false, NatBehavior::Open), config.clone()))
            .collect();

        let server_dht = net.add_node(server_nat != NatBehavior::Open, server_nat);
        let server_node = Node::new(server_dht.clone(), config.clone());
        let client_dht = net.add_node(client_nat != NatBehavior::Open, client_nat);
        let client_node = Node::new(client_dht.clone(), config.clone());

        let server_keys = KeyPair::generate(&mut rand_core::OsRng);
        let client_keys = KeyPair::generate(&mut rand_core::OsRng);
        let server = server_node.create_server(policy)?;
        server.listen(server_keys.clone()).await?;

        Ok(Self {
            net,
            config,
            relays,
            server_node,
            server_dht,
            client_node,
            client_dht,
            server_keys,
            client_keys,
            server,
        })
    }

    /// Extra node on the same network.
    pub fn add_node(&self, nat: NatBehavior) -> (Node, Arc<MemoryDht>) {
        let dht = self.net.add_node(nat != NatBehavior::Open, nat);
        (Node::new(dht.clone(), self.config.clone()), dht)
    }

    /// Client connect with default options.
    pub async fn connect(&self) -> Result<SecretStream, NodeError> {
        self.connect_with(ConnectOptions::default()).await
    }

    /// Client connect with `options`.
    pub async fn connect_with(&self, options: ConnectOptions) -> Result<SecretStream, NodeError> {
        self.client_node
            .connect(&self.client_keys, &self.server_keys.public_key(), options)
            .await
    }

    /// Next accepted stream, or `None` if nothing arrives in time.
    pub async fn accept(&self) -> Option<SecretStream> {
        tokio::time::timeout(ci_timeout(Duration::from_secs(10)), self.server.accept())
            .await
            .ok()
            .flatten()
    }

    /// Connect and accept; returns `(client side, server side)`.
    pub async fn establish(&self) -> Result<(SecretStream, SecretStream), NodeError> {
        let (client, server) = tokio::join!(self.connect(), self.accept());
        let client = client?;
        let server = server.ok_or(NodeError::timeout("accept"))?;
        Ok((client, server))
    }

    /// Tear every node down.
    pub async fn cleanup(self) {
        self.client_node.destroy().await;
        self.server_node.destroy().await;
        for relay in self.relays {
            relay.destroy().await;
        }
    }
}

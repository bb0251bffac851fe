//! The node: shared collaborators plus server and client entry points.

use crate::client;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::policy::{AllowAll, ConnectionPolicy};
use crate::server::Server;
use crate::stream::SecretStream;
use burrow_crypto::{KeyPair, Namespaces, PublicKey};
use burrow_discovery::{Cancel, Dht, DhtSink, PairContext, Router};
use burrow_transport::SocketPool;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;

/// Collaborators shared by every server and connection attempt of a node.
pub(crate) struct NodeContext {
    pub(crate) dht: Arc<dyn Dht>,
    pub(crate) pool: SocketPool,
    pub(crate) ns: Arc<Namespaces>,
    pub(crate) router: Arc<Router>,
    pub(crate) config: NodeConfig,
    pub(crate) destroyed: Cancel,
}

impl NodeContext {
    pub(crate) fn pair_context(&self) -> PairContext {
        PairContext {
            dht: Arc::clone(&self.dht),
            pool: self.pool.clone(),
            ns: Arc::clone(&self.ns),
            nat: self.config.nat.clone(),
            config: self.config.pair.clone(),
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.destroyed.is_cancelled() {
            return Err(NodeError::NodeDestroyed);
        }
        Ok(())
    }
}

/// Per-connect options.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Enter through this node instead of the node holding the record.
    /// It forwards the handshake to the server's relay.
    pub relay_through: Option<SocketAddrV4>,
    /// Veto hook consulted before punching
    pub policy: Arc<dyn ConnectionPolicy>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            relay_through: None,
            policy: Arc::new(AllowAll),
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("relay_through", &self.relay_through)
            .finish_non_exhaustive()
    }
}

struct NodeInner {
    ctx: Arc<NodeContext>,
    servers: Mutex<Vec<Server>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// A DHT node that can serve and open encrypted peer connections.
///
/// # Example
///
/// ```no_run
/// use burrow_core::{ConnectOptions, Node, NodeConfig};
/// use burrow_crypto::KeyPair;
/// use burrow_discovery::{MemoryNetwork, NatBehavior};
/// use std::sync::Arc;
///
/// # async fn demo() -> burrow_core::Result<()> {
/// let net = MemoryNetwork::new();
/// let server_node = Node::new(net.add_node(false, NatBehavior::Open), NodeConfig::loopback());
/// let client_node = Node::new(net.add_node(false, NatBehavior::Open), NodeConfig::loopback());
///
/// let keys = KeyPair::from_seed(&[7; 32]);
/// let server = server_node.create_server(None)?;
/// server.listen(keys.clone()).await?;
///
/// let stream = client_node
///     .connect(&KeyPair::from_seed(&[8; 32]), &keys.public_key(), ConnectOptions::default())
///     .await?;
/// stream.send(b"hello").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Node on top of `dht`. Installs the router as the DHT's request
    /// handler. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(dht: Arc<dyn Dht>, config: NodeConfig) -> Self {
        let pool = SocketPool::new(config.pool.clone());
        pool.set_sink(Arc::new(DhtSink(Arc::clone(&dht))));
        let ns = Arc::new(Namespaces::new());
        let router = Router::new(Arc::clone(&dht), Arc::clone(&ns), config.forwards.clone());
        dht.set_handler(router.clone());

        let ctx = Arc::new(NodeContext {
            dht,
            pool,
            ns,
            router,
            config,
            destroyed: Cancel::new(),
        });
        let maintenance = tokio::spawn(maintain(Arc::downgrade(&ctx)));
        tracing::debug!("node started, firewalled: {}", ctx.dht.firewalled());

        Self {
            inner: Arc::new(NodeInner {
                ctx,
                servers: Mutex::new(Vec::new()),
                maintenance: Mutex::new(Some(maintenance)),
            }),
        }
    }

    fn servers(&self) -> MutexGuard<'_, Vec<Server>> {
        self.inner.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New server. Without a policy every client is admitted.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NodeDestroyed`] after [`Node::destroy`].
    pub fn create_server(&self, policy: Option<Arc<dyn ConnectionPolicy>>) -> Result<Server> {
        self.inner.ctx.ensure_live()?;
        let policy = policy.unwrap_or_else(|| Arc::new(AllowAll));
        let server = Server::new(Arc::clone(&self.inner.ctx), policy);
        let mut servers = self.servers();
        servers.retain(|s| !s.is_closed());
        servers.push(server.clone());
        Ok(server)
    }

    /// Open an encrypted stream to the server holding `remote`.
    ///
    /// # Errors
    ///
    /// Fails with one of the lookup, handshake or holepunch errors of
    /// [`NodeError`], or [`NodeError::NodeDestroyed`] if the node is torn
    /// down meanwhile.
    pub async fn connect(&self, keys: &KeyPair, remote: &PublicKey, options: ConnectOptions) -> Result<SecretStream> {
        let ctx = &self.inner.ctx;
        ctx.ensure_live()?;
        let destroyed = ctx.destroyed.token();
        tokio::select! {
            result = client::connect(ctx, keys, remote, &options) => {
                if let Err(e) = &result {
                    tracing::debug!("connect to {} failed: {} ({})", remote, e, e.kind());
                }
                result
            }
            () = destroyed.cancelled() => Err(NodeError::NodeDestroyed),
        }
    }

    /// Close every server, abort pending connects and close the socket
    /// pool. Returns `false` if already destroyed.
    pub async fn destroy(&self) -> bool {
        let ctx = &self.inner.ctx;
        if !ctx.destroyed.cancel() {
            return false;
        }
        let servers = std::mem::take(&mut *self.servers());
        for server in servers {
            server.close().await;
        }
        let maintenance = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = maintenance {
            task.abort();
        }
        ctx.pool.close();
        tracing::info!("node destroyed");
        true
    }

    /// Whether [`Node::destroy`] ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.ctx.destroyed.is_cancelled()
    }

    /// Whether the DHT believes this node sits behind a NAT.
    #[must_use]
    pub fn firewalled(&self) -> bool {
        self.inner.ctx.dht.firewalled()
    }

    /// The request router installed on the DHT.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.ctx.router
    }

    /// The socket pool.
    #[must_use]
    pub fn pool(&self) -> &SocketPool {
        &self.inner.ctx.pool
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.ctx.config
    }

    /// Collaborators for a stand-alone [`burrow_discovery::Pair`].
    #[must_use]
    pub fn pair_context(&self) -> PairContext {
        self.inner.ctx.pair_context()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("firewalled", &self.firewalled())
            .field("destroyed", &self.is_destroyed())
            .field("servers", &self.servers().len())
            .finish_non_exhaustive()
    }
}

/// Periodic upkeep until the node goes away.
async fn maintain(ctx: Weak<NodeContext>) {
    let (token, every) = match ctx.upgrade() {
        Some(ctx) => (ctx.destroyed.token(), ctx.config.maintenance.forward_cleanup_interval),
        None => return,
    };
    while token.pause(every).await {
        let Some(ctx) = ctx.upgrade() else {
            return;
        };
        let removed = ctx.router.cleanup();
        if removed > 0 {
            tracing::debug!("dropped {} expired forwards", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_discovery::{MemoryNetwork, NatBehavior};

    #[tokio::test]
    async fn test_destroyed_node_refuses_work() {
        let net = MemoryNetwork::new();
        let node = Node::new(net.add_node(false, NatBehavior::Open), NodeConfig::loopback());
        let server = node.create_server(None).unwrap();
        assert!(!node.is_destroyed());

        assert!(node.destroy().await);
        assert!(!node.destroy().await);
        assert!(server.is_closed());
        assert_eq!(node.create_server(None).unwrap_err(), NodeError::NodeDestroyed);

        let keys = KeyPair::from_seed(&[1; 32]);
        let err = node
            .connect(&keys, &KeyPair::from_seed(&[2; 32]).public_key(), ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::NodeDestroyed);
        assert_eq!(server.listen(keys).await.unwrap_err(), NodeError::NodeDestroyed);
    }

    #[tokio::test]
    async fn test_router_installed_on_dht() {
        let net = MemoryNetwork::new();
        let dht = net.add_node(false, NatBehavior::Open);
        let node = Node::new(dht.clone(), NodeConfig::loopback());
        let target = KeyPair::from_seed(&[3; 32]).public_key().target();
        assert!(node.router().record(&target).is_none());
        assert!(!node.firewalled());
        assert_eq!(node.pair_context().config.max_reopens, node.config().pair.max_reopens);
    }
}

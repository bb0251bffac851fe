//! In-process DHT.
//!
//! Every node gets a virtual address on `127.0.0.1`. Requests are delivered
//! by calling the destination's handler directly; datagrams between pool
//! sockets still travel over real loopback UDP. Each node carries a NAT
//! behaviour that decides which address a ping sent from one of its pool
//! sockets appears to come from.

use super::{Command, Dht, IncomingRequest, NodeRef, QueryReply, RequestHandler, RequestOptions, Response};
use crate::error::DhtError;
use async_trait::async_trait;
use burrow_crypto::hash::{hash, keyed_hash};
use burrow_transport::PoolSocket;
use rand::Rng;
use rand_core::{OsRng, RngCore};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Nodes a query visits.
const QUERY_WIDTH: usize = 20;

/// How a simulated NAT maps pool sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatBehavior {
    /// Socket address seen as is
    Open,
    /// One stable external port per socket
    Consistent,
    /// A fresh external port per destination
    Random,
}

/// A request seen by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// Sender's virtual address
    pub from: SocketAddrV4,
    /// Destination
    pub to: SocketAddrV4,
    /// Command
    pub command: Command,
    /// Target, if any
    pub target: Option<[u8; 32]>,
}

struct MemoryNode {
    addr: SocketAddrV4,
    id: [u8; 32],
    firewalled: bool,
    nat: NatBehavior,
    online: AtomicBool,
    token_secret: [u8; 32],
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl MemoryNode {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.read().ok().and_then(|h| h.clone())
    }

    fn token_for(&self, requester: SocketAddrV4) -> [u8; 32] {
        let mut addr = [0u8; 6];
        addr[..4].copy_from_slice(&requester.ip().octets());
        addr[4..].copy_from_slice(&requester.port().to_be_bytes());
        keyed_hash(&self.token_secret, &[&addr])
    }

    fn node_ref(&self) -> NodeRef {
        NodeRef {
            addr: self.addr,
            id: Some(self.id),
        }
    }
}

struct Network {
    nodes: RwLock<Vec<Arc<MemoryNode>>>,
    log: Mutex<Vec<RequestRecord>>,
    next_port: AtomicU16,
}

impl Network {
    fn find(&self, addr: SocketAddrV4) -> Option<Arc<MemoryNode>> {
        self.nodes
            .read()
            .ok()?
            .iter()
            .find(|n| n.addr == addr)
            .cloned()
    }

    fn online_except(&self, addr: SocketAddrV4) -> Vec<Arc<MemoryNode>> {
        self.nodes
            .read()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|n| n.addr != addr && n.is_online())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn record(&self, record: RequestRecord) {
        if let Ok(mut log) = self.log.lock() {
            log.push(record);
        }
    }
}

/// Shared in-process network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Network>,
}

impl MemoryNetwork {
    /// Empty network.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Network {
                nodes: RwLock::new(Vec::new()),
                log: Mutex::new(Vec::new()),
                next_port: AtomicU16::new(10_000),
            }),
        }
    }

    /// Join a node.
    #[must_use]
    pub fn add_node(&self, firewalled: bool, nat: NatBehavior) -> Arc<MemoryDht> {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let mut token_secret = [0u8; 32];
        OsRng.fill_bytes(&mut token_secret);

        let node = Arc::new(MemoryNode {
            addr,
            id: hash(&[&addr.ip().octets()[..], &port.to_be_bytes()[..]].concat()),
            firewalled,
            nat,
            online: AtomicBool::new(true),
            token_secret,
            handler: RwLock::new(None),
        });
        if let Ok(mut nodes) = self.inner.nodes.write() {
            nodes.push(Arc::clone(&node));
        }
        tracing::trace!("memory dht node {} joined", addr);
        Arc::new(MemoryDht {
            net: Arc::clone(&self.inner),
            node,
        })
    }

    /// Take a node off the network or bring it back.
    pub fn set_online(&self, addr: SocketAddrV4, online: bool) {
        if let Some(node) = self.inner.find(addr) {
            node.online.store(online, Ordering::Release);
        }
    }

    /// Every request sent so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.inner.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Requests of one command sent to `to`.
    #[must_use]
    pub fn count_requests(&self, to: SocketAddrV4, command: Command) -> usize {
        self.inner
            .log
            .lock()
            .map(|log| log.iter().filter(|r| r.to == to && r.command == command).count())
            .unwrap_or(0)
    }

    /// Number of joined nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    /// Whether no node joined yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork").field("nodes", &self.len()).finish()
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryDht {
    net: Arc<Network>,
    node: Arc<MemoryNode>,
}

impl MemoryDht {
    /// Virtual address of this node.
    #[must_use]
    pub fn addr(&self) -> SocketAddrV4 {
        self.node.addr
    }

    /// Address the far side sees when we send from `socket`.
    fn observed(&self, socket: Option<&Arc<PoolSocket>>) -> SocketAddrV4 {
        let Some(socket) = socket else {
            return self.node.addr;
        };
        let host = *self.node.addr.ip();
        match self.node.nat {
            NatBehavior::Open | NatBehavior::Consistent => {
                SocketAddrV4::new(host, socket.local_addr().port())
            }
            NatBehavior::Random => SocketAddrV4::new(host, rand::thread_rng().gen_range(1024..=u16::MAX)),
        }
    }
}

#[async_trait]
impl Dht for MemoryDht {
    fn query(&self, target: [u8; 32], command: Command, value: Option<Vec<u8>>) -> mpsc::Receiver<QueryReply> {
        let (tx, rx) = mpsc::channel(QUERY_WIDTH);
        if !self.node.is_online() {
            return rx;
        }

        let mut nodes = self.net.online_except(self.node.addr);
        nodes.sort_by_key(|n| xor(&n.id, &target));
        nodes.truncate(QUERY_WIDTH);

        let me = self.node.addr;
        let net = Arc::clone(&self.net);
        tokio::spawn(async move {
            for node in nodes {
                net.record(RequestRecord {
                    from: me,
                    to: node.addr,
                    command,
                    target: Some(target),
                });
                let value = match node.handler() {
                    Some(handler) => {
                        handler
                            .on_request(IncomingRequest {
                                command,
                                target: Some(target),
                                value: value.clone(),
                                from: me,
                                token: None,
                            })
                            .await
                    }
                    None => None,
                };
                let reply = QueryReply {
                    from: node.node_ref(),
                    to: me,
                    token: Some(node.token_for(me)),
                    value,
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn request(
        &self,
        target: Option<[u8; 32]>,
        command: Command,
        value: Option<Vec<u8>>,
        to: SocketAddrV4,
        options: RequestOptions,
    ) -> Result<Response, DhtError> {
        if !self.node.is_online() {
            return Err(DhtError::Destroyed);
        }
        let from = self.observed(options.socket.as_ref());
        self.net.record(RequestRecord {
            from: self.node.addr,
            to,
            command,
            target,
        });

        let node = self
            .net
            .find(to)
            .filter(|n| n.is_online())
            .ok_or(DhtError::Timeout)?;

        if matches!(command, Command::Announce | Command::Unannounce)
            && options.token != Some(node.token_for(self.node.addr))
        {
            return Err(DhtError::InvalidToken);
        }

        let value = match command {
            Command::Ping => None,
            _ => {
                let handler = node.handler().ok_or(DhtError::Timeout)?;
                let reply = handler
                    .on_request(IncomingRequest {
                        command,
                        target,
                        value,
                        from,
                        token: options.token,
                    })
                    .await
                    .ok_or(DhtError::Timeout)?;
                Some(reply)
            }
        };

        Ok(Response {
            from: node.node_ref(),
            to: from,
            value,
        })
    }

    fn firewalled(&self) -> bool {
        self.node.firewalled
    }

    fn remote_address(&self) -> Option<SocketAddrV4> {
        Some(self.node.addr)
    }

    fn node_id(&self) -> Option<[u8; 32]> {
        Some(self.node.id)
    }

    fn sample_nodes(&self, max: usize) -> Vec<SocketAddrV4> {
        self.net
            .online_except(self.node.addr)
            .into_iter()
            .take(max)
            .map(|n| n.addr)
            .collect()
    }

    fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        if let Ok(mut slot) = self.node.handler.write() {
            *slot = Some(handler);
        }
    }
}

impl std::fmt::Debug for MemoryDht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDht")
            .field("addr", &self.node.addr)
            .field("firewalled", &self.node.firewalled)
            .field("nat", &self.node.nat)
            .finish()
    }
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

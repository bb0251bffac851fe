//! Encrypted datagram stream over a punched socket.
//!
//! ## Frame Format
//!
//! ```text
//! +------+----------------+----------------------+
//! | 0xfe | counter u64 LE | ciphertext || tag16  |
//! +------+----------------+----------------------+
//! ```
//!
//! Frames are sealed with XChaCha20-Poly1305 under the directional keys of
//! the Noise handshake. The counter forms the nonce and the 9-byte header
//! is authenticated as associated data. Receivers keep a 64-frame sliding
//! window against replays and follow an authenticated peer to a new
//! source address.

use crate::error::{NodeError, Result};
use burrow_crypto::aead::{AeadKey, Nonce, TAG_SIZE};
use burrow_crypto::{HandshakeResult, PublicKey};
use burrow_discovery::{Cancel, RawConnection};
use burrow_transport::wire::STREAM_TAG;
use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::UdpSocket;

/// Tag plus counter.
const HEADER_SIZE: usize = 9;

/// Largest datagram read from the socket.
const MAX_FRAME: usize = 65_535;

/// Largest plaintext a single frame carries.
pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER_SIZE - TAG_SIZE;

/// Frames remembered behind the highest counter seen.
const REPLAY_WINDOW: u64 = 64;

/// Sliding bitmap of received counters.
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: u64,
    seen: u64,
    started: bool,
}

impl ReplayWindow {
    fn accepts(&self, counter: u64) -> bool {
        if !self.started || counter > self.highest {
            return true;
        }
        let age = self.highest - counter;
        age < REPLAY_WINDOW && self.seen & (1 << age) == 0
    }

    fn commit(&mut self, counter: u64) {
        if !self.started {
            self.started = true;
            self.highest = counter;
            self.seen = 1;
            return;
        }
        if counter > self.highest {
            let shift = counter - self.highest;
            self.seen = if shift >= REPLAY_WINDOW { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.highest = counter;
        } else {
            self.seen |= 1 << (self.highest - counter);
        }
    }
}

struct StreamInner {
    socket: Arc<UdpSocket>,
    local: SocketAddrV4,
    remote: Mutex<SocketAddrV4>,
    tx: AeadKey,
    rx: AeadKey,
    sent: AtomicU64,
    replay: Mutex<ReplayWindow>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    public_key: PublicKey,
    remote_public_key: PublicKey,
    handshake_hash: [u8; 64],
    is_initiator: bool,
    closed: Cancel,
}

/// Authenticated, encrypted datagrams with one peer.
///
/// Cheap to clone; clones share the socket and counters.
#[derive(Clone)]
pub struct SecretStream {
    inner: Arc<StreamInner>,
}

impl SecretStream {
    /// Start a stream over a connected raw socket.
    #[must_use]
    pub fn new(raw: RawConnection, handshake: &HandshakeResult) -> Self {
        let local = match raw.socket.local_addr() {
            Ok(SocketAddr::V4(addr)) => addr,
            _ => SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
        };
        tracing::debug!(
            "stream {} <-> {} with {} ({} early frames)",
            local,
            raw.remote,
            handshake.remote_public_key,
            raw.pending.len()
        );
        Self {
            inner: Arc::new(StreamInner {
                socket: raw.socket,
                local,
                remote: Mutex::new(raw.remote),
                tx: AeadKey::new(handshake.tx),
                rx: AeadKey::new(handshake.rx),
                sent: AtomicU64::new(0),
                replay: Mutex::new(ReplayWindow::default()),
                pending: Mutex::new(raw.pending.into()),
                public_key: handshake.public_key,
                remote_public_key: handshake.remote_public_key,
                handshake_hash: handshake.handshake_hash,
                is_initiator: handshake.is_initiator,
                closed: Cancel::new(),
            }),
        }
    }

    /// Encrypt and send one datagram.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed, `data` exceeds [`MAX_PAYLOAD`] or the
    /// socket errors.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::invalid_state("stream closed"));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(NodeError::transport("datagram too large"));
        }
        let counter = self.inner.sent.fetch_add(1, Ordering::AcqRel);
        let frame = seal(&self.inner.tx, counter, data)?;
        let remote = self.remote_address();
        self.inner.socket.send_to(&frame, SocketAddr::V4(remote)).await?;
        Ok(())
    }

    /// Receive the next authenticated datagram.
    ///
    /// Frames that fail authentication, replays and stray probes are
    /// dropped silently.
    ///
    /// # Errors
    ///
    /// Fails once the stream is closed, or on a socket error.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            let early = self.pending().pop_front();
            let Some(frame) = early else { break };
            let from = self.remote_address();
            if let Some(data) = self.accept(&frame, from) {
                return Ok(data);
            }
        }

        let token = self.inner.closed.token();
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let (len, from) = tokio::select! {
                () = token.cancelled() => return Err(NodeError::invalid_state("stream closed")),
                received = self.inner.socket.recv_from(&mut buf) => received?,
            };
            let SocketAddr::V4(from) = from else {
                continue;
            };
            if let Some(data) = self.accept(&buf[..len], from) {
                return Ok(data);
            }
        }
    }

    fn accept(&self, frame: &[u8], from: SocketAddrV4) -> Option<Vec<u8>> {
        let (counter, data) = open(&self.inner.rx, frame, &self.inner.replay)?;
        let mut remote = self.inner.remote.lock().unwrap_or_else(PoisonError::into_inner);
        if *remote != from {
            tracing::debug!("stream peer moved {} -> {} at frame {}", *remote, from, counter);
            *remote = from;
        }
        Some(data)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Our identity.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.inner.public_key
    }

    /// Authenticated identity of the peer.
    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.inner.remote_public_key
    }

    /// Noise transcript hash, identical on both ends.
    #[must_use]
    pub fn handshake_hash(&self) -> &[u8; 64] {
        &self.inner.handshake_hash
    }

    /// Whether we dialled.
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.inner.is_initiator
    }

    /// Where frames currently go.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddrV4 {
        *self.inner.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Local socket address.
    #[must_use]
    pub fn local_address(&self) -> SocketAddrV4 {
        self.inner.local
    }

    /// Stop sending and wake pending receivers. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let closed = self.inner.closed.cancel();
        if closed {
            tracing::debug!("stream {} <-> {} closed", self.inner.local, self.remote_address());
        }
        closed
    }

    /// Whether [`SecretStream::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl std::fmt::Debug for SecretStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStream")
            .field("local", &self.inner.local)
            .field("remote", &self.remote_address())
            .field("remote_public_key", &self.inner.remote_public_key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn seal(key: &AeadKey, counter: u64, data: &[u8]) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + data.len() + TAG_SIZE);
    frame.push(STREAM_TAG);
    frame.extend_from_slice(&counter.to_le_bytes());
    let ciphertext = key.encrypt(&Nonce::from_counter(counter), data, &frame)?;
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Authenticate `frame` and record its counter. The window is only
/// advanced by frames that decrypt.
fn open(key: &AeadKey, frame: &[u8], replay: &Mutex<ReplayWindow>) -> Option<(u64, Vec<u8>)> {
    if frame.len() < HEADER_SIZE + TAG_SIZE || frame[0] != STREAM_TAG {
        return None;
    }
    let (header, ciphertext) = frame.split_at(HEADER_SIZE);
    let counter = u64::from_le_bytes(header[1..].try_into().ok()?);

    if !replay.lock().unwrap_or_else(PoisonError::into_inner).accepts(counter) {
        tracing::trace!("dropping replayed frame {}", counter);
        return None;
    }
    let data = key.decrypt(&Nonce::from_counter(counter), ciphertext, header).ok()?;

    let mut window = replay.lock().unwrap_or_else(PoisonError::into_inner);
    if !window.accepts(counter) {
        return None;
    }
    window.commit(counter);
    Some((counter, data))
}

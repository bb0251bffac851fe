//! Punch strategies.

use super::pair::{PairInner, PairState};
use crate::error::HolepunchError;
use crate::nat::Firewall;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// Lowest port tried when guessing a random NAT's mapping.
pub(super) const MIN_GUESS_PORT: u16 = 1000;

impl PairInner {
    /// Pick and start the strategy for the current classifications.
    /// Calling it again once punching has started does nothing.
    pub(super) fn punch(self: &Arc<Self>) -> Result<(), HolepunchError> {
        match self.state() {
            PairState::Destroyed => return Err(self.failure()),
            PairState::Punching | PairState::Connected => return Ok(()),
            _ => {}
        }
        let (_, nat) = self.main().ok_or(HolepunchError::NotOpen)?;
        let local = nat.firewall();
        let remote = self.remote_firewall();
        let target = self.remote_address();

        match (local, remote) {
            (Firewall::Random, Firewall::Random) => return Err(HolepunchError::DoubleRandomized),
            (l, r) if l.is_stable() && r.is_stable() => {
                let target = target
                    .filter(|a| a.port() != 0)
                    .ok_or(HolepunchError::RemoteUnverified)?;
                Arc::clone(self).consistent_probe(target, !self.initiator);
            }
            (l, Firewall::Random) if l.is_stable() => {
                let host = target.ok_or(HolepunchError::RemoteUnverified)?;
                Arc::clone(self).random_probes(*host.ip());
            }
            (Firewall::Random, r) if r.is_stable() => {
                let target = target
                    .filter(|a| a.port() != 0)
                    .ok_or(HolepunchError::RemoteUnverified)?;
                self.birthday(target)?;
            }
            (local, remote) => return Err(HolepunchError::NoStrategy { local, remote }),
        }

        self.advance(PairState::Punching);
        tracing::debug!("punching: local {} remote {}", local, remote);
        Ok(())
    }

    /// Steady probes from the main socket to a known address. The responder
    /// holds back briefly so the initiator's mapping exists first.
    pub(super) fn consistent_probe(self: Arc<Self>, target: SocketAddrV4, delayed: bool) {
        let inner = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let config = &inner.ctx.config;
            if delayed && !inner.pause(config.responder_delay).await {
                return;
            }
            for _ in 0..config.consistent_tries {
                let Some((socket, _)) = inner.main() else {
                    return;
                };
                if let Err(e) = socket.probe(target).await {
                    tracing::trace!("probe to {} failed: {}", target, e);
                }
                if !inner.pause(config.consistent_interval).await {
                    return;
                }
            }
        });
        self.track(task);
    }

    /// Spray the remote host's port space from our stable socket, hoping to
    /// hit the port its NAT opened towards us.
    fn random_probes(self: Arc<Self>, host: Ipv4Addr) {
        let inner = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let config = &inner.ctx.config;
            for _ in 0..config.random_probes {
                let Some((socket, _)) = inner.main() else {
                    return;
                };
                let port = guess_port(&mut rand::thread_rng());
                if let Err(e) = socket.probe(SocketAddrV4::new(host, port)).await {
                    tracing::trace!("random probe to {}:{} failed: {}", host, port, e);
                }
                if !inner.pause(config.random_interval).await {
                    return;
                }
            }
        });
        self.track(task);
    }

    /// Open many sockets and probe the stable remote from each of them, so
    /// one of our fresh mappings matches a port the remote sprays.
    fn birthday(self: &Arc<Self>, target: SocketAddrV4) -> Result<(), HolepunchError> {
        let config = &self.ctx.config;
        let leases = self.ctx.pool.acquire_many(config.birthday_sockets)?;
        let Some(sockets) = self.adopt(leases) else {
            return Err(self.failure());
        };
        tracing::debug!("opened {} birthday sockets towards {}", sockets.len(), target);

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let config = &inner.ctx.config;
            for socket in &sockets {
                if let Err(e) = socket.probe_low_ttl(target).await {
                    tracing::trace!("birthday probe from {} failed: {}", socket.local_addr(), e);
                }
            }
            for socket in sockets.iter().cycle().take(config.random_probes) {
                if inner.is_done() {
                    return;
                }
                if let Err(e) = socket.probe(target).await {
                    tracing::trace!("birthday probe from {} failed: {}", socket.local_addr(), e);
                }
                if !inner.pause(config.birthday_interval).await {
                    return;
                }
            }
        });
        self.track(task);
        Ok(())
    }
}

/// Uniform guess over the port range a NAT hands out.
fn guess_port<R: Rng>(rng: &mut R) -> u16 {
    rng.gen_range(MIN_GUESS_PORT..=u16::MAX)
}

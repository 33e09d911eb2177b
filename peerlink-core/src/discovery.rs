//! Peer discovery over broadcast datagrams.
//!
//! An announce goes out on a fixed interval while discovery runs. Inbound
//! packets either refresh an existing record, create a new one, answer a
//! query with a unicast announce, or retire a peer that said goodbye. Our
//! own broadcasts come back and are filtered by source address.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::Event;
use crate::error::{Error, Result};
use crate::peer::{GlobalStats, PeerState, Registry};
use crate::transport::Transport;
use crate::wire::{DiscoveryKind, DiscoveryPacket, DISCOVERY_MAX_SIZE};

/// By convention a peer's datagram port sits one above its stream port.
fn datagram_addr_for(ip: std::net::IpAddr, stream_port: u16) -> SocketAddr {
    SocketAddr::new(ip, stream_port.wrapping_add(1))
}

#[derive(Debug)]
pub(crate) struct Discovery {
    pub running: bool,
    last_announce_ms: Option<u64>,
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            running: false,
            last_announce_ms: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::DiscoveryActive);
        }
        self.running = true;
        // First service cycle announces immediately.
        self.last_announce_ms = None;
        info!("discovery started");
        Ok(())
    }

    pub fn stop(&mut self, t: &mut dyn Transport, cfg: &Config, flags: u16) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        let pkt = packet(DiscoveryKind::Goodbye, cfg, flags);
        t.broadcast_discovery(cfg.discovery_port, &pkt.encode()?)?;
        info!("discovery stopped");
        Ok(())
    }

    /// Periodic announce.
    pub fn tick(
        &mut self,
        t: &mut dyn Transport,
        cfg: &Config,
        flags: u16,
        now_ms: u64,
        stats: &mut GlobalStats,
    ) {
        if !self.running {
            return;
        }
        if let Some(last) = self.last_announce_ms {
            if now_ms.saturating_sub(last) < cfg.discovery_interval_ms {
                return;
            }
        }
        self.last_announce_ms = Some(now_ms);
        match announce_broadcast(t, cfg, flags) {
            Ok(()) => {
                stats.discovery_sent += 1;
                debug!(name = %cfg.local_name, "announce broadcast");
            }
            Err(e) => warn!(error = %e, "announce failed"),
        }
    }

    /// Drain pending discovery datagrams, bounded per cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn pump(
        &mut self,
        t: &mut dyn Transport,
        cfg: &Config,
        flags: u16,
        peers: &mut Registry,
        events: &mut VecDeque<Event>,
        stats: &mut GlobalStats,
        now_ms: u64,
    ) {
        if !self.running {
            return;
        }
        let mut buf = [0u8; DISCOVERY_MAX_SIZE];
        for _ in 0..16 {
            let (len, from) = match t.recv_discovery(&mut buf) {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "discovery recv failed");
                    break;
                }
            };
            let pkt = match DiscoveryPacket::decode(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%from, error = %e, "malformed discovery packet dropped");
                    continue;
                }
            };
            if t.is_local_addr(&from) && pkt.sender_port == cfg.stream_port {
                continue;
            }
            stats.discovery_received += 1;
            handle_packet(t, cfg, flags, peers, events, stats, pkt, from, now_ms);
        }
    }
}

fn packet(kind: DiscoveryKind, cfg: &Config, flags: u16) -> DiscoveryPacket {
    DiscoveryPacket::new(kind, flags, cfg.stream_port, cfg.transports, &cfg.local_name)
}

fn announce_broadcast(t: &mut dyn Transport, cfg: &Config, flags: u16) -> Result<()> {
    let pkt = packet(DiscoveryKind::Announce, cfg, flags);
    t.broadcast_discovery(cfg.discovery_port, &pkt.encode()?)
}

#[allow(clippy::too_many_arguments)]
fn handle_packet(
    t: &mut dyn Transport,
    cfg: &Config,
    flags: u16,
    peers: &mut Registry,
    events: &mut VecDeque<Event>,
    stats: &mut GlobalStats,
    pkt: DiscoveryPacket,
    from: SocketAddr,
    now_ms: u64,
) {
    let stream_addr = SocketAddr::new(from.ip(), pkt.sender_port);
    match pkt.kind {
        DiscoveryKind::Announce => {
            if let Some(id) = peers.find_by_addr(stream_addr).map(|p| p.id) {
                if let Some(p) = peers.get_mut(id) {
                    p.last_seen_ms = now_ms;
                    p.flags = pkt.flags;
                    p.transports = pkt.transports;
                    if p.name != pkt.name {
                        p.name = pkt.name;
                    }
                }
                return;
            }
            let datagram = datagram_addr_for(from.ip(), pkt.sender_port);
            match peers.insert(pkt.name.clone(), stream_addr, datagram, cfg, now_ms) {
                Ok(id) => {
                    if let Some(p) = peers.get_mut(id) {
                        p.flags = pkt.flags;
                        p.transports = pkt.transports;
                    }
                    info!(peer = %id, name = %pkt.name, %stream_addr, "peer discovered");
                    events.push_back(Event::PeerDiscovered { peer: id });
                }
                Err(_) => {
                    debug!(name = %pkt.name, "registry full, announce ignored");
                }
            }
        }
        DiscoveryKind::Query => {
            let reply = packet(DiscoveryKind::Announce, cfg, flags);
            match reply.encode() {
                Ok(buf) => {
                    if let Err(e) = t.send_discovery(from, &buf) {
                        warn!(%from, error = %e, "query reply failed");
                    } else {
                        stats.discovery_sent += 1;
                    }
                }
                Err(e) => warn!(error = %e, "query reply encode failed"),
            }
        }
        DiscoveryKind::Goodbye => {
            let Some(id) = peers.find_by_addr(stream_addr).map(|p| p.id) else {
                return;
            };
            if let Some(p) = peers.get_mut(id) {
                if p.state == PeerState::Connected || p.state == PeerState::Connecting {
                    if let Some(s) = p.stream {
                        t.stream_close(s);
                    }
                    p.reset_connection();
                }
            }
            peers.remove(id);
            info!(peer = %id, "peer said goodbye");
            events.push_back(Event::PeerLost { peer: id });
        }
    }
}

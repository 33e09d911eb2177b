//! The protocol engine: host-driven session management over a transport.
//!
//! The engine owns no sockets and spawns no threads. The host calls
//! [`Engine::service`] on its own cadence, lending a [`Transport`] for the
//! duration of the call; the engine does whatever non-blocking work is
//! possible and returns. Results surface as [`Event`]s drained with
//! [`Engine::poll_event`]. Partial work (half-written frames, half-read
//! frames, in-progress transfers) is explicit state that resumes on the
//! next cycle.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::caps::{self, Capabilities, CAP_FLAG_FRAGMENT};
use crate::config::{Config, DIRECT_THRESHOLD, MAX_TRANSFER_SIZE};
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::fragment::{OutboundTransfer, FRAGMENT_HEADER_SIZE};
use crate::peer::{GlobalStats, Peer, PeerId, PeerState, PeerStats, Registry};
use crate::queue::{Priority, QueuedMessage};
use crate::transport::Transport;
use crate::wire::{
    decode_datagram, encode_datagram, encode_message, Frame, MessageKind, FLAG_FRAGMENT,
    TRANSPORT_DATAGRAM,
};

/// Protocol coalesce keys (below 0x0100; application keys are shifted by
/// peer id and never collide with these).
const KEY_PING: u32 = 0x01;
const KEY_CAPS: u32 = 0x02;

/// Direct-buffer tags: plain large message, or a fragment of a transfer.
const TAG_PLAIN: u32 = 0;
const TAG_FRAGMENT: u32 = 0x8000_0000;

/// Engine notifications, drained by the host after each service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerDiscovered { peer: PeerId },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    PeerFailed { peer: PeerId },
    /// Record removed: goodbye received or discovery timed out.
    PeerLost { peer: PeerId },
    /// A reliable message is waiting in [`Engine::recv`].
    MessageReady { peer: PeerId },
    DatagramReceived { peer: Option<PeerId>, payload: Vec<u8> },
    CapabilityUpdated { peer: PeerId },
    TransferComplete { peer: PeerId, message_id: u16 },
    TransferCancelled { peer: PeerId, message_id: u16 },
}

/// Options for [`Engine::send_ex`].
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub priority: Priority,
    /// Nonzero makes later sends with the same key replace this message
    /// while it still sits in the queue.
    pub coalesce_key: u8,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            coalesce_key: 0,
        }
    }
}

enum FrameOutcome {
    Continue,
    Close,
}

pub struct Engine {
    cfg: Config,
    peers: Registry,
    events: VecDeque<Event>,
    stats: GlobalStats,
    discovery: Discovery,
    listening: bool,
    local_flags: u16,
}

impl Engine {
    pub fn new(cfg: Config) -> Self {
        let cfg = cfg.sanitized();
        Self {
            peers: Registry::new(cfg.max_peers),
            events: VecDeque::new(),
            stats: GlobalStats::default(),
            discovery: Discovery::new(),
            listening: false,
            local_flags: 0,
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Flags advertised in discovery packets (host/accepting/ready bits).
    pub fn set_local_flags(&mut self, flags: u16) {
        self.local_flags = flags;
    }

    pub fn start_discovery(&mut self) -> Result<()> {
        self.discovery.start()
    }

    pub fn stop_discovery(&mut self, t: &mut dyn Transport) -> Result<()> {
        self.discovery.stop(t, &self.cfg, self.local_flags)
    }

    pub fn start_listening(&mut self) {
        self.listening = true;
    }

    pub fn stop_listening(&mut self) {
        self.listening = false;
    }

    /// One full service cycle: discovery, connection progress, stream I/O,
    /// datagrams, timers. Never blocks.
    pub fn service(&mut self, t: &mut dyn Transport, now_ms: u64) {
        self.discovery
            .tick(t, &self.cfg, self.local_flags, now_ms, &mut self.stats);
        self.discovery.pump(
            t,
            &self.cfg,
            self.local_flags,
            &mut self.peers,
            &mut self.events,
            &mut self.stats,
            now_ms,
        );
        self.poll_accepts(t, now_ms);
        self.poll_connects(t, now_ms);
        self.pump_streams(t, now_ms);
        self.flush_streams(t);
        self.pump_datagrams(t);
        self.sweep(t, now_ms);
    }

    /// Latency-sensitive subset: stream reads and writes only. For hosts
    /// that interleave many fast cycles between full ones.
    pub fn service_fast(&mut self, t: &mut dyn Transport, now_ms: u64) {
        self.pump_streams(t, now_ms);
        self.flush_streams(t);
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Open a stream to a discovered peer. Completion is reported as
    /// [`Event::PeerConnected`] or [`Event::PeerFailed`].
    pub fn connect(&mut self, t: &mut dyn Transport, id: PeerId, now_ms: u64) -> Result<()> {
        let peer = self.peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        match peer.state {
            PeerState::Discovered | PeerState::Failed => {}
            _ => return Err(Error::InvalidState),
        }
        let s = t.connect(peer.addr)?;
        peer.stream = Some(s);
        peer.connect_started_ms = now_ms;
        peer.set_state(PeerState::Connecting)?;
        Ok(())
    }

    /// Orderly shutdown of one connection: a Disconnect control message is
    /// queued and the stream closes once everything pending has flushed.
    pub fn disconnect(&mut self, id: PeerId) -> Result<()> {
        let peer = self.peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        if peer.state != PeerState::Connected {
            return Err(Error::InvalidState);
        }
        queue_control(peer, MessageKind::Disconnect, Vec::new(), 0);
        peer.set_state(PeerState::Disconnecting)?;
        Ok(())
    }

    pub fn send(&mut self, id: PeerId, payload: &[u8]) -> Result<()> {
        self.send_ex(id, payload, SendOptions::default())
    }

    /// Queue a reliable message. Small payloads take a Tier 1 slot, larger
    /// ones the direct buffer, and payloads above the negotiated maximum
    /// become a fragmented transfer when both sides support it.
    pub fn send_ex(&mut self, id: PeerId, payload: &[u8], opts: SendOptions) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidParam);
        }
        let Self { cfg, peers, .. } = self;
        let peer = peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        if peer.state != PeerState::Connected {
            return Err(Error::InvalidState);
        }
        if let Some(c) = peer.caps {
            if opts.priority < caps::throttle_floor(c.queue_pressure) {
                return Err(Error::Backpressure);
            }
        }
        let local = local_caps(cfg, peer.recv_queue.pressure_percent());
        let eff_max = peer
            .caps
            .as_ref()
            .map(|c| caps::effective_max(&local, c))
            .unwrap_or(cfg.max_message_size);

        if payload.len() <= DIRECT_THRESHOLD {
            let key = if opts.coalesce_key != 0 {
                opts.coalesce_key as u32 | ((id.0 as u32) << 8)
            } else {
                0
            };
            let sequence = peer.take_seq();
            peer.send_queue.push(QueuedMessage {
                kind: MessageKind::Data,
                flags: 0,
                sequence,
                priority: opts.priority,
                coalesce_key: key,
                payload: payload.to_vec(),
            })?;
        } else if payload.len() <= eff_max {
            let sequence = peer.take_seq();
            let frame = encode_message(MessageKind::Data, 0, sequence, payload)?;
            peer.send_direct.queue(&frame, TAG_PLAIN)?;
        } else {
            start_transfer_inner(cfg, peer, payload)?;
        }
        Ok(())
    }

    /// Queue to every connected peer, best effort. Returns how many peers
    /// accepted the message.
    pub fn broadcast(&mut self, payload: &[u8], opts: SendOptions) -> usize {
        let ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.id)
            .collect();
        let mut sent = 0;
        for id in ids {
            if self.send_ex(id, payload, opts).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Fire-and-forget datagram to one peer. Sent immediately, no queueing
    /// and no delivery guarantee.
    pub fn send_datagram(&mut self, t: &mut dyn Transport, id: PeerId, payload: &[u8]) -> Result<()> {
        let (addr, transports) = {
            let peer = self.peers.get(id).ok_or(Error::PeerNotFound)?;
            (peer.datagram_addr, peer.transports)
        };
        if transports != 0 && transports & TRANSPORT_DATAGRAM == 0 {
            return Err(Error::NotSupported);
        }
        let buf = encode_datagram(self.cfg.stream_port, payload)?;
        t.send_datagram(addr, &buf)?;
        if let Some(peer) = self.peers.get_mut(id) {
            peer.stats.messages_sent += 1;
            peer.stats.bytes_sent += buf.len() as u64;
        }
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        Ok(())
    }

    /// Datagram to every connected peer. Returns how many sends succeeded.
    pub fn broadcast_datagram(&mut self, t: &mut dyn Transport, payload: &[u8]) -> usize {
        let ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.state == PeerState::Connected)
            .map(|p| p.id)
            .collect();
        let mut sent = 0;
        for id in ids {
            if self.send_datagram(t, id, payload).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Begin a fragmented transfer of up to 64 KiB. Returns the message id
    /// used in [`Event::TransferComplete`] and for cancellation.
    pub fn start_transfer(&mut self, id: PeerId, payload: &[u8]) -> Result<u16> {
        let Self { cfg, peers, .. } = self;
        let peer = peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        if peer.state != PeerState::Connected {
            return Err(Error::InvalidState);
        }
        start_transfer_inner(cfg, peer, payload)
    }

    /// Abandon a transfer's unsent fragments. Fragments already on the wire
    /// stay there; the receiver never completes the message.
    pub fn cancel_transfer(&mut self, id: PeerId, message_id: u16) -> Result<()> {
        let peer = self.peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        match &peer.transfer {
            Some(tx) if tx.message_id() == message_id => {
                peer.transfer = None;
                self.events.push_back(Event::TransferCancelled {
                    peer: id,
                    message_id,
                });
                Ok(())
            }
            _ => Err(Error::InvalidParam),
        }
    }

    /// Collect the next fully received message from a peer, if any.
    pub fn recv(&mut self, id: PeerId) -> Result<Option<Vec<u8>>> {
        let Self { cfg, peers, .. } = self;
        let peer = peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        let out = match peer.recv_queue.commit() {
            Some(m) => Some(m.payload),
            None => peer.recv_large.take(),
        };
        if out.is_some() {
            maybe_report_pressure(cfg, peer);
        }
        Ok(out)
    }

    /// Manually ping a connected peer; latency lands in
    /// [`Engine::peer_latency`] once the pong returns.
    pub fn ping(&mut self, id: PeerId, now_ms: u64) -> Result<()> {
        let peer = self.peers.get_mut(id).ok_or(Error::PeerNotFound)?;
        if peer.state != PeerState::Connected {
            return Err(Error::InvalidState);
        }
        queue_ping(peer, now_ms);
        Ok(())
    }

    /// Close every connection, send a goodbye, and forget all peers.
    pub fn shutdown(&mut self, t: &mut dyn Transport) -> Result<()> {
        for peer in self.peers.iter_mut() {
            if let Some(s) = peer.stream {
                t.stream_close(s);
            }
        }
        self.discovery.stop(t, &self.cfg, self.local_flags)?;
        self.listening = false;
        self.peers = Registry::new(self.cfg.max_peers);
        self.events.clear();
        info!("engine shut down");
        Ok(())
    }

    // Queries

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.ids()
    }

    pub fn find_peer(&self, name: &str) -> Option<PeerId> {
        self.peers.find_by_name(name).map(|p| p.id)
    }

    pub fn peer_state(&self, id: PeerId) -> Option<PeerState> {
        self.peers.get(id).map(|p| p.state)
    }

    pub fn peer_name(&self, id: PeerId) -> Option<&str> {
        self.peers.get(id).map(|p| p.name.as_str())
    }

    pub fn peer_addr(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.get(id).map(|p| p.addr)
    }

    pub fn peer_stats(&self, id: PeerId) -> Option<PeerStats> {
        self.peers.get(id).map(|p| p.stats)
    }

    /// Rolling latency average and the derived quality score (0-100).
    pub fn peer_latency(&self, id: PeerId) -> Option<(u32, u8)> {
        self.peers.get(id).map(|p| (p.latency_ms, p.quality))
    }

    pub fn peer_capabilities(&self, id: PeerId) -> Option<Capabilities> {
        self.peers.get(id).and_then(|p| p.caps)
    }

    /// Largest single message the peer accepts, once capabilities arrived.
    pub fn effective_max(&self, id: PeerId) -> Option<usize> {
        let peer = self.peers.get(id)?;
        let pc = peer.caps?;
        let local = local_caps(&self.cfg, peer.recv_queue.pressure_percent());
        Some(caps::effective_max(&local, &pc))
    }

    pub fn send_pressure(&self, id: PeerId) -> Option<u8> {
        self.peers.get(id).map(|p| p.send_queue.pressure_percent())
    }

    pub fn recv_pressure(&self, id: PeerId) -> Option<u8> {
        self.peers.get(id).map(|p| p.recv_queue.pressure_percent())
    }

    pub fn stats(&self) -> GlobalStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
        for peer in self.peers.iter_mut() {
            peer.stats = PeerStats::default();
        }
    }

    // Service stages

    fn poll_accepts(&mut self, t: &mut dyn Transport, now_ms: u64) {
        if !self.listening {
            return;
        }
        let Self {
            cfg,
            peers,
            events,
            stats,
            ..
        } = self;
        for _ in 0..8 {
            let (s, from) = match t.accept() {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };
            if !cfg.auto_accept {
                t.stream_close(s);
                stats.connections_rejected += 1;
                continue;
            }
            let existing = peers
                .iter()
                .find(|p| p.addr.ip() == from.ip() && p.stream.is_none())
                .map(|p| p.id);
            let id = match existing {
                Some(id) => Some(id),
                None => peers
                    .insert(
                        String::new(),
                        from,
                        SocketAddr::new(from.ip(), cfg.datagram_port),
                        cfg,
                        now_ms,
                    )
                    .ok(),
            };
            let Some(id) = id else {
                warn!(%from, "inbound connection rejected, registry full");
                t.stream_close(s);
                stats.connections_rejected += 1;
                continue;
            };
            let Some(peer) = peers.get_mut(id) else {
                continue;
            };
            peer.stream = Some(s);
            peer.last_seen_ms = now_ms;
            peer.last_ping_ms = now_ms;
            if let Err(e) = peer.set_state(PeerState::Connected) {
                warn!(peer = %id, error = %e, "accept in unexpected state");
            }
            send_capabilities(peer, cfg);
            stats.connections_accepted += 1;
            events.push_back(Event::PeerConnected { peer: id });
        }
    }

    fn poll_connects(&mut self, t: &mut dyn Transport, now_ms: u64) {
        let Self {
            cfg,
            peers,
            events,
            ..
        } = self;
        for peer in peers.iter_mut() {
            if peer.state != PeerState::Connecting {
                continue;
            }
            let Some(s) = peer.stream else { continue };
            match t.stream_connected(s) {
                Ok(true) => {
                    if let Err(e) = peer.set_state(PeerState::Connected) {
                        warn!(peer = %peer.id, error = %e, "connect completion in unexpected state");
                    }
                    peer.last_seen_ms = now_ms;
                    peer.last_ping_ms = now_ms;
                    send_capabilities(peer, cfg);
                    events.push_back(Event::PeerConnected { peer: peer.id });
                }
                Ok(false) => {
                    if now_ms.saturating_sub(peer.connect_started_ms) > cfg.connect_timeout_ms {
                        warn!(peer = %peer.id, "connect timed out");
                        teardown(t, peer, events, true);
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.id, error = %e, "connect failed");
                    teardown(t, peer, events, true);
                }
            }
        }
    }

    fn pump_streams(&mut self, t: &mut dyn Transport, now_ms: u64) {
        let Self {
            cfg,
            peers,
            events,
            stats,
            ..
        } = self;
        for peer in peers.iter_mut() {
            if !matches!(peer.state, PeerState::Connected | PeerState::Disconnecting) {
                continue;
            }
            let Some(s) = peer.stream else { continue };
            let mut closed = false;
            'read: for _ in 0..8 {
                let mut buf = [0u8; 2048];
                let n = match t.stream_recv(s, &mut buf) {
                    Ok(0) => {
                        debug!(peer = %peer.id, "stream closed by peer");
                        closed = true;
                        break;
                    }
                    Ok(n) => n,
                    Err(Error::WouldBlock) => break,
                    Err(e) => {
                        warn!(peer = %peer.id, error = %e, "stream read failed");
                        peer.stats.recv_errors += 1;
                        closed = true;
                        break;
                    }
                };
                peer.stats.bytes_received += n as u64;
                stats.bytes_received += n as u64;
                let mut off = 0;
                while off < n {
                    let (used, out) = peer.decoder.push(&buf[off..n]);
                    off += used;
                    match out {
                        None => {}
                        Some(Ok(frame)) => {
                            match handle_frame(cfg, peer, events, stats, frame, now_ms) {
                                FrameOutcome::Continue => {}
                                FrameOutcome::Close => {
                                    closed = true;
                                    break 'read;
                                }
                            }
                        }
                        Some(Err(Error::Checksum)) => {
                            warn!(peer = %peer.id, "checksum mismatch, frame dropped");
                            peer.stats.checksum_failures += 1;
                        }
                        Some(Err(e)) => {
                            // Framing desync: the byte stream cannot be
                            // trusted past this point.
                            warn!(peer = %peer.id, error = %e, "framing error, closing stream");
                            peer.stats.recv_errors += 1;
                            closed = true;
                            break 'read;
                        }
                    }
                }
            }
            if closed {
                teardown(t, peer, events, false);
            }
        }
    }

    fn flush_streams(&mut self, t: &mut dyn Transport) {
        let Self {
            peers,
            events,
            stats,
            ..
        } = self;
        for peer in peers.iter_mut() {
            if !matches!(peer.state, PeerState::Connected | PeerState::Disconnecting) {
                continue;
            }
            if peer.stream.is_none() {
                continue;
            }
            if let Err(e) = flush_peer(t, peer, events, stats) {
                warn!(peer = %peer.id, error = %e, "stream write failed");
                peer.stats.send_errors += 1;
                teardown(t, peer, events, true);
                continue;
            }
            if peer.state == PeerState::Disconnecting
                && peer.send_queue.is_empty()
                && peer.send_direct.is_idle()
                && peer.out_partial.is_empty()
            {
                teardown(t, peer, events, false);
            }
        }
    }

    fn pump_datagrams(&mut self, t: &mut dyn Transport) {
        let Self {
            peers,
            events,
            stats,
            ..
        } = self;
        let mut buf = [0u8; 2048];
        for _ in 0..16 {
            let (len, from) = match t.recv_datagram(&mut buf) {
                Ok(Some(x)) => x,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "datagram recv failed");
                    break;
                }
            };
            match decode_datagram(&buf[..len]) {
                Ok((sender_port, payload)) => {
                    let peer = peers
                        .find_by_addr(SocketAddr::new(from.ip(), sender_port))
                        .map(|p| p.id);
                    if let Some(id) = peer {
                        if let Some(p) = peers.get_mut(id) {
                            p.stats.messages_received += 1;
                            p.stats.bytes_received += len as u64;
                        }
                    }
                    stats.messages_received += 1;
                    stats.bytes_received += len as u64;
                    events.push_back(Event::DatagramReceived {
                        peer,
                        payload: payload.to_vec(),
                    });
                }
                Err(e) => warn!(%from, error = %e, "malformed datagram dropped"),
            }
        }
    }

    fn sweep(&mut self, t: &mut dyn Transport, now_ms: u64) {
        let Self {
            cfg,
            peers,
            events,
            ..
        } = self;
        // Keepalive pings on the announce cadence.
        for peer in peers.iter_mut() {
            if peer.state == PeerState::Connected
                && now_ms.saturating_sub(peer.last_ping_ms) >= cfg.discovery_interval_ms
            {
                queue_ping(peer, now_ms);
            }
        }
        if !cfg.auto_cleanup {
            return;
        }
        let mut lost: Vec<PeerId> = Vec::new();
        for peer in peers.iter_mut() {
            match peer.state {
                PeerState::Connected => {
                    if now_ms.saturating_sub(peer.last_seen_ms) > cfg.peer_timeout_ms {
                        warn!(peer = %peer.id, "peer timed out");
                        teardown(t, peer, events, true);
                    }
                }
                PeerState::Discovered | PeerState::Failed => {
                    if now_ms.saturating_sub(peer.last_seen_ms) > cfg.undiscovered_timeout_ms {
                        lost.push(peer.id);
                    }
                }
                _ => {}
            }
        }
        for id in lost {
            debug!(peer = %id, "stale peer removed");
            self.peers.remove(id);
            self.events.push_back(Event::PeerLost { peer: id });
        }
    }
}

fn local_caps(cfg: &Config, recv_pressure: u8) -> Capabilities {
    Capabilities {
        max_message_size: cfg.max_message_size as u16,
        preferred_chunk: cfg.preferred_chunk as u16,
        flags: if cfg.enable_fragmentation {
            CAP_FLAG_FRAGMENT
        } else {
            0
        },
        queue_pressure: recv_pressure,
    }
}

fn queue_control(peer: &mut Peer, kind: MessageKind, payload: Vec<u8>, key: u32) {
    let m = QueuedMessage {
        kind,
        flags: 0,
        sequence: 0,
        priority: Priority::Critical,
        coalesce_key: key,
        payload,
    };
    if let Err(e) = peer.send_queue.push(m) {
        warn!(peer = %peer.id, error = %e, "control message dropped");
        peer.stats.send_errors += 1;
    }
}

fn queue_ping(peer: &mut Peer, now_ms: u64) {
    peer.last_ping_ms = now_ms;
    peer.ping_sent_ms = Some(now_ms);
    queue_control(
        peer,
        MessageKind::Ping,
        now_ms.to_be_bytes().to_vec(),
        KEY_PING,
    );
}

fn send_capabilities(peer: &mut Peer, cfg: &Config) {
    let pct = peer.recv_queue.pressure_percent();
    let payload = local_caps(cfg, pct).encode().to_vec();
    queue_control(peer, MessageKind::Capability, payload, KEY_CAPS);
    peer.last_pressure_reported = pct;
}

fn maybe_report_pressure(cfg: &Config, peer: &mut Peer) {
    let pct = peer.recv_queue.pressure_percent();
    if caps::pressure_crossed(peer.last_pressure_reported, pct) {
        send_capabilities(peer, cfg);
    }
}

fn deliver(cfg: &Config, peer: &mut Peer, events: &mut VecDeque<Event>, payload: Vec<u8>) {
    if payload.len() <= DIRECT_THRESHOLD {
        let m = QueuedMessage {
            kind: MessageKind::Data,
            flags: 0,
            sequence: 0,
            priority: Priority::High,
            coalesce_key: 0,
            payload,
        };
        if peer.recv_queue.push(m).is_err() {
            warn!(peer = %peer.id, "receive queue full, message dropped");
            peer.stats.recv_errors += 1;
            maybe_report_pressure(cfg, peer);
            return;
        }
    } else if peer.recv_large.is_none() {
        peer.recv_large = Some(payload);
    } else {
        warn!(peer = %peer.id, "large receive slot occupied, message dropped");
        peer.stats.recv_errors += 1;
        return;
    }
    events.push_back(Event::MessageReady { peer: peer.id });
    maybe_report_pressure(cfg, peer);
}

fn handle_frame(
    cfg: &Config,
    peer: &mut Peer,
    events: &mut VecDeque<Event>,
    stats: &mut GlobalStats,
    frame: Frame,
    now_ms: u64,
) -> FrameOutcome {
    peer.last_seen_ms = now_ms;
    peer.stats.messages_received += 1;
    stats.messages_received += 1;
    match frame.header.kind {
        MessageKind::Data => {
            // Best effort: priority queues reorder, so gaps are a
            // diagnostic, not a delivery guarantee.
            if let Some(last) = peer.last_recv_seq {
                if frame.header.sequence != last.wrapping_add(1) {
                    peer.stats.sequence_gaps += 1;
                }
            }
            peer.last_recv_seq = Some(frame.header.sequence);
            if frame.header.flags & FLAG_FRAGMENT != 0 {
                peer.stats.fragments_received += 1;
                match peer.reassembler.accept(&frame.payload) {
                    Ok(Some(done)) => deliver(cfg, peer, events, done),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(peer = %peer.id, error = %e, "bad fragment dropped");
                        peer.stats.recv_errors += 1;
                    }
                }
            } else {
                deliver(cfg, peer, events, frame.payload);
            }
        }
        MessageKind::Ping => {
            queue_control(peer, MessageKind::Pong, frame.payload, 0);
        }
        MessageKind::Pong => {
            if frame.payload.len() >= 8 {
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&frame.payload[..8]);
                let sample = now_ms.saturating_sub(u64::from_be_bytes(ts));
                peer.record_latency(sample.min(u32::MAX as u64) as u32);
            }
            peer.ping_sent_ms = None;
        }
        MessageKind::Disconnect => {
            debug!(peer = %peer.id, "disconnect requested by peer");
            return FrameOutcome::Close;
        }
        MessageKind::Ack => {}
        MessageKind::Capability => match Capabilities::decode(&frame.payload) {
            Ok(c) => {
                peer.caps = Some(c);
                events.push_back(Event::CapabilityUpdated { peer: peer.id });
            }
            Err(e) => {
                warn!(peer = %peer.id, error = %e, "bad capability payload");
                peer.stats.recv_errors += 1;
            }
        },
    }
    FrameOutcome::Continue
}

fn start_transfer_inner(cfg: &Config, peer: &mut Peer, payload: &[u8]) -> Result<u16> {
    if !cfg.enable_fragmentation {
        return Err(Error::NotSupported);
    }
    let Some(pc) = peer.caps else {
        return Err(Error::NotSupported);
    };
    if !pc.supports_fragments() {
        return Err(Error::NotSupported);
    }
    if peer.transfer.is_some() {
        return Err(Error::Busy);
    }
    if payload.len() > MAX_TRANSFER_SIZE {
        return Err(Error::MessageTooLarge);
    }
    let local = local_caps(cfg, peer.recv_queue.pressure_percent());
    let eff_max = caps::effective_max(&local, &pc);
    let chunk = caps::effective_chunk(&local, &pc)
        .min(eff_max.saturating_sub(FRAGMENT_HEADER_SIZE))
        .max(1);
    let message_id = peer.take_message_id();
    let tx = OutboundTransfer::new(message_id, payload.to_vec(), chunk)?;
    debug!(
        peer = %peer.id,
        message_id,
        fragments = tx.fragment_count(),
        "transfer started"
    );
    peer.transfer = Some(tx);
    Ok(message_id)
}

/// Close the stream, abandon connection-scoped work, and report it.
fn teardown(t: &mut dyn Transport, peer: &mut Peer, events: &mut VecDeque<Event>, failed: bool) {
    if let Some(s) = peer.stream {
        t.stream_close(s);
    }
    if let Some(tx) = peer.transfer.take() {
        events.push_back(Event::TransferCancelled {
            peer: peer.id,
            message_id: tx.message_id(),
        });
    }
    peer.reset_connection();
    let target = if failed {
        PeerState::Failed
    } else {
        PeerState::Discovered
    };
    if let Err(e) = peer.set_state(target) {
        warn!(peer = %peer.id, error = %e, "teardown in unexpected state");
        peer.state = target;
    }
    events.push_back(if failed {
        Event::PeerFailed { peer: peer.id }
    } else {
        Event::PeerDisconnected { peer: peer.id }
    });
}

/// Drain outbound state for one peer: partial frame, direct buffer (staging
/// the next transfer fragment when idle), then Tier 1 slots.
fn flush_peer(
    t: &mut dyn Transport,
    peer: &mut Peer,
    events: &mut VecDeque<Event>,
    stats: &mut GlobalStats,
) -> Result<()> {
    let Some(s) = peer.stream else {
        return Ok(());
    };

    while !peer.out_partial.is_empty() {
        match t.stream_send(s, &peer.out_partial[peer.out_partial_sent..]) {
            Ok(0) | Err(Error::WouldBlock) => return Ok(()),
            Ok(n) => {
                peer.out_partial_sent += n;
                peer.stats.bytes_sent += n as u64;
                stats.bytes_sent += n as u64;
                if peer.out_partial_sent == peer.out_partial.len() {
                    peer.out_partial.clear();
                    peer.out_partial_sent = 0;
                }
            }
            Err(e) => return Err(e),
        }
    }

    // One fragment per cycle keeps a transfer from starving other peers.
    if peer.send_direct.is_idle() {
        if let Some(frag) = peer.transfer.as_ref().and_then(|tx| tx.next_fragment()) {
            let sequence = peer.take_seq();
            let mid = peer.transfer.as_ref().map(|tx| tx.message_id()).unwrap_or(0);
            let frame = encode_message(MessageKind::Data, FLAG_FRAGMENT, sequence, &frag)?;
            if peer.send_direct.queue(&frame, TAG_FRAGMENT | mid as u32).is_ok() {
                if let Some(tx) = peer.transfer.as_mut() {
                    tx.advance();
                }
                peer.stats.fragments_sent += 1;
            }
        }
    }

    while !peer.send_direct.is_idle() {
        let n = match t.stream_send(s, peer.send_direct.remaining()) {
            Ok(0) | Err(Error::WouldBlock) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e),
        };
        peer.stats.bytes_sent += n as u64;
        stats.bytes_sent += n as u64;
        if peer.send_direct.advance(n)? {
            peer.stats.messages_sent += 1;
            stats.messages_sent += 1;
            if peer.send_direct.tag() & TAG_FRAGMENT != 0 {
                let done = peer.transfer.as_ref().map(|tx| tx.is_done()).unwrap_or(false);
                if done {
                    if let Some(tx) = peer.transfer.take() {
                        events.push_back(Event::TransferComplete {
                            peer: peer.id,
                            message_id: tx.message_id(),
                        });
                    }
                }
            }
        }
    }

    // Peek, attempt the send, and only commit once the transport took
    // bytes. On WouldBlock the entry stays queued, so pressure keeps
    // counting it and a coalesced replacement can still land.
    loop {
        if !t.stream_writable(s) {
            return Ok(());
        }
        let Some(m) = peer.send_queue.peek() else {
            break;
        };
        let frame = encode_message(m.kind, m.flags, m.sequence, &m.payload)?;
        match t.stream_send(s, &frame) {
            Ok(0) | Err(Error::WouldBlock) => return Ok(()),
            Ok(n) => {
                peer.send_queue.commit();
                peer.stats.messages_sent += 1;
                stats.messages_sent += 1;
                peer.stats.bytes_sent += n as u64;
                stats.bytes_sent += n as u64;
                if n < frame.len() {
                    // Bytes are on the wire; the rest resumes next cycle.
                    peer.out_partial = frame;
                    peer.out_partial_sent = n;
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamId;
    use std::cell::RefCell;
    use std::net::IpAddr;
    use std::rc::Rc;

    #[derive(Default)]
    struct Shared {
        disc: [VecDeque<(Vec<u8>, SocketAddr)>; 2],
        dgram: [VecDeque<(Vec<u8>, SocketAddr)>; 2],
        stream_to: [VecDeque<u8>; 2],
        read_closed: [bool; 2],
        connect_from: Option<usize>,
        accepted: bool,
        write_cap: Option<usize>,
    }

    /// One side of an in-memory two-host network.
    struct LoopEnd {
        sh: Rc<RefCell<Shared>>,
        side: usize,
    }

    fn side_ip(side: usize) -> IpAddr {
        IpAddr::from([10, 0, 0, 1 + side as u8])
    }

    fn pair() -> (LoopEnd, LoopEnd) {
        let sh = Rc::new(RefCell::new(Shared::default()));
        (
            LoopEnd {
                sh: sh.clone(),
                side: 0,
            },
            LoopEnd { sh, side: 1 },
        )
    }

    impl LoopEnd {
        fn other(&self) -> usize {
            1 - self.side
        }

        fn side_of(&self, ip: IpAddr) -> Option<usize> {
            (0..2).find(|&s| side_ip(s) == ip)
        }

        fn set_write_cap(&self, cap: Option<usize>) {
            self.sh.borrow_mut().write_cap = cap;
        }
    }

    impl Transport for LoopEnd {
        fn broadcast_discovery(&mut self, _port: u16, buf: &[u8]) -> Result<()> {
            let from = SocketAddr::new(side_ip(self.side), 7353);
            let mut sh = self.sh.borrow_mut();
            sh.disc[0].push_back((buf.to_vec(), from));
            sh.disc[1].push_back((buf.to_vec(), from));
            Ok(())
        }

        fn send_discovery(&mut self, addr: SocketAddr, buf: &[u8]) -> Result<()> {
            let dest = self.side_of(addr.ip()).ok_or(Error::Network)?;
            let from = SocketAddr::new(side_ip(self.side), 7353);
            self.sh.borrow_mut().disc[dest].push_back((buf.to_vec(), from));
            Ok(())
        }

        fn recv_discovery(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
            match self.sh.borrow_mut().disc[self.side].pop_front() {
                Some((pkt, from)) => {
                    buf[..pkt.len()].copy_from_slice(&pkt);
                    Ok(Some((pkt.len(), from)))
                }
                None => Ok(None),
            }
        }

        fn connect(&mut self, _addr: SocketAddr) -> Result<StreamId> {
            self.sh.borrow_mut().connect_from = Some(self.side);
            Ok(1)
        }

        fn accept(&mut self) -> Result<Option<(StreamId, SocketAddr)>> {
            let mut sh = self.sh.borrow_mut();
            if sh.connect_from == Some(self.other()) && !sh.accepted {
                sh.accepted = true;
                return Ok(Some((1, SocketAddr::new(side_ip(self.other()), 49152))));
            }
            Ok(None)
        }

        fn stream_connected(&mut self, _id: StreamId) -> Result<bool> {
            Ok(self.sh.borrow().accepted)
        }

        fn stream_writable(&mut self, _id: StreamId) -> bool {
            true
        }

        fn stream_send(&mut self, _id: StreamId, buf: &[u8]) -> Result<usize> {
            let other = self.other();
            let mut sh = self.sh.borrow_mut();
            if !sh.accepted {
                return Err(Error::WouldBlock);
            }
            if sh.read_closed[other] {
                return Err(Error::ConnectionClosed);
            }
            let n = sh.write_cap.unwrap_or(usize::MAX).min(buf.len());
            if n == 0 {
                return Err(Error::WouldBlock);
            }
            sh.stream_to[other].extend(&buf[..n]);
            Ok(n)
        }

        fn stream_recv(&mut self, _id: StreamId, buf: &mut [u8]) -> Result<usize> {
            let mut sh = self.sh.borrow_mut();
            if sh.stream_to[self.side].is_empty() {
                if sh.read_closed[self.side] {
                    return Ok(0);
                }
                return Err(Error::WouldBlock);
            }
            let mut n = 0;
            while n < buf.len() {
                match sh.stream_to[self.side].pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn stream_close(&mut self, _id: StreamId) {
            let other = self.other();
            self.sh.borrow_mut().read_closed[other] = true;
        }

        fn send_datagram(&mut self, addr: SocketAddr, buf: &[u8]) -> Result<()> {
            let dest = self.side_of(addr.ip()).ok_or(Error::Network)?;
            let from = SocketAddr::new(side_ip(self.side), 7355);
            self.sh.borrow_mut().dgram[dest].push_back((buf.to_vec(), from));
            Ok(())
        }

        fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
            match self.sh.borrow_mut().dgram[self.side].pop_front() {
                Some((pkt, from)) => {
                    buf[..pkt.len()].copy_from_slice(&pkt);
                    Ok(Some((pkt.len(), from)))
                }
                None => Ok(None),
            }
        }

        fn is_local_addr(&self, addr: &SocketAddr) -> bool {
            addr.ip() == side_ip(self.side)
        }
    }

    fn cfg(name: &str) -> Config {
        Config {
            local_name: name.into(),
            ..Config::default()
        }
    }

    fn drain(e: &mut Engine) -> Vec<Event> {
        std::iter::from_fn(|| e.poll_event()).collect()
    }

    /// Discover, connect, and exchange capabilities between two engines.
    fn connected_pair(
        cfg_a: Config,
        cfg_b: Config,
    ) -> (Engine, Engine, LoopEnd, LoopEnd, PeerId, PeerId) {
        let (mut ta, mut tb) = pair();
        let mut a = Engine::new(cfg_a);
        let mut b = Engine::new(cfg_b);
        a.start_discovery().unwrap();
        b.start_discovery().unwrap();
        a.start_listening();
        b.start_listening();

        a.service(&mut ta, 0);
        b.service(&mut tb, 0);
        a.service(&mut ta, 10);

        let a_in_b = b.find_peer("alice").unwrap();
        let b_in_a = a.find_peer("bob").unwrap();

        b.connect(&mut tb, a_in_b, 10).unwrap();
        b.service(&mut tb, 20);
        a.service(&mut ta, 20);
        b.service(&mut tb, 30);
        a.service(&mut ta, 40);

        (a, b, ta, tb, b_in_a, a_in_b)
    }

    #[test]
    fn discovery_and_connect() {
        let (a, b, _ta, _tb, b_in_a, a_in_b) = {
            let (mut a, mut b, ta, tb, b_in_a, a_in_b) =
                connected_pair(cfg("alice"), cfg("bob"));
            let ea = drain(&mut a);
            let eb = drain(&mut b);
            assert!(ea.contains(&Event::PeerDiscovered { peer: b_in_a }));
            assert!(ea.contains(&Event::PeerConnected { peer: b_in_a }));
            assert!(ea.contains(&Event::CapabilityUpdated { peer: b_in_a }));
            assert!(eb.contains(&Event::PeerDiscovered { peer: a_in_b }));
            assert!(eb.contains(&Event::PeerConnected { peer: a_in_b }));
            assert!(eb.contains(&Event::CapabilityUpdated { peer: a_in_b }));
            (a, b, ta, tb, b_in_a, a_in_b)
        };
        assert_eq!(a.peer_state(b_in_a), Some(PeerState::Connected));
        assert_eq!(b.peer_state(a_in_b), Some(PeerState::Connected));
        assert!(a.peer_capabilities(b_in_a).is_some());
        assert_eq!(a.effective_max(b_in_a), Some(4096));
        assert_eq!(b.peer_name(a_in_b), Some("alice"));
        assert!(a.stats().connections_accepted >= 1);
    }

    #[test]
    fn small_message_roundtrip() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        a.send(b_in_a, b"hello bob").unwrap();
        a.service(&mut ta, 50);
        b.service(&mut tb, 60);
        assert!(drain(&mut b).contains(&Event::MessageReady { peer: a_in_b }));
        assert_eq!(b.recv(a_in_b).unwrap().unwrap(), b"hello bob");
        assert_eq!(b.recv(a_in_b).unwrap(), None);
        assert!(b.peer_stats(a_in_b).unwrap().messages_received >= 1);
    }

    #[test]
    fn large_message_uses_direct_buffer() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        a.send(b_in_a, &payload).unwrap();
        // A second large message cannot stage while the first waits.
        assert_eq!(a.send(b_in_a, &payload), Err(Error::WouldBlock));
        a.service(&mut ta, 50);
        b.service(&mut tb, 60);
        assert_eq!(b.recv(a_in_b).unwrap().unwrap(), payload);
        // Buffer is free again.
        a.send(b_in_a, &payload).unwrap();
    }

    #[test]
    fn partial_writes_still_deliver() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        ta.set_write_cap(Some(7));
        a.send(b_in_a, b"resumes across short writes").unwrap();
        for i in 0..12 {
            a.service(&mut ta, 50 + i);
            b.service(&mut tb, 55 + i);
        }
        assert_eq!(
            b.recv(a_in_b).unwrap().unwrap(),
            b"resumes across short writes"
        );
    }

    #[test]
    fn oversized_send_fragments_transparently() {
        let mut small = cfg("bob");
        small.max_message_size = 512;
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), small);
        drain(&mut a);
        drain(&mut b);

        assert_eq!(a.effective_max(b_in_a), Some(512));
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        a.send(b_in_a, &payload).unwrap();
        for i in 0..10 {
            a.service(&mut ta, 100 + i * 10);
            b.service(&mut tb, 105 + i * 10);
        }
        let ea = drain(&mut a);
        assert!(ea
            .iter()
            .any(|e| matches!(e, Event::TransferComplete { peer, .. } if *peer == b_in_a)));
        assert!(drain(&mut b).contains(&Event::MessageReady { peer: a_in_b }));
        assert_eq!(b.recv(a_in_b).unwrap().unwrap(), payload);
        assert!(a.peer_stats(b_in_a).unwrap().fragments_sent >= 4);
        assert!(b.peer_stats(a_in_b).unwrap().fragments_received >= 4);
    }

    #[test]
    fn explicit_transfer_and_cancel() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, _a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        let payload = vec![0x42u8; 20_000];
        let mid = a.start_transfer(b_in_a, &payload).unwrap();
        // Only one transfer at a time.
        assert_eq!(a.start_transfer(b_in_a, &payload), Err(Error::Busy));
        a.service(&mut ta, 50);
        b.service(&mut tb, 60);
        a.cancel_transfer(b_in_a, mid).unwrap();
        assert!(drain(&mut a).contains(&Event::TransferCancelled {
            peer: b_in_a,
            message_id: mid
        }));
        // A new transfer can start after cancellation.
        a.start_transfer(b_in_a, b"fresh").unwrap();
    }

    #[test]
    fn transfer_size_cap() {
        let (mut a, _b, _ta, _tb, b_in_a, _a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        let too_big = vec![0u8; MAX_TRANSFER_SIZE + 1];
        assert_eq!(
            a.start_transfer(b_in_a, &too_big),
            Err(Error::MessageTooLarge)
        );
    }

    #[test]
    fn disconnect_is_orderly_on_both_sides() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        a.disconnect(b_in_a).unwrap();
        a.service(&mut ta, 50);
        b.service(&mut tb, 60);
        assert!(drain(&mut a).contains(&Event::PeerDisconnected { peer: b_in_a }));
        assert!(drain(&mut b).contains(&Event::PeerDisconnected { peer: a_in_b }));
        assert_eq!(a.peer_state(b_in_a), Some(PeerState::Discovered));
        assert_eq!(b.peer_state(a_in_b), Some(PeerState::Discovered));
        // Sending to a disconnected peer is a state error.
        assert_eq!(a.send(b_in_a, b"late"), Err(Error::InvalidState));
    }

    #[test]
    fn queue_backpressure_and_exhaustion() {
        let (mut a, _b, _ta, _tb, b_in_a, _a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));

        // Default queue has 16 slots. Normal priority is refused at 75%.
        for i in 0..12 {
            a.send(b_in_a, &[i]).unwrap();
        }
        assert_eq!(a.send(b_in_a, b"x"), Err(Error::Backpressure));
        let high = SendOptions {
            priority: Priority::High,
            coalesce_key: 0,
        };
        for i in 0..4u8 {
            a.send_ex(b_in_a, &[100 + i], high).unwrap();
        }
        assert_eq!(a.send_ex(b_in_a, b"x", high), Err(Error::BufferFull));
        assert_eq!(a.send_pressure(b_in_a), Some(100));
    }

    #[test]
    fn coalesced_sends_replace() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        let opts = SendOptions {
            priority: Priority::Normal,
            coalesce_key: 9,
        };
        a.send_ex(b_in_a, b"stale state", opts).unwrap();
        a.send_ex(b_in_a, b"fresh state", opts).unwrap();
        a.service(&mut ta, 50);
        b.service(&mut tb, 60);
        assert_eq!(b.recv(a_in_b).unwrap().unwrap(), b"fresh state");
        assert_eq!(b.recv(a_in_b).unwrap(), None);
    }

    #[test]
    fn blocked_send_keeps_slot_until_accepted() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        let opts = SendOptions {
            priority: Priority::Normal,
            coalesce_key: 3,
        };
        ta.set_write_cap(Some(0));
        a.send_ex(b_in_a, b"v1", opts).unwrap();
        a.service(&mut ta, 50);
        // The socket took nothing, so the entry still occupies its slot
        // and pressure reports it.
        assert_eq!(a.send_pressure(b_in_a), Some(6));
        // And it is still replaceable by its coalesce key.
        a.send_ex(b_in_a, b"v2", opts).unwrap();
        ta.set_write_cap(None);
        a.service(&mut ta, 60);
        b.service(&mut tb, 70);
        assert_eq!(b.recv(a_in_b).unwrap().unwrap(), b"v2");
        assert_eq!(b.recv(a_in_b).unwrap(), None);
    }

    #[test]
    fn ping_pong_updates_latency() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, _a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        a.service(&mut ta, 6000); // keepalive ping queued
        a.service(&mut ta, 6001); // flushed
        b.service(&mut tb, 6010); // pong sent back
        a.service(&mut ta, 6020);
        let (latency, quality) = a.peer_latency(b_in_a).unwrap();
        assert_eq!(latency, 20);
        assert_eq!(quality, 50);
    }

    #[test]
    fn unreliable_datagram_roundtrip() {
        let (mut a, mut b, mut ta, mut tb, b_in_a, a_in_b) =
            connected_pair(cfg("alice"), cfg("bob"));
        drain(&mut a);
        drain(&mut b);

        a.send_datagram(&mut ta, b_in_a, b"fast state").unwrap();
        b.service(&mut tb, 50);
        let eb = drain(&mut b);
        assert!(eb.contains(&Event::DatagramReceived {
            peer: Some(a_in_b),
            payload: b"fast state".to_vec()
        }));
    }

    #[test]
    fn undiscovered_peer_expires() {
        let (mut ta, mut tb) = pair();
        let mut a = Engine::new(cfg("alice"));
        let mut b = Engine::new(cfg("bob"));
        a.start_discovery().unwrap();
        b.start_discovery().unwrap();
        a.service(&mut ta, 0);
        b.service(&mut tb, 0);
        let a_in_b = b.find_peer("alice").unwrap();
        drain(&mut b);

        // Alice goes silent; her record ages out of Bob's registry.
        b.service(&mut tb, 40_000);
        assert!(drain(&mut b).contains(&Event::PeerLost { peer: a_in_b }));
        assert!(b.find_peer("alice").is_none());
    }

    #[test]
    fn send_requires_known_connected_peer() {
        let mut e = Engine::new(cfg("solo"));
        assert_eq!(e.send(PeerId(7), b"x"), Err(Error::PeerNotFound));
        assert_eq!(e.recv(PeerId(7)), Err(Error::PeerNotFound));
        assert_eq!(e.start_discovery(), Ok(()));
        assert_eq!(e.start_discovery(), Err(Error::DiscoveryActive));
    }
}

//! Peer records, lifecycle state machine, and the bounded registry.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use tracing::{debug, info};

use crate::caps::Capabilities;
use crate::config::Config;
use crate::direct::DirectBuffer;
use crate::error::{Error, Result};
use crate::fragment::{OutboundTransfer, Reassembler};
use crate::queue::SlotQueue;
use crate::transport::StreamId;
use crate::wire::{FrameDecoder, CHECKSUM_SIZE, MESSAGE_HEADER_SIZE};

/// Stable peer handle, valid until the record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Connection lifecycle. Records only exist while discovered or beyond, so
/// there is no unused state; removal is the terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl PeerState {
    /// Valid lifecycle edges. Everything may fail; Failed may retry.
    pub fn can_transition(self, to: PeerState) -> bool {
        use PeerState::*;
        match (self, to) {
            (Discovered, Connecting) => true,
            // Inbound accept skips Connecting.
            (Discovered, Connected) => true,
            (Connecting, Connected) => true,
            (Connected, Disconnecting) => true,
            // Teardown returns the record to Discovered for reconnects.
            (Connected, Discovered) => true,
            (Disconnecting, Discovered) => true,
            (Failed, Connecting) => true,
            // Inbound accept may arrive while we consider the peer failed.
            (Failed, Connected) => true,
            (Failed, Discovered) => true,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// Per-peer traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub checksum_failures: u64,
    pub sequence_gaps: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
}

/// Engine-wide counters, independent of any one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub discovery_sent: u64,
    pub discovery_received: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl GlobalStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Link quality step function from the rolling latency average.
pub fn quality_from_latency(latency_ms: u32) -> u8 {
    match latency_ms {
        0..=4 => 100,
        5..=9 => 90,
        10..=19 => 75,
        20..=49 => 50,
        _ => 25,
    }
}

/// Everything the engine tracks about one remote peer.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    /// Stream listener address (discovery source ip + advertised port).
    pub addr: SocketAddr,
    pub datagram_addr: SocketAddr,
    pub state: PeerState,
    pub flags: u16,
    pub transports: u8,
    pub stream: Option<StreamId>,

    pub send_queue: SlotQueue,
    pub recv_queue: SlotQueue,
    pub send_direct: DirectBuffer,
    /// One large inbound message held until the host collects it.
    pub recv_large: Option<Vec<u8>>,
    /// Partial Tier 1 frame write carried across service cycles.
    pub out_partial: Vec<u8>,
    pub out_partial_sent: usize,

    pub decoder: FrameDecoder,
    pub caps: Option<Capabilities>,
    pub last_pressure_reported: u8,

    pub next_seq: u8,
    pub last_recv_seq: Option<u8>,
    pub reassembler: Reassembler,
    pub transfer: Option<OutboundTransfer>,
    pub next_message_id: u16,

    pub last_seen_ms: u64,
    pub connect_started_ms: u64,
    pub last_ping_ms: u64,
    pub ping_sent_ms: Option<u64>,
    pub latency_ms: u32,
    pub quality: u8,

    pub stats: PeerStats,
}

impl Peer {
    fn new(id: PeerId, name: String, addr: SocketAddr, datagram_addr: SocketAddr, cfg: &Config, now_ms: u64) -> Self {
        let frame_capacity = cfg.direct_buffer_size + MESSAGE_HEADER_SIZE + CHECKSUM_SIZE;
        Self {
            id,
            name,
            addr,
            datagram_addr,
            state: PeerState::Discovered,
            flags: 0,
            transports: 0,
            stream: None,
            send_queue: SlotQueue::new(cfg.queue_slots),
            recv_queue: SlotQueue::new(cfg.queue_slots),
            send_direct: DirectBuffer::new(frame_capacity),
            recv_large: None,
            out_partial: Vec::new(),
            out_partial_sent: 0,
            decoder: FrameDecoder::new(cfg.max_message_size),
            caps: None,
            last_pressure_reported: 0,
            next_seq: 0,
            last_recv_seq: None,
            reassembler: Reassembler::default(),
            transfer: None,
            next_message_id: 1,
            last_seen_ms: now_ms,
            connect_started_ms: 0,
            last_ping_ms: 0,
            ping_sent_ms: None,
            latency_ms: 0,
            quality: 0,
            stats: PeerStats::default(),
        }
    }

    /// Validated lifecycle transition.
    pub fn set_state(&mut self, to: PeerState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(Error::InvalidState);
        }
        if to == PeerState::Connected {
            info!(peer = %self.id, name = %self.name, "peer connected");
        } else {
            debug!(peer = %self.id, from = ?self.state, to = ?to, "peer state change");
        }
        self.state = to;
        Ok(())
    }

    /// Rolling latency average and the derived quality score.
    pub fn record_latency(&mut self, sample_ms: u32) {
        self.latency_ms = if self.latency_ms == 0 {
            sample_ms
        } else {
            (self.latency_ms * 3 + sample_ms) / 4
        };
        self.quality = quality_from_latency(self.latency_ms);
    }

    /// Next Data sequence number, wrapping.
    pub fn take_seq(&mut self) -> u8 {
        let s = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        s
    }

    /// Next fragment message id, wrapping but never zero.
    pub fn take_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Clear connection-scoped state; the record itself survives.
    pub fn reset_connection(&mut self) {
        self.stream = None;
        self.send_queue.clear();
        self.recv_queue.clear();
        self.send_direct.reset();
        self.recv_large = None;
        self.out_partial.clear();
        self.out_partial_sent = 0;
        self.decoder.reset();
        self.caps = None;
        self.reassembler.reset();
        self.transfer = None;
        self.ping_sent_ms = None;
    }
}

/// Bounded peer registry: fixed slot array, id map for O(1) lookup, and a
/// dense active list so iteration touches only live peers. Removal swaps
/// the last active entry back into the hole.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Option<Peer>>,
    by_id: HashMap<PeerId, usize>,
    active: Vec<usize>,
    next_id: u16,
}

impl Registry {
    pub fn new(max_peers: usize) -> Self {
        let mut slots = Vec::with_capacity(max_peers);
        slots.resize_with(max_peers, || None);
        Self {
            slots,
            by_id: HashMap::with_capacity(max_peers),
            active: Vec::with_capacity(max_peers),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.active.len() == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Create a record in Discovered state.
    pub fn insert(
        &mut self,
        name: String,
        addr: SocketAddr,
        datagram_addr: SocketAddr,
        cfg: &Config,
        now_ms: u64,
    ) -> Result<PeerId> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::BufferFull)?;
        let id = PeerId(self.next_id);
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        self.slots[slot] = Some(Peer::new(id, name, addr, datagram_addr, cfg, now_ms));
        self.by_id.insert(id, slot);
        self.active.push(slot);
        Ok(id)
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.by_id.get(&id).and_then(|&i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.by_id.get(&id).and_then(|&i| self.slots[i].as_mut())
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let slot = self.by_id.remove(&id)?;
        let peer = self.slots[slot].take()?;
        if let Some(pos) = self.active.iter().position(|&i| i == slot) {
            self.active.swap_remove(pos);
        }
        Some(peer)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Peer> {
        self.iter().find(|p| p.name == name)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.iter().find(|p| p.addr == addr)
    }

    pub fn find_by_stream(&self, stream: StreamId) -> Option<PeerId> {
        self.iter().find(|p| p.stream == Some(stream)).map(|p| p.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.active.iter().filter_map(|&i| self.slots[i].as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        let slots = &mut self.slots;
        // The active list never holds duplicate slot indices.
        slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.iter().map(|p| p.id).collect()
    }

    pub fn count_in_state(&self, state: PeerState) -> usize {
        self.iter().filter(|p| p.state == state).count()
    }
}

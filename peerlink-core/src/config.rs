//! Engine configuration. Zero/default values fall back to wire defaults.

use serde::{Deserialize, Serialize};

/// Default well-known ports.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7353;
pub const DEFAULT_STREAM_PORT: u16 = 7354;
pub const DEFAULT_DATAGRAM_PORT: u16 = 7355;

/// Tier 2 direct buffer bounds.
pub const DIRECT_BUFFER_DEFAULT: usize = 4096;
pub const DIRECT_BUFFER_MAX: usize = 8192;

/// Messages at or below this length ride Tier 1 slots; larger go to Tier 2.
pub const DIRECT_THRESHOLD: usize = 256;

/// Largest framed message payload the engine will accept.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Largest streaming transfer (fragmented across many frames). The
/// fragment header carries total length as a u16.
pub const MAX_TRANSFER_SIZE: usize = 65535;

/// Peer display names are capped at 31 bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Engine configuration, mirrored from the host's config loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local display name, truncated to 31 bytes on the wire.
    pub local_name: String,
    /// Transport capability bitmask advertised in discovery.
    pub transports: u8,
    pub discovery_port: u16,
    pub stream_port: u16,
    pub datagram_port: u16,
    /// Maximum peer records; inbound connections beyond this are rejected.
    pub max_peers: usize,
    /// Tier 1 queue capacity per direction per peer (power of two).
    pub queue_slots: usize,
    /// Discovery announce interval in milliseconds.
    pub discovery_interval_ms: u64,
    /// Timeout for connected peers with no traffic.
    pub peer_timeout_ms: u64,
    /// Timeout for peers stuck in Discovered.
    pub undiscovered_timeout_ms: u64,
    /// Deadline for an in-progress connect.
    pub connect_timeout_ms: u64,
    /// Accept inbound connections without host involvement.
    pub auto_accept: bool,
    /// Sweep timed-out peers automatically.
    pub auto_cleanup: bool,
    /// Tier 2 buffer capacity (clamped to 8192).
    pub direct_buffer_size: usize,
    /// Our advertised maximum message size.
    pub max_message_size: usize,
    /// Our preferred fragment chunk size.
    pub preferred_chunk: usize,
    /// Split messages exceeding the negotiated maximum.
    pub enable_fragmentation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: String::from("peerlink"),
            transports: crate::wire::TRANSPORT_STREAM | crate::wire::TRANSPORT_DATAGRAM,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            datagram_port: DEFAULT_DATAGRAM_PORT,
            max_peers: 16,
            queue_slots: 16,
            discovery_interval_ms: 5000,
            peer_timeout_ms: 15_000,
            undiscovered_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            auto_accept: true,
            auto_cleanup: true,
            direct_buffer_size: DIRECT_BUFFER_DEFAULT,
            max_message_size: MAX_MESSAGE_SIZE,
            preferred_chunk: 1024,
            enable_fragmentation: true,
        }
    }
}

impl Config {
    /// Clamp out-of-range values instead of failing init.
    pub fn sanitized(mut self) -> Self {
        if self.local_name.len() > MAX_NAME_LEN {
            let mut cut = MAX_NAME_LEN;
            while !self.local_name.is_char_boundary(cut) {
                cut -= 1;
            }
            self.local_name.truncate(cut);
        }
        if self.max_peers == 0 {
            self.max_peers = 16;
        }
        self.queue_slots = self.queue_slots.next_power_of_two().clamp(4, 64);
        self.direct_buffer_size = self.direct_buffer_size.clamp(512, DIRECT_BUFFER_MAX);
        // The advertised maximum must fit the Tier 2 buffer.
        self.max_message_size = self
            .max_message_size
            .clamp(DIRECT_THRESHOLD, MAX_MESSAGE_SIZE)
            .min(self.direct_buffer_size);
        if self.preferred_chunk == 0 || self.preferred_chunk > self.direct_buffer_size {
            self.preferred_chunk = 1024.min(self.direct_buffer_size);
        }
        if self.discovery_interval_ms == 0 {
            self.discovery_interval_ms = 5000;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_defaults() {
        let c = Config::default();
        assert_eq!(c.discovery_port, 7353);
        assert_eq!(c.stream_port, 7354);
        assert_eq!(c.datagram_port, 7355);
        assert_eq!(c.direct_buffer_size, 4096);
        assert_eq!(c.max_message_size, 8192);
        assert_eq!(c.preferred_chunk, 1024);
    }

    #[test]
    fn sanitize_clamps() {
        let mut c = Config::default();
        c.local_name = "x".repeat(64);
        c.queue_slots = 9;
        c.direct_buffer_size = 1 << 20;
        c.max_peers = 0;
        let c = c.sanitized();
        assert_eq!(c.local_name.len(), 31);
        assert_eq!(c.queue_slots, 16);
        assert_eq!(c.direct_buffer_size, DIRECT_BUFFER_MAX);
        assert_eq!(c.max_peers, 16);
    }
}

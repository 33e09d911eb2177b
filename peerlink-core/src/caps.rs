//! Capability exchange: receiver limits, pressure reporting, throttling.
//!
//! Both sides send a capability record right after connecting and again
//! whenever their receive-queue pressure crosses a reporting threshold. The
//! sender honors the peer's limits: effective message size is the minimum of
//! the two maxima, and outbound priority admission narrows as the peer's
//! reported pressure rises.

use crate::error::{Error, Result};
use crate::queue::Priority;

/// Capability payload length on the wire.
pub const CAPABILITY_SIZE: usize = 8;

/// Set when the sender can reassemble fragmented messages.
pub const CAP_FLAG_FRAGMENT: u16 = 0x0001;

/// Pressure thresholds that trigger a capability re-broadcast.
const REPORT_THRESHOLDS: [u8; 3] = [25, 50, 75];

/// A peer's advertised receive limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_message_size: u16,
    pub preferred_chunk: u16,
    pub flags: u16,
    /// Receive-queue fill percentage at send time.
    pub queue_pressure: u8,
}

impl Capabilities {
    pub fn supports_fragments(&self) -> bool {
        self.flags & CAP_FLAG_FRAGMENT != 0
    }

    pub fn encode(&self) -> [u8; CAPABILITY_SIZE] {
        let mut buf = [0u8; CAPABILITY_SIZE];
        buf[0..2].copy_from_slice(&self.max_message_size.to_be_bytes());
        buf[2..4].copy_from_slice(&self.preferred_chunk.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6] = self.queue_pressure;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CAPABILITY_SIZE {
            return Err(Error::Truncated);
        }
        Ok(Self {
            max_message_size: u16::from_be_bytes([buf[0], buf[1]]),
            preferred_chunk: u16::from_be_bytes([buf[2], buf[3]]),
            flags: u16::from_be_bytes([buf[4], buf[5]]),
            queue_pressure: buf[6],
        })
    }
}

/// The message size both sides can handle.
pub fn effective_max(local: &Capabilities, peer: &Capabilities) -> usize {
    local.max_message_size.min(peer.max_message_size) as usize
}

/// Fragment chunk size for a peer: the smaller preference, capped by the
/// effective maximum.
pub fn effective_chunk(local: &Capabilities, peer: &Capabilities) -> usize {
    let chunk = local.preferred_chunk.min(peer.preferred_chunk).max(1) as usize;
    chunk.min(effective_max(local, peer))
}

fn report_band(pct: u8) -> usize {
    REPORT_THRESHOLDS.iter().filter(|&&t| pct >= t).count()
}

/// True when pressure moved across 25/50/75 in either direction, meaning
/// the peer should hear about it.
pub fn pressure_crossed(old_pct: u8, new_pct: u8) -> bool {
    report_band(old_pct) != report_band(new_pct)
}

/// Lowest priority worth sending given the peer's reported pressure.
pub fn throttle_floor(peer_pressure: u8) -> Priority {
    match peer_pressure {
        0..=49 => Priority::Low,
        50..=74 => Priority::Normal,
        75..=89 => Priority::High,
        _ => Priority::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(max: u16, chunk: u16, pressure: u8) -> Capabilities {
        Capabilities {
            max_message_size: max,
            preferred_chunk: chunk,
            flags: CAP_FLAG_FRAGMENT,
            queue_pressure: pressure,
        }
    }

    #[test]
    fn codec_roundtrip() {
        let c = caps(8192, 1024, 42);
        let buf = c.encode();
        assert_eq!(Capabilities::decode(&buf).unwrap(), c);
        assert_eq!(Capabilities::decode(&buf[..7]), Err(Error::Truncated));
    }

    #[test]
    fn negotiation_takes_minimum() {
        let big = caps(8192, 2048, 0);
        let small = caps(1024, 512, 0);
        assert_eq!(effective_max(&big, &small), 1024);
        assert_eq!(effective_max(&small, &big), 1024);
        assert_eq!(effective_chunk(&big, &small), 512);
    }

    #[test]
    fn chunk_capped_by_effective_max() {
        let a = caps(256, 2048, 0);
        let b = caps(8192, 4096, 0);
        assert_eq!(effective_chunk(&a, &b), 256);
    }

    #[test]
    fn report_crossings() {
        assert!(!pressure_crossed(10, 20));
        assert!(pressure_crossed(20, 25));
        assert!(pressure_crossed(60, 40));
        assert!(!pressure_crossed(80, 89));
        assert!(pressure_crossed(74, 75));
    }

    #[test]
    fn throttle_bands() {
        assert_eq!(throttle_floor(0), Priority::Low);
        assert_eq!(throttle_floor(49), Priority::Low);
        assert_eq!(throttle_floor(50), Priority::Normal);
        assert_eq!(throttle_floor(75), Priority::High);
        assert_eq!(throttle_floor(90), Priority::Critical);
    }
}

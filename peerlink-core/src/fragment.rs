//! Fragmentation: splitting oversized payloads and reassembling them.
//!
//! A fragmented Data frame carries an 8-byte fragment header before the
//! chunk: message_id, fragment_index, fragment_count, total_length (all
//! u16 big-endian). Chunk size is derived as ceil(total/count), so a
//! fragment can be placed by index no matter the arrival order.

use tracing::warn;

use crate::config::MAX_TRANSFER_SIZE;
use crate::error::{Error, Result};

pub const FRAGMENT_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: u16,
    pub index: u16,
    pub count: u16,
    pub total: u16,
}

impl FragmentHeader {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.message_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..6].copy_from_slice(&self.count.to_be_bytes());
        buf[6..8].copy_from_slice(&self.total.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::Truncated);
        }
        let hdr = Self {
            message_id: u16::from_be_bytes([buf[0], buf[1]]),
            index: u16::from_be_bytes([buf[2], buf[3]]),
            count: u16::from_be_bytes([buf[4], buf[5]]),
            total: u16::from_be_bytes([buf[6], buf[7]]),
        };
        if hdr.count == 0 || hdr.total == 0 || hdr.index >= hdr.count {
            return Err(Error::InvalidParam);
        }
        Ok(hdr)
    }
}

fn chunk_len(total: usize, count: usize) -> usize {
    total.div_ceil(count)
}

/// An outbound payload being sent as fragments, one per service cycle.
///
/// The transfer survives across calls: each cycle the engine asks for the
/// next fragment, stages it in the Tier 2 buffer, and advances only once
/// staging succeeded.
#[derive(Debug)]
pub struct OutboundTransfer {
    message_id: u16,
    data: Vec<u8>,
    count: usize,
    next: usize,
}

impl OutboundTransfer {
    /// `chunk` is the negotiated fragment payload size.
    pub fn new(message_id: u16, data: Vec<u8>, chunk: usize) -> Result<Self> {
        if data.is_empty() || data.len() > MAX_TRANSFER_SIZE {
            return Err(Error::MessageTooLarge);
        }
        if chunk == 0 {
            return Err(Error::InvalidParam);
        }
        let count = data.len().div_ceil(chunk);
        if count > u16::MAX as usize {
            return Err(Error::MessageTooLarge);
        }
        Ok(Self {
            message_id,
            data,
            count,
            next: 0,
        })
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn fragment_count(&self) -> usize {
        self.count
    }

    pub fn fragments_sent(&self) -> usize {
        self.next
    }

    pub fn is_done(&self) -> bool {
        self.next == self.count
    }

    /// Build the next fragment payload (header + chunk) without consuming
    /// it. Returns None when the transfer completed.
    pub fn next_fragment(&self) -> Option<Vec<u8>> {
        if self.is_done() {
            return None;
        }
        let chunk = chunk_len(self.data.len(), self.count);
        let start = self.next * chunk;
        let end = (start + chunk).min(self.data.len());
        let hdr = FragmentHeader {
            message_id: self.message_id,
            index: self.next as u16,
            count: self.count as u16,
            total: self.data.len() as u16,
        };
        let mut out = vec![0u8; FRAGMENT_HEADER_SIZE + (end - start)];
        hdr.encode_into(&mut out);
        out[FRAGMENT_HEADER_SIZE..].copy_from_slice(&self.data[start..end]);
        Some(out)
    }

    /// Mark the fragment from [`Self::next_fragment`] as staged.
    pub fn advance(&mut self) {
        if self.next < self.count {
            self.next += 1;
        }
    }
}

#[derive(Debug)]
struct Reassembly {
    message_id: u16,
    total: usize,
    count: usize,
    buf: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
}

/// Per-peer reassembly state: one active fragmented message at a time.
///
/// Fragments for an id other than the active one are dropped; duplicates
/// are ignored; the completed payload is handed out exactly once.
#[derive(Debug, Default)]
pub struct Reassembler {
    active: Option<Reassembly>,
}

impl Reassembler {
    /// Feed one fragment payload (header included). Returns the reassembled
    /// message when the last missing fragment arrives.
    pub fn accept(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let hdr = FragmentHeader::decode(payload)?;
        let chunk = &payload[FRAGMENT_HEADER_SIZE..];

        let state = match &mut self.active {
            Some(s) if s.message_id == hdr.message_id => s,
            Some(s) => {
                warn!(
                    active = s.message_id,
                    got = hdr.message_id,
                    "fragment for inactive message dropped"
                );
                return Ok(None);
            }
            None => {
                self.active = Some(Reassembly {
                    message_id: hdr.message_id,
                    total: hdr.total as usize,
                    count: hdr.count as usize,
                    buf: vec![0; hdr.total as usize],
                    received: vec![false; hdr.count as usize],
                    received_count: 0,
                });
                self.active.as_mut().ok_or(Error::Internal)?
            }
        };

        if hdr.total as usize != state.total || hdr.count as usize != state.count {
            warn!(id = hdr.message_id, "inconsistent fragment header dropped");
            return Ok(None);
        }
        let idx = hdr.index as usize;
        if state.received[idx] {
            return Ok(None);
        }
        let clen = chunk_len(state.total, state.count);
        let start = idx * clen;
        // index < count does not bound the derived offset; a crafted
        // count close to total can push it past the buffer.
        if start >= state.total {
            warn!(id = hdr.message_id, idx, "fragment offset out of range dropped");
            return Ok(None);
        }
        let expect = clen.min(state.total - start);
        if chunk.len() != expect {
            warn!(id = hdr.message_id, idx, "fragment length mismatch dropped");
            return Ok(None);
        }
        state.buf[start..start + expect].copy_from_slice(chunk);
        state.received[idx] = true;
        state.received_count += 1;

        if state.received_count == state.count {
            let done = self.active.take().ok_or(Error::Internal)?;
            Ok(Some(done.buf))
        } else {
            Ok(None)
        }
    }

    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }

    /// Teardown path.
    pub fn reset(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn split_and_reassemble_in_order() {
        let data = payload(4096);
        let mut tx = OutboundTransfer::new(9, data.clone(), 1024).unwrap();
        assert_eq!(tx.fragment_count(), 4);
        let mut rx = Reassembler::default();
        let mut out = None;
        while let Some(frag) = tx.next_fragment() {
            tx.advance();
            if let Some(done) = rx.accept(&frag).unwrap() {
                out = Some(done);
            }
        }
        assert!(tx.is_done());
        assert_eq!(out.unwrap(), data);
    }

    #[test]
    fn reassemble_out_of_order() {
        let data = payload(2500);
        let mut tx = OutboundTransfer::new(1, data.clone(), 1000).unwrap();
        let mut frags = Vec::new();
        while let Some(f) = tx.next_fragment() {
            tx.advance();
            frags.push(f);
        }
        assert_eq!(frags.len(), 3);
        frags.reverse();
        let mut rx = Reassembler::default();
        let mut out = None;
        for f in &frags {
            if let Some(done) = rx.accept(f).unwrap() {
                out = Some(done);
            }
        }
        assert_eq!(out.unwrap(), data);
    }

    #[test]
    fn duplicates_and_foreign_ids_ignored() {
        let data = payload(2000);
        let mut tx = OutboundTransfer::new(5, data.clone(), 1000).unwrap();
        let f0 = tx.next_fragment().unwrap();
        tx.advance();
        let f1 = tx.next_fragment().unwrap();

        let mut rx = Reassembler::default();
        assert!(rx.accept(&f0).unwrap().is_none());
        // Duplicate of fragment 0.
        assert!(rx.accept(&f0).unwrap().is_none());
        // Fragment of a different message id.
        let mut other = f1.clone();
        other[0..2].copy_from_slice(&99u16.to_be_bytes());
        assert!(rx.accept(&other).unwrap().is_none());
        // The real second fragment completes it.
        assert_eq!(rx.accept(&f1).unwrap().unwrap(), data);
        assert!(!rx.in_progress());
    }

    #[test]
    fn rejects_bad_headers() {
        let mut rx = Reassembler::default();
        assert_eq!(rx.accept(&[0u8; 4]), Err(Error::Truncated));
        // count == 0
        let mut bad = [0u8; 10];
        bad[6..8].copy_from_slice(&10u16.to_be_bytes());
        assert_eq!(rx.accept(&bad), Err(Error::InvalidParam));
    }

    #[test]
    fn out_of_range_fragment_offset_dropped() {
        // count near total makes index * ceil(total/count) exceed total;
        // such a fragment must be dropped, not panic.
        let hdr = FragmentHeader {
            message_id: 1,
            index: 8,
            count: 9,
            total: 10,
        };
        let mut payload = vec![0u8; FRAGMENT_HEADER_SIZE + 2];
        hdr.encode_into(&mut payload);
        let mut rx = Reassembler::default();
        assert_eq!(rx.accept(&payload).unwrap(), None);
        // Repeats are equally harmless.
        assert_eq!(rx.accept(&payload).unwrap(), None);
    }

    #[test]
    fn transfer_size_limits() {
        assert_eq!(
            OutboundTransfer::new(0, vec![], 100).unwrap_err(),
            Error::MessageTooLarge
        );
        assert_eq!(
            OutboundTransfer::new(0, vec![0; MAX_TRANSFER_SIZE + 1], 100).unwrap_err(),
            Error::MessageTooLarge
        );
        assert!(OutboundTransfer::new(0, vec![0; MAX_TRANSFER_SIZE], 4096).is_ok());
    }

    #[test]
    fn uneven_final_fragment() {
        let data = payload(1001);
        let mut tx = OutboundTransfer::new(2, data.clone(), 500).unwrap();
        assert_eq!(tx.fragment_count(), 3);
        let mut sizes = Vec::new();
        let mut rx = Reassembler::default();
        let mut out = None;
        while let Some(f) = tx.next_fragment() {
            tx.advance();
            sizes.push(f.len() - FRAGMENT_HEADER_SIZE);
            if let Some(done) = rx.accept(&f).unwrap() {
                out = Some(done);
            }
        }
        // ceil(1001/3) = 334 per fragment, remainder on the last.
        assert_eq!(sizes, vec![334, 334, 333]);
        assert_eq!(out.unwrap(), data);
    }
}

//! Wire formats: discovery packets, message frames, unreliable datagrams.
//!
//! All multi-byte fields are big-endian. Frames carry a trailing CRC-16
//! (KERMIT variant: poly 0x1021 reflected, init 0x0000) computed over
//! header + payload. Discovery packets carry the same CRC over the whole
//! packet body.

use crc::{Crc, CRC_16_KERMIT};

use crate::config::{MAX_MESSAGE_SIZE, MAX_NAME_LEN};
use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u8 = 1;

/// "PTLK" - UDP discovery packets.
pub const MAGIC_DISCOVERY: [u8; 4] = *b"PTLK";
/// "PTMG" - stream message frames.
pub const MAGIC_MESSAGE: [u8; 4] = *b"PTMG";
/// "PTUD" - unreliable datagrams.
pub const MAGIC_DATAGRAM: [u8; 4] = *b"PTUD";

/// Transport capability bits advertised in discovery.
pub const TRANSPORT_STREAM: u8 = 0x01;
pub const TRANSPORT_DATAGRAM: u8 = 0x02;

/// Message header: magic(4) version(1) kind(1) flags(1) seq(1) len(2).
pub const MESSAGE_HEADER_SIZE: usize = 10;
/// Trailing checksum width.
pub const CHECKSUM_SIZE: usize = 2;
/// Datagram header: magic(4) sender_port(2) len(2).
pub const DATAGRAM_HEADER_SIZE: usize = 8;
/// Discovery packet: 12-byte fixed part + name + CRC.
pub const DISCOVERY_FIXED_SIZE: usize = 12;
pub const DISCOVERY_MAX_SIZE: usize = DISCOVERY_FIXED_SIZE + MAX_NAME_LEN + CHECKSUM_SIZE;

/// Fragment bit in the message header flags.
pub const FLAG_FRAGMENT: u8 = 0x01;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Checksum over a contiguous buffer.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Checksum over non-contiguous parts (header then payload).
pub fn crc16_parts(parts: &[&[u8]]) -> u16 {
    let mut digest = CRC16.digest();
    for p in parts {
        digest.update(p);
    }
    digest.finalize()
}

/// Discovery packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryKind {
    Announce = 0,
    Query = 1,
    Goodbye = 2,
}

impl DiscoveryKind {
    fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(DiscoveryKind::Announce),
            1 => Ok(DiscoveryKind::Query),
            2 => Ok(DiscoveryKind::Goodbye),
            _ => Err(Error::InvalidParam),
        }
    }
}

/// Parsed discovery packet. Transient: lives only across one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub version: u8,
    pub kind: DiscoveryKind,
    /// Peer flags (host/accepting/spectator/ready bits).
    pub flags: u16,
    /// The sender's stream listener port.
    pub sender_port: u16,
    /// Transport capability bitmask.
    pub transports: u8,
    pub name: String,
}

impl DiscoveryPacket {
    pub fn new(kind: DiscoveryKind, flags: u16, sender_port: u16, transports: u8, name: &str) -> Self {
        let mut name = name.to_owned();
        if name.len() > MAX_NAME_LEN {
            let mut cut = MAX_NAME_LEN;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }
        Self {
            version: PROTOCOL_VERSION,
            kind,
            flags,
            sender_port,
            transports,
            name,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidParam);
        }
        let mut buf = Vec::with_capacity(DISCOVERY_FIXED_SIZE + name.len() + CHECKSUM_SIZE);
        buf.extend_from_slice(&MAGIC_DISCOVERY);
        buf.push(self.version);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.sender_port.to_be_bytes());
        buf.push(self.transports);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        let crc = crc16(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DISCOVERY_FIXED_SIZE + CHECKSUM_SIZE {
            return Err(Error::Truncated);
        }
        if buf[0..4] != MAGIC_DISCOVERY {
            return Err(Error::BadMagic);
        }
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch);
        }
        let kind = DiscoveryKind::from_wire(buf[5])?;
        let flags = u16::from_be_bytes([buf[6], buf[7]]);
        let sender_port = u16::from_be_bytes([buf[8], buf[9]]);
        let transports = buf[10];
        let name_len = buf[11] as usize;
        if name_len > MAX_NAME_LEN {
            return Err(Error::InvalidParam);
        }
        let total = DISCOVERY_FIXED_SIZE + name_len + CHECKSUM_SIZE;
        if buf.len() < total {
            return Err(Error::Truncated);
        }
        let body = &buf[..DISCOVERY_FIXED_SIZE + name_len];
        let expected = crc16(body);
        let got = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
        if expected != got {
            return Err(Error::Checksum);
        }
        let name = std::str::from_utf8(&buf[DISCOVERY_FIXED_SIZE..DISCOVERY_FIXED_SIZE + name_len])
            .map_err(|_| Error::InvalidParam)?
            .to_owned();
        Ok(Self {
            version,
            kind,
            flags,
            sender_port,
            transports,
            name,
        })
    }
}

/// Message kinds on the reliable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Data = 1,
    Ping = 2,
    Pong = 3,
    Disconnect = 4,
    Ack = 5,
    Capability = 6,
}

impl MessageKind {
    fn from_wire(b: u8) -> Result<Self> {
        match b {
            1 => Ok(MessageKind::Data),
            2 => Ok(MessageKind::Ping),
            3 => Ok(MessageKind::Pong),
            4 => Ok(MessageKind::Disconnect),
            5 => Ok(MessageKind::Ack),
            6 => Ok(MessageKind::Capability),
            _ => Err(Error::InvalidParam),
        }
    }

    /// Control messages carry sequence 0; only Data consumes the counter.
    pub fn is_control(self) -> bool {
        !matches!(self, MessageKind::Data)
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub kind: MessageKind,
    pub flags: u8,
    pub sequence: u8,
    pub payload_len: u16,
}

impl MessageHeader {
    pub fn encode_into(&self, buf: &mut [u8; MESSAGE_HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&MAGIC_MESSAGE);
        buf[4] = self.version;
        buf[5] = self.kind as u8;
        buf[6] = self.flags;
        buf[7] = self.sequence;
        buf[8..10].copy_from_slice(&self.payload_len.to_be_bytes());
    }

    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Self> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::Truncated);
        }
        if buf[0..4] != MAGIC_MESSAGE {
            return Err(Error::BadMagic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch);
        }
        let kind = MessageKind::from_wire(buf[5])?;
        let payload_len = u16::from_be_bytes([buf[8], buf[9]]);
        if payload_len as usize > max_payload {
            return Err(Error::MessageTooLarge);
        }
        Ok(Self {
            version: buf[4],
            kind,
            flags: buf[6],
            sequence: buf[7],
            payload_len,
        })
    }
}

/// Encode a complete frame: header + payload + CRC trailer.
pub fn encode_message(kind: MessageKind, flags: u8, sequence: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge);
    }
    let hdr = MessageHeader {
        version: PROTOCOL_VERSION,
        kind,
        flags,
        sequence,
        payload_len: payload.len() as u16,
    };
    let mut hdr_buf = [0u8; MESSAGE_HEADER_SIZE];
    hdr.encode_into(&mut hdr_buf);
    let crc = crc16_parts(&[&hdr_buf, payload]);
    let mut out = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    out.extend_from_slice(&hdr_buf);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// A fully decoded and checksum-verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStage {
    Header,
    Payload,
    Checksum,
}

/// Staged frame decoder that resumes across partial reads.
///
/// Feed bytes with [`FrameDecoder::push`]; it consumes as much as it can and
/// yields a [`Frame`] once header, payload, and checksum have all arrived.
/// Protocol errors leave the decoder reset, so the caller decides whether to
/// drop the connection or just the frame.
#[derive(Debug)]
pub struct FrameDecoder {
    stage: DecodeStage,
    header_buf: [u8; MESSAGE_HEADER_SIZE],
    header: Option<MessageHeader>,
    payload: Vec<u8>,
    crc_buf: [u8; CHECKSUM_SIZE],
    have: usize,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            stage: DecodeStage::Header,
            header_buf: [0; MESSAGE_HEADER_SIZE],
            header: None,
            payload: Vec::new(),
            crc_buf: [0; CHECKSUM_SIZE],
            have: 0,
            max_payload,
        }
    }

    pub fn reset(&mut self) {
        self.stage = DecodeStage::Header;
        self.header = None;
        self.payload.clear();
        self.have = 0;
    }

    /// Consume bytes from `input`. Returns the number consumed plus the
    /// outcome: `None` means more bytes are needed, `Some(Ok(frame))` is a
    /// verified frame, `Some(Err(_))` is a frame-level error (the consumed
    /// count still tells the caller where parsing may resume). Call again
    /// with the remaining bytes.
    pub fn push(&mut self, input: &[u8]) -> (usize, Option<Result<Frame>>) {
        let mut consumed = 0;
        while consumed < input.len() {
            match self.stage {
                DecodeStage::Header => {
                    let want = MESSAGE_HEADER_SIZE - self.have;
                    let take = want.min(input.len() - consumed);
                    self.header_buf[self.have..self.have + take]
                        .copy_from_slice(&input[consumed..consumed + take]);
                    self.have += take;
                    consumed += take;
                    if self.have < MESSAGE_HEADER_SIZE {
                        return (consumed, None);
                    }
                    let hdr = match MessageHeader::decode(&self.header_buf, self.max_payload) {
                        Ok(h) => h,
                        Err(e) => {
                            self.reset();
                            return (consumed, Some(Err(e)));
                        }
                    };
                    self.payload.clear();
                    self.payload.reserve(hdr.payload_len as usize);
                    self.header = Some(hdr);
                    self.have = 0;
                    self.stage = if hdr.payload_len == 0 {
                        DecodeStage::Checksum
                    } else {
                        DecodeStage::Payload
                    };
                }
                DecodeStage::Payload => {
                    let hdr = match self.header {
                        Some(h) => h,
                        None => {
                            self.reset();
                            return (consumed, Some(Err(Error::Internal)));
                        }
                    };
                    let want = hdr.payload_len as usize - self.payload.len();
                    let take = want.min(input.len() - consumed);
                    self.payload
                        .extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    if self.payload.len() < hdr.payload_len as usize {
                        return (consumed, None);
                    }
                    self.stage = DecodeStage::Checksum;
                    self.have = 0;
                }
                DecodeStage::Checksum => {
                    let want = CHECKSUM_SIZE - self.have;
                    let take = want.min(input.len() - consumed);
                    self.crc_buf[self.have..self.have + take]
                        .copy_from_slice(&input[consumed..consumed + take]);
                    self.have += take;
                    consumed += take;
                    if self.have < CHECKSUM_SIZE {
                        return (consumed, None);
                    }
                    let hdr = match self.header {
                        Some(h) => h,
                        None => {
                            self.reset();
                            return (consumed, Some(Err(Error::Internal)));
                        }
                    };
                    let expected = crc16_parts(&[&self.header_buf, &self.payload]);
                    let got = u16::from_be_bytes(self.crc_buf);
                    if expected != got {
                        self.reset();
                        return (consumed, Some(Err(Error::Checksum)));
                    }
                    let frame = Frame {
                        header: hdr,
                        payload: std::mem::take(&mut self.payload),
                    };
                    self.reset();
                    return (consumed, Some(Ok(frame)));
                }
            }
        }
        (consumed, None)
    }
}

/// Encode an unreliable datagram (no CRC; the medium carries its own).
pub fn encode_datagram(sender_port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::MessageTooLarge);
    }
    let mut buf = Vec::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC_DATAGRAM);
    buf.extend_from_slice(&sender_port.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode an unreliable datagram. Returns (sender_port, payload).
pub fn decode_datagram(buf: &[u8]) -> Result<(u16, &[u8])> {
    if buf.len() < DATAGRAM_HEADER_SIZE {
        return Err(Error::Truncated);
    }
    if buf[0..4] != MAGIC_DATAGRAM {
        return Err(Error::BadMagic);
    }
    let sender_port = u16::from_be_bytes([buf[4], buf[5]]);
    let len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    if buf.len() < DATAGRAM_HEADER_SIZE + len {
        return Err(Error::Truncated);
    }
    Ok((sender_port, &buf[DATAGRAM_HEADER_SIZE..DATAGRAM_HEADER_SIZE + len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        // KERMIT check value pins the polynomial choice.
        assert_eq!(crc16(b"123456789"), 0x2189);
    }

    #[test]
    fn discovery_roundtrip() {
        let pkt = DiscoveryPacket::new(DiscoveryKind::Announce, 0x0002, 7354, 0x03, "Alice");
        let buf = pkt.encode().unwrap();
        let decoded = DiscoveryPacket::decode(&buf).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn discovery_rejects_bad_magic() {
        let pkt = DiscoveryPacket::new(DiscoveryKind::Query, 0, 7354, 1, "x");
        let mut buf = pkt.encode().unwrap();
        buf[0] = b'Q';
        assert_eq!(DiscoveryPacket::decode(&buf), Err(Error::BadMagic));
    }

    #[test]
    fn discovery_rejects_truncated() {
        let pkt = DiscoveryPacket::new(DiscoveryKind::Goodbye, 0, 7354, 1, "longer-name");
        let buf = pkt.encode().unwrap();
        assert_eq!(DiscoveryPacket::decode(&buf[..10]), Err(Error::Truncated));
        assert_eq!(
            DiscoveryPacket::decode(&buf[..buf.len() - 1]),
            Err(Error::Truncated)
        );
    }

    #[test]
    fn discovery_rejects_corruption_anywhere() {
        let pkt = DiscoveryPacket::new(DiscoveryKind::Announce, 0, 7354, 3, "Bob");
        let buf = pkt.encode().unwrap();
        // Bytes 0..5 fail structurally (magic/version); the rest must be
        // caught by the checksum or field validation.
        for i in 5..buf.len() - CHECKSUM_SIZE {
            let mut bad = buf.clone();
            bad[i] ^= 0x10;
            assert!(DiscoveryPacket::decode(&bad).is_err(), "byte {i} accepted");
        }
    }

    #[test]
    fn name_truncated_at_limit() {
        let pkt = DiscoveryPacket::new(DiscoveryKind::Announce, 0, 7354, 1, &"n".repeat(64));
        assert_eq!(pkt.name.len(), MAX_NAME_LEN);
        assert!(pkt.encode().is_ok());
    }

    #[test]
    fn message_roundtrip() {
        let frame = encode_message(MessageKind::Data, 0, 7, b"hello").unwrap();
        let mut dec = FrameDecoder::new(MAX_MESSAGE_SIZE);
        let (n, out) = dec.push(&frame);
        assert_eq!(n, frame.len());
        let out = out.unwrap().unwrap();
        assert_eq!(out.header.kind, MessageKind::Data);
        assert_eq!(out.header.sequence, 7);
        assert_eq!(out.payload, b"hello");
    }

    #[test]
    fn decoder_resumes_across_partial_reads() {
        let frame = encode_message(MessageKind::Data, 0, 1, &[0xAB; 300]).unwrap();
        let mut dec = FrameDecoder::new(MAX_MESSAGE_SIZE);
        let mut got = None;
        // One byte at a time: worst-case partial reads.
        for b in &frame {
            let (n, out) = dec.push(std::slice::from_ref(b));
            assert_eq!(n, 1);
            if let Some(f) = out {
                got = Some(f.unwrap());
            }
        }
        assert_eq!(got.unwrap().payload, vec![0xAB; 300]);
    }

    #[test]
    fn decoder_yields_consecutive_frames() {
        let a = encode_message(MessageKind::Ping, 0, 0, &[]).unwrap();
        let b = encode_message(MessageKind::Data, 0, 1, b"xy").unwrap();
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        let mut dec = FrameDecoder::new(MAX_MESSAGE_SIZE);
        let (n1, f1) = dec.push(&joined);
        assert_eq!(n1, a.len());
        assert_eq!(f1.unwrap().unwrap().header.kind, MessageKind::Ping);
        let (n2, f2) = dec.push(&joined[n1..]);
        assert_eq!(n2, b.len());
        assert_eq!(f2.unwrap().unwrap().payload, b"xy");
    }

    #[test]
    fn single_bit_flip_fails_checksum() {
        let frame = encode_message(MessageKind::Data, 0, 3, b"payload bytes").unwrap();
        // Flips in flags/seq and in the payload must all be rejected.
        // Length bytes are different: they change how much payload the
        // decoder waits for (covered separately below).
        for &i in &[6usize, 7, MESSAGE_HEADER_SIZE + 4] {
            let mut bad = frame.clone();
            bad[i] ^= 0x01;
            let mut dec = FrameDecoder::new(MAX_MESSAGE_SIZE);
            let (_, out) = dec.push(&bad);
            assert!(
                matches!(out, Some(Err(_))),
                "flip at {i} accepted: {out:?}"
            );
        }
    }

    #[test]
    fn corrupted_length_fails_once_payload_arrives() {
        let frame = encode_message(MessageKind::Data, 0, 3, b"payload bytes").unwrap();
        let mut bad = frame.clone();
        // High length byte: the decoder now expects 256 extra payload
        // bytes, so the lone frame is not enough to reach the checksum.
        bad[8] ^= 0x01;
        let mut dec = FrameDecoder::new(MAX_MESSAGE_SIZE);
        let (n, out) = dec.push(&bad);
        assert_eq!(n, bad.len());
        assert_eq!(out, None);
        // Whatever bytes follow, the checksum cannot cover the corrupted
        // header and the frame is rejected there.
        let filler = vec![0u8; 300];
        let (_, out) = dec.push(&filler);
        assert_eq!(out, Some(Err(Error::Checksum)));
    }

    #[test]
    fn oversized_payload_rejected_before_payload() {
        let frame = encode_message(MessageKind::Data, 0, 0, &[0u8; 128]).unwrap();
        let mut dec = FrameDecoder::new(64);
        let (n, out) = dec.push(&frame);
        assert_eq!(n, MESSAGE_HEADER_SIZE);
        assert_eq!(out, Some(Err(Error::MessageTooLarge)));
    }

    #[test]
    fn decoder_recovers_after_error() {
        let mut bad = encode_message(MessageKind::Data, 0, 0, b"abc").unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = encode_message(MessageKind::Data, 0, 1, b"def").unwrap();
        let mut dec = FrameDecoder::new(MAX_MESSAGE_SIZE);
        let (n, out) = dec.push(&bad);
        // The whole bad frame was consumed, so parsing resumes cleanly.
        assert_eq!(n, bad.len());
        assert_eq!(out, Some(Err(Error::Checksum)));
        let (_, f) = dec.push(&good);
        assert_eq!(f.unwrap().unwrap().payload, b"def");
    }

    #[test]
    fn datagram_roundtrip() {
        let buf = encode_datagram(7355, b"state update").unwrap();
        let (port, payload) = decode_datagram(&buf).unwrap();
        assert_eq!(port, 7355);
        assert_eq!(payload, b"state update");
    }

    #[test]
    fn datagram_rejects_short() {
        assert_eq!(decode_datagram(b"PTUD\x00"), Err(Error::Truncated));
        assert_eq!(
            decode_datagram(b"XXXX\x00\x00\x00\x00"),
            Err(Error::BadMagic)
        );
    }
}

//! The host-provided transport boundary.
//!
//! The engine never owns a socket. Every service cycle it borrows a
//! `Transport` and performs whatever non-blocking I/O is possible right
//! now. All calls must return immediately: `Ok(None)` / `Err(WouldBlock)`
//! when nothing is pending, never block.

use std::net::SocketAddr;

use crate::error::Result;

/// Host-scoped handle for one reliable stream.
pub type StreamId = u64;

pub trait Transport {
    /// Broadcast a discovery packet to the well-known discovery port.
    fn broadcast_discovery(&mut self, port: u16, buf: &[u8]) -> Result<()>;

    /// Send a discovery packet to one address (query responses).
    fn send_discovery(&mut self, addr: SocketAddr, buf: &[u8]) -> Result<()>;

    /// Poll for one discovery packet. `Ok(None)` when nothing is pending.
    fn recv_discovery(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;

    /// Begin a non-blocking stream connect. Completion is observed through
    /// [`Transport::stream_connected`] on later cycles.
    fn connect(&mut self, addr: SocketAddr) -> Result<StreamId>;

    /// Poll the listener for one inbound stream.
    fn accept(&mut self) -> Result<Option<(StreamId, SocketAddr)>>;

    /// Whether an in-progress connect has completed. Errors surface the
    /// connect failure (refused, unreachable).
    fn stream_connected(&mut self, id: StreamId) -> Result<bool>;

    /// Whether the stream can take bytes right now.
    fn stream_writable(&mut self, id: StreamId) -> bool;

    /// Write as much as possible; returns bytes accepted.
    /// `Err(WouldBlock)` when the socket buffer is full.
    fn stream_send(&mut self, id: StreamId, buf: &[u8]) -> Result<usize>;

    /// Read available bytes. `Ok(0)` means the peer closed the stream;
    /// `Err(WouldBlock)` means nothing to read yet.
    fn stream_recv(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize>;

    fn stream_close(&mut self, id: StreamId);

    /// Fire-and-forget datagram to a peer's datagram port.
    fn send_datagram(&mut self, addr: SocketAddr, buf: &[u8]) -> Result<()>;

    /// Poll for one unreliable datagram.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;

    /// Whether `addr` is one of the host's own addresses. Used to drop our
    /// own broadcast announcements.
    fn is_local_addr(&self, addr: &SocketAddr) -> bool;
}

//! BSD-socket implementation of the engine's transport boundary.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use tracing::debug;

use peerlink_core::{Error, Result, StreamId, Transport};

use crate::config::Config;

pub struct PosixTransport {
    discovery: UdpSocket,
    datagram: UdpSocket,
    listener: TcpListener,
    streams: HashMap<StreamId, TcpStream>,
    next_id: StreamId,
    local_ip: Option<IpAddr>,
}

impl PosixTransport {
    pub fn bind(cfg: &Config) -> std::io::Result<Self> {
        let discovery = UdpSocket::bind(("0.0.0.0", cfg.discovery_port))?;
        discovery.set_broadcast(true)?;
        discovery.set_nonblocking(true)?;
        let datagram = UdpSocket::bind(("0.0.0.0", cfg.datagram_port))?;
        datagram.set_nonblocking(true)?;
        let listener = TcpListener::bind(("0.0.0.0", cfg.stream_port))?;
        listener.set_nonblocking(true)?;
        debug!(
            discovery = cfg.discovery_port,
            stream = cfg.stream_port,
            datagram = cfg.datagram_port,
            "sockets bound"
        );
        Ok(Self {
            discovery,
            datagram,
            listener,
            streams: HashMap::new(),
            next_id: 1,
            local_ip: detect_local_ip(),
        })
    }

    fn take_id(&mut self) -> StreamId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// The routing trick: the OS picks the outbound interface for a connected
/// UDP socket without sending anything.
fn detect_local_ip() -> Option<IpAddr> {
    let s = UdpSocket::bind("0.0.0.0:0").ok()?;
    s.connect("192.0.2.1:9").ok()?;
    Some(s.local_addr().ok()?.ip())
}

fn recv_opt(
    sock: &UdpSocket,
    buf: &mut [u8],
) -> Result<Option<(usize, SocketAddr)>> {
    match sock.recv_from(buf) {
        Ok((n, from)) => Ok(Some((n, from))),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Transport for PosixTransport {
    fn broadcast_discovery(&mut self, port: u16, buf: &[u8]) -> Result<()> {
        self.discovery
            .send_to(buf, (Ipv4Addr::BROADCAST, port))
            .map(|_| ())
            .map_err(Into::into)
    }

    fn send_discovery(&mut self, addr: SocketAddr, buf: &[u8]) -> Result<()> {
        self.discovery.send_to(buf, addr).map(|_| ()).map_err(Into::into)
    }

    fn recv_discovery(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        recv_opt(&self.discovery, buf)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<StreamId> {
        // Brief blocking connect; LAN handshakes resolve well inside this.
        let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(250))?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let id = self.take_id();
        self.streams.insert(id, stream);
        Ok(id)
    }

    fn accept(&mut self) -> Result<Option<(StreamId, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, from)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                let id = self.take_id();
                self.streams.insert(id, stream);
                Ok(Some((id, from)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stream_connected(&mut self, id: StreamId) -> Result<bool> {
        if self.streams.contains_key(&id) {
            Ok(true)
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    fn stream_writable(&mut self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    fn stream_send(&mut self, id: StreamId, buf: &[u8]) -> Result<usize> {
        let stream = self.streams.get_mut(&id).ok_or(Error::ConnectionClosed)?;
        stream.write(buf).map_err(Into::into)
    }

    fn stream_recv(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize> {
        let stream = self.streams.get_mut(&id).ok_or(Error::ConnectionClosed)?;
        stream.read(buf).map_err(Into::into)
    }

    fn stream_close(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.remove(&id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn send_datagram(&mut self, addr: SocketAddr, buf: &[u8]) -> Result<()> {
        self.datagram.send_to(buf, addr).map(|_| ()).map_err(Into::into)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        recv_opt(&self.datagram, buf)
    }

    fn is_local_addr(&self, addr: &SocketAddr) -> bool {
        addr.ip().is_loopback() || Some(addr.ip()) == self.local_ip
    }
}

//! Non-blocking UDP socket wrapper, the only I/O boundary of the peer.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use log::error;

use crate::error::NetError;

/// Rolling traffic counters surfaced to the host application.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Smoothed RTT of the busiest reliable channel, published by the peer.
    pub rtt_ms: f32,
}

/// Outcome of one non-blocking receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A datagram of `len` bytes arrived from `addr`.
    Datagram { len: usize, addr: SocketAddr },
    /// Nothing more to read this tick.
    Empty,
    /// The OS reported a remote reset (ICMP port unreachable on a previous
    /// send); the peer treats it as an implicit disconnect hint.
    Reset,
}

pub struct Transport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
}

impl Transport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, NetError> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            NetError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "bind address did not resolve",
            ))
        })?;
        let socket = UdpSocket::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub fn set_rtt_ms(&mut self, rtt_ms: f32) {
        self.stats.rtt_ms = rtt_ms;
    }

    /// Sends one datagram. Hard errors are logged and swallowed; losing a
    /// datagram is indistinguishable from the network dropping it.
    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) {
        match self.socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("send to {addr} failed: {e}"),
        }
    }

    /// Attempts one receive into `buffer`.
    pub fn recv_into(&mut self, buffer: &mut [u8]) -> RecvOutcome {
        match self.socket.recv_from(buffer) {
            Ok((len, addr)) => {
                self.stats.packets_received += 1;
                self.stats.bytes_received += len as u64;
                RecvOutcome::Datagram { len, addr }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => RecvOutcome::Empty,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => RecvOutcome::Reset,
            Err(e) => {
                error!("receive failed: {e}");
                RecvOutcome::Empty
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_loopback_datagram() {
        let mut a = Transport::bind("127.0.0.1:0").unwrap();
        let mut b = Transport::bind("127.0.0.1:0").unwrap();

        a.send_to(b"hello", b.local_addr());

        let mut buffer = [0u8; 64];
        let mut got = None;
        for _ in 0..200 {
            match b.recv_into(&mut buffer) {
                RecvOutcome::Datagram { len, addr } => {
                    got = Some((len, addr));
                    break;
                }
                _ => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }

        let (len, addr) = got.expect("datagram never arrived");
        assert_eq!(&buffer[..len], b"hello");
        assert_eq!(addr, a.local_addr());
        assert_eq!(b.stats().packets_received, 1);
        assert_eq!(a.stats().packets_sent, 1);
    }

    #[test]
    fn empty_socket_reports_empty() {
        let mut t = Transport::bind("127.0.0.1:0").unwrap();
        let mut buffer = [0u8; 64];
        assert!(matches!(t.recv_into(&mut buffer), RecvOutcome::Empty));
    }
}

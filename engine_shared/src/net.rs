//! Raw datagram socket.
//!
//! The reliable-ish transport (sequence numbers, acks, retransmission) lives
//! in [`crate::connection::Connection`]; this module only owns the actual
//! UDP socket and the send/receive of opaque datagram bytes to/from a peer
//! address. Kept deliberately thin, the way the teacher's `ReliableConn`/
//! `UnreliableConn` wrapped their sockets.

use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time;

/// Maximum datagram size accepted on receive.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// A bound UDP socket used for both client and server transport. The
/// server demultiplexes by source address; the client has a single
/// implicit peer (the server).
pub struct GameSocket {
    socket: UdpSocket,
}

impl GameSocket {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await.context("udp bind")?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> anyhow::Result<()> {
        self.socket.send_to(payload, peer).await.context("udp send_to")?;
        Ok(())
    }

    /// Receives one datagram, non-blocking: returns `Ok(None)` if nothing is
    /// pending right now.
    pub fn try_recv(&self) -> anyhow::Result<Option<(Bytes, SocketAddr)>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match self.socket.try_recv_from(&mut buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), from)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("udp try_recv_from"),
        }
    }

    /// Receives one datagram, waiting up to `timeout`.
    pub async fn recv_timeout(&self, timeout: std::time::Duration) -> anyhow::Result<Option<(Bytes, SocketAddr)>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), from)))
            }
            Ok(Err(e)) => Err(e).context("udp recv_from"),
            Err(_) => Ok(None),
        }
    }
}

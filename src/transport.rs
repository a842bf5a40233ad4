// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP/RTCP transports below the RTSP session: interleaved frames share the
//! RTSP connection and are demultiplexed there; this module covers the UDP
//! realizations (unicast port pairs and multicast groups) and the reader
//! tasks that forward their datagrams into the session's event channel.

use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use log::trace;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which half of the paired channel a packet arrived on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PacketKind {
    Rtp,
    Rtcp,
}

/// A datagram (or socket error) from a UDP reader task.
pub(crate) struct TransportEvent {
    pub(crate) stream_id: usize,
    pub(crate) kind: PacketKind,
    pub(crate) result: Result<Bytes, std::io::Error>,
}

/// A pair of local UDP sockets for one stream's RTP and RTCP.
///
/// Per RFC 3550 convention the RTP port is even and the RTCP port is the
/// next (odd) integer.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    /// Binds an even/odd pair on `ip_addr`, trying random even ports from
    /// `port_range` a bounded number of times.
    pub(crate) fn for_ip(ip_addr: IpAddr, port_range: Range<u16>) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        let mut rng = rand::thread_rng();
        for i in 0..MAX_TRIES {
            let rtp_port = rng.gen_range(port_range.clone()) & !0b1;
            let rtp_socket = match bind_nonblocking(SocketAddr::new(ip_addr, rtp_port)) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("try {i}/{MAX_TRIES}: RTP port {rtp_port} in use");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_socket = match bind_nonblocking(SocketAddr::new(ip_addr, rtp_port + 1)) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("try {i}/{MAX_TRIES}: RTCP port {} in use", rtp_port + 1);
                    continue;
                }
                Err(e) => return Err(e),
            };
            return Ok(Self {
                rtp_port,
                rtp_socket: UdpSocket::from_std(rtp_socket)?,
                rtcp_socket: UdpSocket::from_std(rtcp_socket)?,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "no free even/odd port pair in {}:{}..{} after {} tries",
                ip_addr, port_range.start, port_range.end, MAX_TRIES
            ),
        ))
    }
}

fn bind_nonblocking(addr: SocketAddr) -> Result<std::net::UdpSocket, std::io::Error> {
    let s = std::net::UdpSocket::bind(addr)?;
    s.set_nonblocking(true)?;
    Ok(s)
}

/// Binds and joins a multicast group on the port pair the `SETUP` response
/// supplied.
pub(crate) fn multicast_pair(
    group: IpAddr,
    rtp_port: u16,
) -> Result<(UdpSocket, UdpSocket), std::io::Error> {
    let bind_any = match group {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    let rtp = bind_nonblocking(SocketAddr::new(bind_any, rtp_port))?;
    let rtcp = bind_nonblocking(SocketAddr::new(bind_any, rtp_port + 1))?;
    match group {
        IpAddr::V4(g) => {
            rtp.join_multicast_v4(&g, &std::net::Ipv4Addr::UNSPECIFIED)?;
            rtcp.join_multicast_v4(&g, &std::net::Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(g) => {
            rtp.join_multicast_v6(&g, 0)?;
            rtcp.join_multicast_v6(&g, 0)?;
        }
    }
    Ok((UdpSocket::from_std(rtp)?, UdpSocket::from_std(rtcp)?))
}

/// A running UDP transport for one stream: the socket pair plus its reader
/// tasks.
pub(crate) struct UdpTransport {
    pub(crate) rtcp_socket: Arc<UdpSocket>,

    /// Where receiver reports go: the connected peer for unicast, the group
    /// for multicast.
    rtcp_dest: Option<SocketAddr>,

    tasks: [JoinHandle<()>; 2],
}

impl UdpTransport {
    /// Starts reader tasks forwarding datagrams into `tx`.
    ///
    /// For unicast the sockets should already be `connect`ed to the server's
    /// port pair so the kernel filters stray senders; `rtcp_dest` is then
    /// `None` and writes use `send`.
    pub(crate) fn start(
        stream_id: usize,
        rtp_socket: UdpSocket,
        rtcp_socket: UdpSocket,
        rtcp_dest: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let rtp_socket = Arc::new(rtp_socket);
        let rtcp_socket = Arc::new(rtcp_socket);
        let tasks = [
            spawn_reader(stream_id, PacketKind::Rtp, rtp_socket, tx.clone()),
            spawn_reader(stream_id, PacketKind::Rtcp, rtcp_socket.clone(), tx),
        ];
        Self {
            rtcp_socket,
            rtcp_dest,
            tasks,
        }
    }

    /// Sends an RTCP packet (receiver report) toward the server.
    pub(crate) async fn send_rtcp(&self, data: &[u8]) -> Result<(), std::io::Error> {
        match self.rtcp_dest {
            Some(dest) => self.rtcp_socket.send_to(data, dest).await.map(|_| ()),
            None => self.rtcp_socket.send(data).await.map(|_| ()),
        }
    }

    /// Aborts the reader tasks and drops the sockets.
    pub(crate) fn stop(self) {
        for t in self.tasks {
            t.abort();
        }
    }
}

fn spawn_reader(
    stream_id: usize,
    kind: PacketKind,
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // An RTP packet can't exceed what fits in a UDP datagram.
        let mut buf = vec![0u8; 65_536];
        loop {
            let result = match socket.recv_from(&mut buf).await {
                Ok((n, _from)) => Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => Err(e),
            };
            let failed = result.is_err();
            if tx
                .send(TransportEvent {
                    stream_id,
                    kind,
                    result,
                })
                .is_err()
                || failed
            {
                break; // session gone or socket dead
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_pair_is_even_odd() {
        let pair = UdpPair::for_ip(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 5000..65000).unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(
            pair.rtp_socket.local_addr().unwrap().port() + 1,
            pair.rtcp_socket.local_addr().unwrap().port()
        );
    }

    #[tokio::test]
    async fn exhausted_range_fails() {
        // A one-port range can only ever produce one pair; binding it twice
        // must fail with AddrInUse rather than looping forever.
        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        let first = UdpPair::for_ip(ip, 40000..40002).unwrap();
        assert_eq!(first.rtp_port, 40000);
        assert!(UdpPair::for_ip(ip, 40000..40002).is_err());
    }

    #[tokio::test]
    async fn reader_forwards_datagrams() {
        let pair = UdpPair::for_ip(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 5000..65000).unwrap();
        let dest = pair.rtp_socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = UdpTransport::start(7, pair.rtp_socket, pair.rtcp_socket, None, tx);
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello", dest).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.stream_id, 7);
        assert_eq!(ev.kind, PacketKind::Rtp);
        assert_eq!(&ev.result.unwrap()[..], b"hello");
        transport.stop();
    }
}

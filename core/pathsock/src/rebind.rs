//! UDP sockets that can be swapped out underneath their readers
//!
//! A [`RebindingUdpSocket`] holds the current socket for one address
//! family. Rebinding replaces it atomically; a reader blocked in
//! `recv_from` on the old socket wakes up and continues on the new one.
//!
//! ```text
//!            rebind(port)
//!  Bound(sock A) ─────────► Bound(sock B)
//!       │                        │
//!       │ all ports fail          │ close()
//!       ▼                        ▼
//!   Unbound  ───────────────► Closed
//!  (reads block until the next successful rebind or close)
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::error::Error;

/// Address family of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Udp4,
    Udp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

/// Whether a rebind should try to keep the port currently in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentPortFate {
    Keep,
    Drop,
}

enum SocketState {
    Bound(Arc<UdpSocket>),
    /// Placeholder after a failed bind: reads block, writes fail
    Unbound,
    Closed,
}

pub struct RebindingUdpSocket {
    network: Network,
    state: Mutex<SocketState>,
    generation: AtomicU64,
    changed: Notify,
}

/// Ports to try, in order: preferred, current, then any. Zero preferred
/// means "no preference".
pub fn candidate_ports(preferred: u16, current: Option<u16>) -> Vec<u16> {
    let mut ports = Vec::with_capacity(3);
    if preferred != 0 {
        ports.push(preferred);
    }
    if let Some(cur) = current {
        ports.push(cur);
    }
    ports.push(0);
    ports.dedup();
    ports
}

fn listen_packet(network: Network, port: u16) -> io::Result<std::net::UdpSocket> {
    let (domain, addr) = match network {
        Network::Udp4 => (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
        Network::Udp6 => (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if network == Network::Udp6 {
        socket.set_only_v6(true)?;
    }
    // The socket being replaced may still be draining its last read.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

impl RebindingUdpSocket {
    /// A socket in the unbound state
    pub fn new(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(SocketState::Unbound),
            generation: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// (Re)bind, trying the preferred port, then (if kept) the current
    /// port, then an ephemeral one. On total failure the socket is left
    /// unbound and an error is returned.
    pub fn rebind(
        &self,
        handle: &Handle,
        preferred_port: u16,
        fate: CurrentPortFate,
    ) -> Result<u16, Error> {
        let mut state = self.state.lock();
        if matches!(*state, SocketState::Closed) {
            return Err(Error::Closed);
        }

        let current = match (&*state, fate) {
            (SocketState::Bound(sock), CurrentPortFate::Keep) => {
                sock.local_addr().ok().map(|a| a.port())
            }
            _ => None,
        };
        let ports = candidate_ports(preferred_port, current);

        // Release the old socket in case it holds the port we want.
        *state = SocketState::Unbound;

        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no ports tried");
        for &port in &ports {
            let bound = listen_packet(self.network, port).and_then(|std_sock| {
                let _guard = handle.enter();
                UdpSocket::from_std(std_sock)
            });
            match bound {
                Ok(sock) => {
                    let local = sock.local_addr()?.port();
                    *state = SocketState::Bound(Arc::new(sock));
                    drop(state);
                    self.note_changed();
                    log::info!("bound {} on port {}", self.network.as_str(), local);
                    return Ok(local);
                }
                Err(e) => {
                    log::warn!("unable to bind {} port {}: {}", self.network.as_str(), port, e);
                    last_err = e;
                }
            }
        }

        drop(state);
        self.note_changed();
        Err(Error::Bind {
            network: self.network.as_str(),
            ports,
            source: last_err,
        })
    }

    /// Leave the socket unbound on purpose (reads block, writes fail).
    pub fn unbind(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, SocketState::Closed) {
            *state = SocketState::Unbound;
        }
        drop(state);
        self.note_changed();
    }

    /// Close for good; blocked readers return an error.
    pub fn close(&self) {
        *self.state.lock() = SocketState::Closed;
        self.note_changed();
    }

    fn note_changed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self.state.lock(), SocketState::Bound(_))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            SocketState::Bound(sock) => sock.local_addr().ok(),
            _ => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// Receive on whatever socket is current, following rebinds.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let changed = self.changed.notified();
            let gen = self.generation.load(Ordering::SeqCst);
            let sock = match &*self.state.lock() {
                SocketState::Bound(sock) => Some(sock.clone()),
                SocketState::Unbound => None,
                SocketState::Closed => return Err(closed_error()),
            };

            let Some(sock) = sock else {
                changed.await;
                continue;
            };
            tokio::select! {
                res = sock.recv_from(buf) => match res {
                    Ok(v) => return Ok(v),
                    Err(_) if self.generation.load(Ordering::SeqCst) != gen => continue,
                    Err(e) => return Err(e),
                },
                _ = changed => continue,
            }
        }
    }

    fn current(&self) -> io::Result<Arc<UdpSocket>> {
        match &*self.state.lock() {
            SocketState::Bound(sock) => Ok(sock.clone()),
            SocketState::Unbound => Err(io::Error::new(io::ErrorKind::NotConnected, "socket not bound")),
            SocketState::Closed => Err(closed_error()),
        }
    }

    /// Non-blocking send. `WouldBlock` means the packet was dropped.
    pub fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.current()?.try_send_to(buf, addr)
    }

    /// Send on the current socket, waiting until it is writable.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let sock = self.current()?;
        sock.send_to(buf, addr).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_candidate_ports() {
        assert_eq!(candidate_ports(0, None), vec![0]);
        assert_eq!(candidate_ports(41641, None), vec![41641, 0]);
        assert_eq!(candidate_ports(41641, Some(5000)), vec![41641, 5000, 0]);
        assert_eq!(candidate_ports(5000, Some(5000)), vec![5000, 0]);
        assert_eq!(candidate_ports(0, Some(5000)), vec![5000, 0]);
    }

    #[tokio::test]
    async fn test_bind_and_receive() {
        let sock = RebindingUdpSocket::new(Network::Udp4);
        let port = sock.rebind(&Handle::current(), 0, CurrentPortFate::Keep).unwrap();
        assert!(port != 0);
        assert!(sock.is_bound());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hello", ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = sock.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_send_to_fresh_socket() {
        let sock = RebindingUdpSocket::new(Network::Udp4);
        sock.rebind(&Handle::current(), 0, CurrentPortFate::Keep).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sock.send_to(b"first", peer.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");

        sock.close();
        assert!(sock.send_to(b"x", peer.local_addr().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_rebind_keeps_port() {
        let sock = RebindingUdpSocket::new(Network::Udp4);
        let first = sock.rebind(&Handle::current(), 0, CurrentPortFate::Keep).unwrap();
        let second = sock.rebind(&Handle::current(), 0, CurrentPortFate::Keep).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_reader_follows_rebind() {
        let sock = Arc::new(RebindingUdpSocket::new(Network::Udp4));
        sock.rebind(&Handle::current(), 0, CurrentPortFate::Keep).unwrap();

        let reader = {
            let sock = sock.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let (n, _) = sock.recv_from(&mut buf).await.unwrap();
                buf[..n].to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let port = sock.rebind(&Handle::current(), 0, CurrentPortFate::Drop).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"after", ("127.0.0.1", port)).await.unwrap();

        assert_eq!(reader.await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn test_unbound_blocks_until_close() {
        let sock = Arc::new(RebindingUdpSocket::new(Network::Udp4));
        let reader = {
            let sock = sock.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                sock.recv_from(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        assert!(sock.try_send_to(b"x", "127.0.0.1:9".parse().unwrap()).is_err());

        sock.close();
        let res = reader.await.unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(sock.rebind(&Handle::current(), 0, CurrentPortFate::Keep).is_err());
    }
}

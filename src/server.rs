use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::config::RdpConfig;
use crate::connection::{Connection, ConnectionStats};
use crate::error::{Error, Result};
use crate::manager::{ConnectionManager, NewConnectionHook};
use crate::socket::RdpSocket;
use crate::transceiver::Transceiver;

/// The server role: accepts connections from clients.
///
/// Every peer that sends a SYN gets its own passively opened [`Connection`], which is queued
/// for [`accept`](Server::accept) once its handshake completes. Peers that never finish the
/// handshake are never handed out.
///
/// # Example
/// ```no_run
/// use rdp::Server;
///
/// let server = Server::new("0.0.0.0:40000").unwrap();
/// loop {
///     let conn = server.accept().unwrap();
///     std::thread::spawn(move || {
///         while let Ok(msg) = conn.receive() {
///             if conn.send(&msg).is_err() {
///                 break;
///             }
///         }
///     });
/// }
/// ```
pub struct Server<T: Transceiver = RdpSocket> {
    manager: ConnectionManager<T>,
    incoming: Receiver<Arc<Connection>>,
}

impl Server<RdpSocket> {
    pub fn new(bind_addr: impl ToSocketAddrs) -> Result<Self> {
        Self::with_config(bind_addr, RdpConfig::default())
    }

    pub fn with_config(bind_addr: impl ToSocketAddrs, cfg: RdpConfig) -> Result<Self> {
        Self::with_transceiver(RdpSocket::new(bind_addr)?, cfg)
    }
}

impl<T: Transceiver> Server<T> {
    /// Creates a server over any datagram transport and starts its background threads.
    pub fn with_transceiver(transceiver: T, cfg: RdpConfig) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let hook: NewConnectionHook = Box::new(move |conn: Arc<Connection>| {
            let remote = conn.remote_addr();
            if tx.send(conn).is_err() {
                log::trace!("dropping new connection from {remote}: server is gone");
            }
        });
        let mut manager = ConnectionManager::new(transceiver, cfg, Some(hook));
        manager.spawn()?;
        log::info!("server listening on {}", manager.addr());
        Ok(Self {
            manager,
            incoming: rx,
        })
    }

    /// Blocks until a peer opens a connection.
    pub fn accept(&self) -> Result<Arc<Connection>> {
        self.incoming.recv().map_err(|_| Error::ManagerShutdown)
    }

    pub fn accept_timeout(&self, timeout: Duration) -> Result<Arc<Connection>> {
        self.incoming.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::ManagerShutdown,
        })
    }

    /// Returns a pending connection, if any, without blocking.
    pub fn try_accept(&self) -> Result<Option<Arc<Connection>>> {
        match self.incoming.try_recv() {
            Ok(conn) => Ok(Some(conn)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::ManagerShutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.manager.addr()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    pub fn connection(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        self.manager.connection(remote)
    }

    pub fn connection_count(&self) -> usize {
        self.manager.connection_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::connection::ConnectionState;
    use std::net::Ipv4Addr;

    #[test]
    fn echo_over_localhost_udp() {
        let server = Server::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let client = Client::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert!(server.try_accept().unwrap().is_none());

        let conn = client
            .connect(server.addr(), Duration::from_secs(5))
            .unwrap();
        let peer = server.accept_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer.remote_addr(), client.addr());
        assert_eq!(peer.state(), ConnectionState::Open);

        // the accepted side can speak first
        peer.send(b"hello").unwrap();
        assert_eq!(conn.receive_timeout(Duration::from_secs(5)).unwrap(), b"hello");

        conn.send(b"ping").unwrap();
        let msg = peer.receive_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg, b"ping");
        peer.send(b"pong").unwrap();
        assert_eq!(conn.receive_timeout(Duration::from_secs(5)).unwrap(), b"pong");
    }

    #[test]
    fn accept_timeout_without_peers() {
        let server = Server::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let err = server.accept_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn connect_to_non_listening_peer_times_out() {
        // a client socket does not accept connections and stays silent
        let other = Client::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let client = Client::with_config(
            (Ipv4Addr::LOCALHOST, 0),
            RdpConfig::new().retransmit_interval(Duration::from_millis(50)),
        )
        .unwrap();
        let err = client
            .connect(other.addr(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}

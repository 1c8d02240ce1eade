use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RdpConfig;
use crate::connection::{CloseReason, Connection, ConnectionState, ConnectionStats};
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::socket::RdpSocket;
use crate::transceiver::Transceiver;

/// The client role: opens connections to servers.
///
/// A client owns one socket and may hold connections to several servers at once.
/// Peers that were not connected to are ignored.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use rdp::Client;
///
/// let client = Client::new("0.0.0.0:0").unwrap();
/// let conn = client
///     .connect("127.0.0.1:40000".parse().unwrap(), Duration::from_secs(5))
///     .unwrap();
/// conn.send(b"hello").unwrap();
/// let reply = conn.receive().unwrap();
/// ```
pub struct Client<T: Transceiver = RdpSocket> {
    manager: ConnectionManager<T>,
}

impl Client<RdpSocket> {
    pub fn new(bind_addr: impl ToSocketAddrs) -> Result<Self> {
        Self::with_config(bind_addr, RdpConfig::default())
    }

    pub fn with_config(bind_addr: impl ToSocketAddrs, cfg: RdpConfig) -> Result<Self> {
        Self::with_transceiver(RdpSocket::new(bind_addr)?, cfg)
    }
}

impl<T: Transceiver> Client<T> {
    /// Creates a client over any datagram transport and starts its background threads.
    pub fn with_transceiver(transceiver: T, cfg: RdpConfig) -> Result<Self> {
        let mut manager = ConnectionManager::new(transceiver, cfg, None);
        manager.spawn()?;
        log::info!("client bound to {}", manager.addr());
        Ok(Self { manager })
    }

    /// Connects to `remote`, blocking until the connection is open or `timeout` elapses.
    ///
    /// # Errors
    /// * [`Error::ConnectionRefused`] if the server answered with a reset.
    /// * [`Error::ConnectionReset`] if the handshake was reset midway.
    /// * [`Error::Timeout`] if the server never answered.
    /// * [`Error::ConnectionExists`] if a connection to `remote` is already tracked.
    ///
    /// A failed attempt is torn down, so `connect` may be retried right away.
    pub fn connect(&self, remote: SocketAddr, timeout: Duration) -> Result<Arc<Connection>> {
        let conn = self.manager.open_active(remote)?;
        if conn.wait_for_state(ConnectionState::Open, timeout) {
            return Ok(conn);
        }
        let err = match conn.close_reason() {
            Some(CloseReason::Refused) => Error::ConnectionRefused,
            Some(CloseReason::Reset) => Error::ConnectionReset,
            _ => Error::Timeout,
        };
        log::debug!("connect to {remote} failed: {err}");
        conn.abort();
        Err(err)
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
    use std::net::Ipv4Addr;
    use std::time::Instant;

    #[test]
    fn connect_times_out_against_silent_peer() {
        let cfg = RdpConfig::new()
            .retransmit_interval(Duration::from_millis(50))
            .tick_interval(Duration::from_millis(20));
        let client = Client::with_config((Ipv4Addr::LOCALHOST, 0), cfg).unwrap();
        // bound but never read from
        let silent = RdpSocket::new((Ipv4Addr::LOCALHOST, 0)).unwrap();

        let start = Instant::now();
        let err = client
            .connect(silent.addr(), Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(client.connection_count(), 0);
        assert!(client.stats().retransmissions > 0);
    }
}

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::consts::SOCKET_POLL_INTERVAL;
use crate::error::Error;
use crate::transceiver::Transceiver;

#[derive(Debug, Clone)]
pub struct PacketEntry {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub packet: Vec<u8>,
}

pub type RoutingTable = Arc<Mutex<HashMap<u16, Sender<PacketEntry>>>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationConfig {
    pub packet_loss_percent: f64,
    pub duplicate_packet_percent: f64,
}

/// An in-memory network: every simulator registers its port in a shared routing table
/// and receives the datagrams other simulators send to that port.
pub struct NetworkSimulator {
    pub port: u16,
    pub cfg: SimulationConfig,
    routing_table: RoutingTable,
    rx: Receiver<PacketEntry>,
}

impl NetworkSimulator {
    pub fn new(port: u16, table: RoutingTable) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        table.lock().insert(port, tx);
        Self {
            port,
            cfg: SimulationConfig::default(),
            routing_table: table,
            rx,
        }
    }

    pub fn with_config(mut self, cfg: SimulationConfig) -> Self {
        self.cfg = cfg;
        self
    }
}

fn chance(percent: f64) -> bool {
    rand::random::<f64>() * 100.0 < percent
}

impl Transceiver for NetworkSimulator {
    type IntoError = Error;

    fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::IntoError> {
        match self.rx.recv_timeout(SOCKET_POLL_INTERVAL) {
            Ok(entry) => {
                let len = entry.packet.len();
                buf[..len].copy_from_slice(&entry.packet);
                Ok(Some((len, entry.from)))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn send(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, Self::IntoError> {
        let Some(tx) = self.routing_table.lock().get(&addr.port()).cloned() else {
            // nobody listens there, the datagram vanishes
            return Ok(buf.len());
        };
        if chance(self.cfg.packet_loss_percent) {
            log::trace!("simulator dropped {} bytes to {addr}", buf.len());
            return Ok(buf.len());
        }
        let entry = PacketEntry {
            from: self.addr(),
            to: addr,
            packet: buf.to_vec(),
        };
        if chance(self.cfg.duplicate_packet_percent) {
            tx.send(entry.clone()).ok();
        }
        tx.send(entry).ok();
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::client::Client;
    use crate::config::RdpConfig;
    use crate::connection::{Connection, ConnectionState};
    use crate::server::Server;

    const WAIT: Duration = Duration::from_secs(10);

    fn enable_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn fast_config() -> RdpConfig {
        RdpConfig::new()
            .retransmit_interval(Duration::from_millis(30))
            .tick_interval(Duration::from_millis(10))
            .close_wait_timeout(Duration::from_millis(100))
    }

    fn lossy() -> SimulationConfig {
        SimulationConfig {
            packet_loss_percent: 20.0,
            duplicate_packet_percent: 5.0,
        }
    }

    fn send_retrying(conn: &Connection, payload: &[u8]) {
        let start = Instant::now();
        loop {
            match conn.send(payload) {
                Ok(()) => return,
                Err(e) if e.is_retryable() && start.elapsed() < WAIT => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < WAIT {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn pair(
        client_sim: SimulationConfig,
        server_sim: SimulationConfig,
        client_cfg: RdpConfig,
        server_cfg: RdpConfig,
    ) -> (Client<NetworkSimulator>, Server<NetworkSimulator>) {
        let routing_table = RoutingTable::default();
        let client_sim = NetworkSimulator::new(40000, routing_table.clone()).with_config(client_sim);
        let server_sim = NetworkSimulator::new(50000, routing_table).with_config(server_sim);
        let server = Server::with_transceiver(server_sim, server_cfg).unwrap();
        let client = Client::with_transceiver(client_sim, client_cfg).unwrap();
        (client, server)
    }

    #[test]
    fn client_server_connect_send_recv() {
        enable_logging();
        let (client, server) = pair(
            SimulationConfig::default(),
            SimulationConfig::default(),
            fast_config(),
            fast_config(),
        );
        let conn = client.connect(server.addr(), WAIT).unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        let peer = server.accept_timeout(WAIT).unwrap();
        assert_eq!(peer.remote_addr(), client.addr());

        let mut payload = vec![b'a'];
        while !payload.contains(&b'z') {
            conn.send(&payload).unwrap();
            let mut msg = peer.receive_timeout(WAIT).unwrap();
            assert_eq!(msg, payload);
            msg.push(msg.last().unwrap() + 1);
            peer.send(&msg).unwrap();

            payload = conn.receive_timeout(WAIT).unwrap();
            assert_eq!(payload, msg);
            payload.push(payload.last().unwrap() + 1);
        }
        assert_eq!(server.connection_count(), 1);
        assert_eq!(client.connection_count(), 1);
    }

    #[test]
    fn lossy_network_delivers_everything_in_order() {
        enable_logging();
        let (client, server) = pair(lossy(), lossy(), fast_config(), fast_config().rcv_max(8));
        let conn = client.connect(server.addr(), WAIT).unwrap();
        let peer = server.accept_timeout(WAIT).unwrap();
        assert_eq!(peer.state(), ConnectionState::Open);

        let receiver = thread::spawn(move || {
            (0..100u32)
                .map(|_| peer.receive_timeout(WAIT).unwrap())
                .collect::<Vec<_>>()
        });
        for i in 0..100u32 {
            send_retrying(&conn, &i.to_be_bytes());
        }
        let received = receiver.join().unwrap();
        let expected: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(received, expected);
        assert!(client.stats().retransmissions > 0);
    }

    #[test]
    fn unsequenced_delivers_everything() {
        enable_logging();
        let (client, server) = pair(
            lossy(),
            lossy(),
            fast_config().sequenced(false),
            fast_config(),
        );
        let conn = client.connect(server.addr(), WAIT).unwrap();
        let peer = server.accept_timeout(WAIT).unwrap();
        assert!(!peer.is_sequenced());

        for i in 0..50u32 {
            send_retrying(&conn, &i.to_be_bytes());
        }
        let received: HashSet<Vec<u8>> = (0..50)
            .map(|_| peer.receive_timeout(WAIT).unwrap())
            .collect();
        assert_eq!(received.len(), 50);
    }

    #[test]
    fn multiple_clients() {
        enable_logging();
        let routing_table = RoutingTable::default();
        let server = Server::with_transceiver(
            NetworkSimulator::new(50000, routing_table.clone()),
            fast_config(),
        )
        .unwrap();
        let clients: Vec<_> = (40001..=40003u16)
            .map(|port| {
                Client::with_transceiver(
                    NetworkSimulator::new(port, routing_table.clone()),
                    fast_config(),
                )
                .unwrap()
            })
            .collect();

        let conns: Vec<_> = clients
            .iter()
            .map(|client| client.connect(server.addr(), WAIT).unwrap())
            .collect();
        for conn in &conns {
            conn.send(&conn.local_addr().port().to_be_bytes()).unwrap();
        }
        for _ in 0..conns.len() {
            let peer = server.accept_timeout(WAIT).unwrap();
            let msg = peer.receive_timeout(WAIT).unwrap();
            assert_eq!(msg, peer.remote_addr().port().to_be_bytes());
        }
        assert_eq!(server.connection_count(), 3);
    }

    #[test]
    fn connect_times_out_against_silent_address() {
        enable_logging();
        let routing_table = RoutingTable::default();
        let client = Client::with_transceiver(
            NetworkSimulator::new(40000, routing_table),
            fast_config(),
        )
        .unwrap();
        let silent = SocketAddr::from((Ipv4Addr::LOCALHOST, 60000));

        let start = Instant::now();
        let err = client.connect(silent, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(7));
        assert_eq!(client.connection_count(), 0);
    }

    #[test]
    fn close_resets_peer() {
        enable_logging();
        let (client, server) = pair(
            SimulationConfig::default(),
            SimulationConfig::default(),
            fast_config(),
            fast_config(),
        );
        let conn = client.connect(server.addr(), WAIT).unwrap();
        let peer = server.accept_timeout(WAIT).unwrap();

        let blocked = {
            let peer = peer.clone();
            thread::spawn(move || peer.receive())
        };
        conn.close().unwrap();
        assert!(matches!(blocked.join().unwrap(), Err(Error::ConnectionReset)));
        assert!(matches!(peer.send(b"late"), Err(Error::ConnectionReset)));

        // both sides leave close-wait once the grace period is over
        assert!(peer.wait_for_state(ConnectionState::Closed, WAIT));
        assert!(conn.wait_for_state(ConnectionState::Closed, WAIT));
        assert!(eventually(|| server.connection_count() == 0));
        assert!(eventually(|| client.connection_count() == 0));
    }

    #[test]
    fn reconnect_during_close_wait_is_refused() {
        enable_logging();
        let (client, server) = pair(
            SimulationConfig::default(),
            SimulationConfig::default(),
            fast_config(),
            fast_config().close_wait_timeout(Duration::from_secs(30)),
        );
        client.connect(server.addr(), WAIT).unwrap();
        let peer = server.accept_timeout(WAIT).unwrap();
        peer.close().unwrap();
        assert!(eventually(|| client.connection_count() == 0));

        let err = client.connect(server.addr(), WAIT).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused));
        assert!(server.try_accept().unwrap().is_none());
    }

    #[test]
    fn stats_are_aggregated() {
        enable_logging();
        let (client, server) = pair(
            SimulationConfig::default(),
            SimulationConfig::default(),
            fast_config(),
            fast_config(),
        );
        let conn = client.connect(server.addr(), WAIT).unwrap();
        let peer = server.accept_timeout(WAIT).unwrap();
        for _ in 0..10 {
            conn.send(&[7u8; 100]).unwrap();
        }
        for _ in 0..10 {
            peer.receive_timeout(WAIT).unwrap();
        }
        assert!(eventually(|| conn.unacked_len() == 0));

        let sent = client.stats();
        assert!(sent.packets_sent >= 12);
        assert!(sent.bytes_sent >= 10 * 112);
        assert!(server.stats().bytes_received >= 10 * 112);

        conn.close().unwrap();
        assert!(eventually(|| client.connection_count() == 0));
        assert!(client.stats().packets_sent >= sent.packets_sent);
    }
}

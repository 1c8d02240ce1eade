use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::config::RdpConfig;
use crate::connection::{Connection, ConnectionStats, Link};
use crate::consts::{MAX_PKT_BUF_SIZE, SOCKET_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::packet::{Flags, Packet, PacketView};
use crate::transceiver::Transceiver;

/// Called with every connection a peer opens to us, once its handshake has completed.
pub type NewConnectionHook = Box<dyn Fn(Arc<Connection>) + Send + Sync + 'static>;

#[derive(Default)]
struct ConnectionTable {
    active: HashMap<SocketAddr, Arc<Connection>>,
    // connections in close-wait, waiting for their grace period to expire
    closing: HashMap<SocketAddr, Arc<Connection>>,
}

impl ConnectionTable {
    fn get(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.active
            .get(addr)
            .or_else(|| self.closing.get(addr))
            .cloned()
    }
    fn contains(&self, addr: &SocketAddr) -> bool {
        self.active.contains_key(addr) || self.closing.contains_key(addr)
    }
}

fn is_same(entry: &Arc<Connection>, conn: &Connection) -> bool {
    std::ptr::eq(Arc::as_ptr(entry), conn)
}

struct Shared<T: Transceiver> {
    transceiver: T,
    cfg: RdpConfig,
    table: RwLock<ConnectionTable>,
    on_new_connection: Option<NewConnectionHook>,
    // counters of connections that are gone from the table
    retired: Mutex<ConnectionStats>,
}

impl<T: Transceiver> Link for Shared<T> {
    fn transmit(&self, buf: &[u8], to: SocketAddr) {
        let sent: Result<usize> = self.transceiver.send(buf, to).map_err(Into::into);
        if let Err(e) = sent {
            log::error!("failed to send {} bytes to {to}: {e}", buf.len());
        }
    }

    fn established(&self, conn: &Connection) {
        let Some(hook) = &self.on_new_connection else {
            return;
        };
        if !conn.is_passive() {
            return;
        }
        let addr = conn.remote_addr();
        let entry = self
            .table
            .read()
            .active
            .get(&addr)
            .filter(|c| is_same(c, conn))
            .cloned();
        if let Some(entry) = entry {
            log::debug!("connection from {addr} established");
            hook(entry);
        }
    }

    fn release(&self, conn: &Connection) {
        let addr = conn.remote_addr();
        let mut table = self.table.write();
        if !table.active.get(&addr).is_some_and(|c| is_same(c, conn)) {
            return;
        }
        if let Some(entry) = table.active.remove(&addr) {
            log::debug!("connection {addr} entering close-wait");
            table.closing.insert(addr, entry);
        }
    }

    fn close(&self, conn: &Connection) {
        let addr = conn.remote_addr();
        let removed = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            let mut removed = false;
            for map in [&mut table.active, &mut table.closing] {
                if map.get(&addr).is_some_and(|c| is_same(c, conn)) {
                    map.remove(&addr);
                    removed = true;
                }
            }
            removed
        };
        if removed {
            *self.retired.lock() += conn.stats();
            log::info!("connection {addr} closed");
        }
    }
}

impl<T: Transceiver> Shared<T> {
    fn link(self: &Arc<Self>) -> Weak<dyn Link> {
        let link: Arc<dyn Link> = self.clone();
        Arc::downgrade(&link)
    }

    fn new_connection(self: &Arc<Self>, remote: SocketAddr) -> Arc<Connection> {
        Arc::new(Connection::new(
            self.transceiver.addr(),
            remote,
            &self.cfg,
            self.link(),
        ))
    }

    fn on_datagram_received(self: &Arc<Self>, buf: &[u8], from: SocketAddr, now: Instant) {
        let view = match PacketView::parse(buf) {
            Ok(view) => view,
            Err(e) => {
                log::trace!("dropped malformed packet from {from}: {e}");
                return;
            }
        };
        let known = self.table.read().get(&from);
        if let Some(conn) = known {
            conn.on_segment_arrival(&view, now);
            return;
        }
        if self.on_new_connection.is_none() {
            log::trace!("ignored {view} from unknown peer {from}");
            return;
        }
        if view.flags() & (Flags::SYN | Flags::ACK | Flags::RST) != Flags::SYN {
            // behave like a closed endpoint
            if let Some(reset) = Packet::reset_for(&view) {
                log::trace!("resetting unknown peer {from}");
                self.transmit(reset.as_bytes(), from);
            }
            return;
        }
        let conn = self.new_connection(from);
        if let Err(e) = conn.open(true, self.cfg.get_rcv_max(), self.cfg.get_rbuf_max()) {
            log::error!("failed to open passive connection for {from}: {e}");
            return;
        }
        {
            let mut table = self.table.write();
            if table.contains(&from) {
                return;
            }
            table.active.insert(from, conn.clone());
        }
        log::debug!("new connection from {from}");
        conn.on_segment_arrival(&view, now);
    }

    fn tick(&self, now: Instant) {
        let (closing, active): (Vec<_>, Vec<_>) = {
            let table = self.table.read();
            (
                table.closing.values().cloned().collect(),
                table.active.values().cloned().collect(),
            )
        };
        for conn in closing {
            if conn.close_wait_deadline().is_some_and(|deadline| deadline <= now) {
                conn.close_wait_timeout();
            }
        }
        for conn in active {
            conn.on_retransmission_tick(now);
        }
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        let table = self.table.read();
        table
            .active
            .values()
            .chain(table.closing.values())
            .cloned()
            .collect()
    }
}

fn recv_loop<T: Transceiver>(shared: &Arc<Shared<T>>, stop: &Receiver<()>) {
    let mut buf = vec![0u8; MAX_PKT_BUF_SIZE];
    while let Err(TryRecvError::Empty) = stop.try_recv() {
        let received: Result<Option<(usize, SocketAddr)>> =
            shared.transceiver.recv(&mut buf).map_err(Into::into);
        match received {
            Ok(Some((len, from))) => shared.on_datagram_received(&buf[..len], from, Instant::now()),
            Ok(None) => {}
            Err(e) => {
                log::error!("failed to receive on {}: {e}", shared.transceiver.addr());
                thread::sleep(SOCKET_POLL_INTERVAL);
            }
        }
    }
    log::trace!("receive loop on {} stopped", shared.transceiver.addr());
}

fn tick_loop<T: Transceiver>(shared: &Shared<T>, stop: &Receiver<()>) {
    let ticker = crossbeam_channel::tick(shared.cfg.get_tick_interval());
    loop {
        select! {
            recv(ticker) -> now => match now {
                Ok(now) => shared.tick(now),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

/// Multiplexes RDP connections to many peers over a single [`Transceiver`].
///
/// The manager keeps a table of connections keyed by remote address, routes inbound datagrams
/// to them, creates passive connections for unknown peers sending a SYN (when a
/// [`NewConnectionHook`] is installed), and drives retransmission and close-wait expiry from a
/// periodic tick.
///
/// [`spawn`](ConnectionManager::spawn) starts two background threads: a receive loop and a tick
/// loop. Dropping the manager stops both and aborts every remaining connection.
pub struct ConnectionManager<T: Transceiver> {
    shared: Arc<Shared<T>>,
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Transceiver> ConnectionManager<T> {
    pub fn new(transceiver: T, cfg: RdpConfig, on_new_connection: Option<NewConnectionHook>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transceiver,
                cfg,
                table: RwLock::new(ConnectionTable::default()),
                on_new_connection,
                retired: Mutex::new(ConnectionStats::default()),
            }),
            shutdown: None,
            threads: Vec::new(),
        }
    }

    /// Starts the receive and tick threads. Does nothing if they are already running.
    pub fn spawn(&mut self) -> Result<()> {
        if self.shutdown.is_some() {
            return Ok(());
        }
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let name = self.addr().to_string();

        let shared = self.shared.clone();
        let stop = rx.clone();
        let recv = thread::Builder::new()
            .name(format!("rdp-recv {name}"))
            .spawn(move || recv_loop(&shared, &stop))?;
        self.threads.push(recv);

        let shared = self.shared.clone();
        let tick = thread::Builder::new()
            .name(format!("rdp-tick {name}"))
            .spawn(move || tick_loop(&shared, &rx))?;
        self.threads.push(tick);

        self.shutdown = Some(tx);
        log::debug!("connection manager on {name} started");
        Ok(())
    }

    /// Actively opens a connection to `remote`, sending the SYN right away.
    ///
    /// Fails with [`Error::ConnectionExists`] if a connection to `remote` is already tracked,
    /// including one still lingering in close-wait.
    pub fn open_active(&self, remote: SocketAddr) -> Result<Arc<Connection>> {
        let conn = self.shared.new_connection(remote);
        {
            let mut table = self.shared.table.write();
            if table.contains(&remote) {
                return Err(Error::ConnectionExists(remote));
            }
            table.active.insert(remote, conn.clone());
        }
        let cfg = &self.shared.cfg;
        if let Err(e) = conn.open(false, cfg.get_rcv_max(), cfg.get_rbuf_max()) {
            self.shared.table.write().active.remove(&remote);
            return Err(e);
        }
        log::debug!("connecting to {remote}");
        Ok(conn)
    }

    /// Routes one inbound datagram. Malformed datagrams are dropped.
    pub fn on_datagram_received(&self, buf: &[u8], from: SocketAddr) {
        self.shared.on_datagram_received(buf, from, Instant::now())
    }

    /// Expires close-wait connections whose grace period ended and retransmits overdue packets.
    pub fn tick(&self, now: Instant) {
        self.shared.tick(now)
    }

    /// Counters summed over every connection this manager has tracked.
    pub fn stats(&self) -> ConnectionStats {
        let live: ConnectionStats = self.shared.connections().iter().map(|c| c.stats()).sum();
        let mut total = *self.shared.retired.lock();
        total += live;
        total
    }

    pub fn connection(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        self.shared.table.read().get(&remote)
    }

    /// Number of tracked connections, including those in close-wait.
    pub fn connection_count(&self) -> usize {
        let table = self.shared.table.read();
        table.active.len() + table.closing.len()
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.transceiver.addr()
    }

    pub fn config(&self) -> &RdpConfig {
        &self.shared.cfg
    }
}

impl<T: Transceiver> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("connection manager thread panicked");
            }
        }
        for conn in self.shared.connections() {
            conn.abort();
        }
    }
}

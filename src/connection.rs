use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::ops::AddAssign;
use std::sync::Weak;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::RdpConfig;
use crate::consts::{FIXED_HEADER_SIZE, UDP_IP_OVERHEAD};
use crate::error::{Error, Result};
use crate::packet::{Flags, Packet, PacketView, SynOptions};
use crate::seq::{seq_in_window, seq_le, seq_lt};

/// Where a connection sends its packets and reports lifecycle changes.
///
/// Implemented by the connection manager. Callbacks run after the connection
/// lock has been released.
pub(crate) trait Link: Send + Sync {
    fn transmit(&self, buf: &[u8], to: SocketAddr);
    /// The connection moved from `SynRcvd` to `Open`.
    fn established(&self, conn: &Connection);
    /// The connection entered close-wait.
    fn release(&self, conn: &Connection);
    /// The connection reached `Closed`.
    fn close(&self, conn: &Connection);
}

/// The states of the RDP connection state machine.
///
/// A connection starts in `Closed`. An active open sends a SYN and moves to `SynSent`,
/// a passive open moves to `Listen`. Both sides meet in `Open`, where data flows.
/// A reset moves an open connection to `CloseWait`, where it lingers for a grace period
/// answering stray packets with resets before it finally returns to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Open,
    CloseWait,
}

impl ConnectionState {
    /// Returns true while data may still arrive on the connection.
    fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Listen
                | ConnectionState::SynSent
                | ConnectionState::SynRcvd
                | ConnectionState::Open
        )
    }
}

/// Why a connection left `Open` (or never got there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed or aborted by the local application.
    Local,
    /// The peer sent a reset.
    Reset,
    /// The peer answered our SYN with a reset.
    Refused,
    /// The peer sent a packet that is illegal in the current state.
    ProtocolViolation,
}

/// Per-connection counters. The manager sums them across connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    /// Inbound packets dropped as stale, duplicate or out of window.
    pub duplicates: u64,
}

impl AddAssign for ConnectionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.packets_sent += rhs.packets_sent;
        self.packets_received += rhs.packets_received;
        self.bytes_sent += rhs.bytes_sent;
        self.bytes_received += rhs.bytes_received;
        self.retransmissions += rhs.retransmissions;
        self.duplicates += rhs.duplicates;
    }
}

impl std::iter::Sum for ConnectionStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Established,
    Released,
    Closed,
}

struct Unacked {
    packet: Packet,
    deadline: Instant,
}

/// Connection control block. Only ever touched with the connection lock held.
struct Tcb {
    remote_addr: SocketAddr,
    state: ConnectionState,
    passive: bool,
    sequenced: bool,

    snd_iss: u32,
    snd_nxt: u32,
    snd_una: u32,
    snd_max: u32,
    sbuf_max: usize,

    rcv_irs: u32,
    rcv_cur: u32,
    rcv_max: u16,
    rbuf_max: u16,

    unacked: BTreeMap<u32, Unacked>,
    // `None` marks a NUL segment, or a segment already handed out through `unordered`
    out_of_order: BTreeMap<u32, Option<Vec<u8>>>,
    ready: VecDeque<Vec<u8>>,
    unordered: VecDeque<Vec<u8>>,

    retransmit_interval: Duration,
    close_wait_timeout: Duration,
    close_wait_deadline: Option<Instant>,
    close_reason: Option<CloseReason>,
    stats: ConnectionStats,

    outbox: Vec<Vec<u8>>,
    lifecycle: Option<Lifecycle>,
}

impl Tcb {
    fn new(remote_addr: SocketAddr, cfg: &RdpConfig) -> Self {
        Self {
            remote_addr,
            state: ConnectionState::Closed,
            passive: false,
            sequenced: cfg.is_sequenced(),
            snd_iss: 0,
            snd_nxt: 0,
            snd_una: 0,
            snd_max: 1,
            sbuf_max: 0,
            rcv_irs: 0,
            rcv_cur: 0,
            rcv_max: cfg.get_rcv_max(),
            rbuf_max: cfg.get_rbuf_max(),
            unacked: BTreeMap::new(),
            out_of_order: BTreeMap::new(),
            ready: VecDeque::new(),
            unordered: VecDeque::new(),
            retransmit_interval: cfg.get_retransmit_interval(),
            close_wait_timeout: cfg.get_close_wait_timeout(),
            close_wait_deadline: None,
            close_reason: None,
            stats: ConnectionStats::default(),
            outbox: Vec::new(),
            lifecycle: None,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        log::debug!(
            "connection {} state changing from {:?} to {:?}",
            self.remote_addr,
            self.state,
            state
        );
        self.state = state;
    }

    fn clear_queues(&mut self) {
        self.unacked.clear();
        self.out_of_order.clear();
        self.ready.clear();
        self.unordered.clear();
    }

    fn enter_close_wait(&mut self, reason: CloseReason, now: Instant) {
        self.set_state(ConnectionState::CloseWait);
        self.clear_queues();
        self.close_reason.get_or_insert(reason);
        self.close_wait_deadline = Some(now + self.close_wait_timeout);
        self.lifecycle = Some(Lifecycle::Released);
    }

    fn enter_closed(&mut self, reason: CloseReason) {
        self.set_state(ConnectionState::Closed);
        self.clear_queues();
        self.close_reason.get_or_insert(reason);
        self.close_wait_deadline = None;
        self.lifecycle = Some(Lifecycle::Closed);
    }

    /// The error a failed send/receive reports once the connection is unusable.
    fn unusable_error(&self) -> Error {
        match self.close_reason {
            Some(CloseReason::Reset) => Error::ConnectionReset,
            Some(CloseReason::Refused) => Error::ConnectionRefused,
            _ => Error::NotOpen,
        }
    }

    fn own_options(&self) -> SynOptions {
        SynOptions {
            max_segments: self.rcv_max,
            max_segment_size: self.rbuf_max,
            sequenced: self.sequenced,
        }
    }

    /// Peer-advertised limits from a SYN are always adopted.
    fn adopt_peer(&mut self, view: &PacketView<'_>) {
        self.rcv_irs = view.seq();
        self.rcv_cur = view.seq();
        if let Some(opts) = view.syn_options() {
            self.snd_max = opts.max_segments.max(1) as u32;
            self.sbuf_max = opts.max_segment_size as usize;
            if self.passive {
                self.sequenced = opts.sequenced;
            }
        }
    }

    fn emit(&mut self, packet: &Packet) {
        log::trace!("connection {} sending {}", self.remote_addr, packet);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.len() as u64;
        self.outbox.push(packet.as_bytes().to_vec());
    }

    fn emit_reliable(&mut self, packet: Packet, now: Instant) {
        self.emit(&packet);
        self.unacked.insert(
            packet.seq(),
            Unacked {
                packet,
                deadline: now + self.retransmit_interval,
            },
        );
    }

    /// Reset as sent by an endpoint with no synchronized state for the peer.
    fn reply_reset(&mut self, view: &PacketView<'_>) {
        if let Some(reset) = Packet::reset_for(view) {
            self.emit(&reset);
        }
    }

    /// ACK, with an EAK list of every buffered out-of-order segment.
    fn send_ack(&mut self) {
        let rcv_cur = self.rcv_cur;
        let mut buffered: Vec<u32> = self.out_of_order.keys().copied().collect();
        buffered.sort_by_key(|seq| seq.wrapping_sub(rcv_cur));
        let packet = Packet::eak(self.snd_nxt, self.rcv_cur, &buffered);
        self.emit(&packet);
    }

    fn open(&mut self, passive: bool, rcv_max: u16, rbuf_max: u16, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Closed {
            return Err(Error::AlreadyOpen);
        }
        self.clear_queues();
        self.passive = passive;
        self.rcv_max = rcv_max.max(1);
        self.rbuf_max = rbuf_max;
        self.close_reason = None;
        self.close_wait_deadline = None;
        self.snd_iss = rand::random();
        self.snd_nxt = self.snd_iss.wrapping_add(1);
        self.snd_una = self.snd_iss;
        if passive {
            self.set_state(ConnectionState::Listen);
        } else {
            let syn = Packet::syn(self.snd_iss, None, self.own_options());
            self.emit_reliable(syn, now);
            self.set_state(ConnectionState::SynSent);
        }
        Ok(())
    }

    fn send(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(self.unusable_error());
        }
        self.check_window()?;
        let size = FIXED_HEADER_SIZE + payload.len() + UDP_IP_OVERHEAD;
        if size > self.sbuf_max {
            return Err(Error::Fragmentation {
                size,
                max: self.sbuf_max,
            });
        }
        let packet = Packet::data(self.snd_nxt, self.rcv_cur, payload)?;
        self.emit_reliable(packet, now);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        Ok(())
    }

    fn keepalive(&mut self, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(self.unusable_error());
        }
        self.check_window()?;
        let packet = Packet::nul(self.snd_nxt, self.rcv_cur);
        self.emit_reliable(packet, now);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        Ok(())
    }

    fn check_window(&self) -> Result<()> {
        let outstanding = self.snd_nxt.wrapping_sub(self.snd_una);
        if outstanding >= self.snd_max {
            return Err(Error::ResourceExhausted { outstanding });
        }
        Ok(())
    }

    fn pop_ready(&mut self) -> Option<Vec<u8>> {
        match self.ready.pop_front() {
            Some(payload) => Some(payload),
            None if !self.sequenced => self.unordered.pop_front(),
            None => None,
        }
    }

    fn close(&mut self, now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::Open => {
                self.emit(&Packet::rst(self.snd_nxt, None));
                self.enter_close_wait(CloseReason::Local, now);
            }
            ConnectionState::Listen => self.enter_closed(CloseReason::Local),
            ConnectionState::SynSent | ConnectionState::SynRcvd => {
                self.emit(&Packet::rst(self.snd_nxt, None));
                self.enter_closed(CloseReason::Local);
            }
            ConnectionState::CloseWait => return Err(Error::Closing),
            ConnectionState::Closed => return Err(Error::NotOpen),
        }
        Ok(())
    }

    fn abort(&mut self) {
        match self.state {
            ConnectionState::Closed => {}
            ConnectionState::Listen | ConnectionState::CloseWait => {
                self.enter_closed(CloseReason::Local)
            }
            ConnectionState::SynSent | ConnectionState::SynRcvd | ConnectionState::Open => {
                self.emit(&Packet::rst(self.snd_nxt, None));
                self.enter_closed(CloseReason::Local);
            }
        }
    }

    fn close_wait_timeout(&mut self) {
        if self.state == ConnectionState::CloseWait {
            log::debug!("connection {} close-wait expired", self.remote_addr);
            self.enter_closed(CloseReason::Local);
        }
    }

    fn on_retransmission_tick(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::SynSent | ConnectionState::SynRcvd | ConnectionState::Open
        ) {
            return;
        }
        let rcv_cur = self.rcv_cur;
        let mut resent = 0u64;
        for entry in self.unacked.values_mut().filter(|e| e.deadline <= now) {
            if entry.packet.has(Flags::ACK) {
                entry.packet.set_ack(rcv_cur);
            }
            entry.deadline = now + self.retransmit_interval;
            log::trace!("connection {} retransmitting {}", self.remote_addr, entry.packet);
            self.stats.bytes_sent += entry.packet.len() as u64;
            self.outbox.push(entry.packet.as_bytes().to_vec());
            resent += 1;
        }
        self.stats.packets_sent += resent;
        self.stats.retransmissions += resent;
    }

    fn on_segment_arrival(&mut self, view: &PacketView<'_>, now: Instant) {
        log::trace!("connection {} received {}", self.remote_addr, view);
        self.stats.packets_received += 1;
        self.stats.bytes_received += view.as_bytes().len() as u64;
        match self.state {
            ConnectionState::Closed | ConnectionState::CloseWait => self.reply_reset(view),
            ConnectionState::Listen => self.on_listen(view, now),
            ConnectionState::SynSent => self.on_syn_sent(view, now),
            ConnectionState::SynRcvd | ConnectionState::Open => self.on_synchronized(view, now),
        }
    }

    fn on_listen(&mut self, view: &PacketView<'_>, now: Instant) {
        if view.has(Flags::RST) {
            return;
        }
        if view.has(Flags::ACK) || view.has(Flags::NUL) {
            self.reply_reset(view);
            return;
        }
        if !view.has(Flags::SYN) {
            return;
        }
        self.adopt_peer(view);
        let syn_ack = Packet::syn(self.snd_iss, Some(self.rcv_cur), self.own_options());
        self.emit_reliable(syn_ack, now);
        self.set_state(ConnectionState::SynRcvd);
    }

    fn on_syn_sent(&mut self, view: &PacketView<'_>, now: Instant) {
        if view.has(Flags::ACK) && view.ack() != self.snd_iss {
            if !view.has(Flags::RST) {
                self.emit(&Packet::rst(view.ack().wrapping_add(1), None));
            }
            return;
        }
        if view.has(Flags::RST) {
            if view.has(Flags::ACK) {
                log::info!("connection to {} refused", self.remote_addr);
                self.enter_closed(CloseReason::Refused);
            }
            return;
        }
        if !view.has(Flags::SYN) {
            return;
        }
        self.adopt_peer(view);
        if view.has(Flags::ACK) {
            self.snd_una = view.ack().wrapping_add(1);
            self.unacked.clear();
            self.set_state(ConnectionState::Open);
            self.send_ack();
            log::info!("connected to {}", self.remote_addr);
        } else {
            // simultaneous open: our SYN becomes a SYN+ACK
            let syn_ack = Packet::syn(self.snd_iss, Some(self.rcv_cur), self.own_options());
            self.unacked.clear();
            self.emit_reliable(syn_ack, now);
            self.set_state(ConnectionState::SynRcvd);
        }
    }

    fn on_synchronized(&mut self, view: &PacketView<'_>, now: Instant) {
        let seq = view.seq();
        let horizon = self.rcv_cur.wrapping_add(2 * self.rcv_max as u32);
        if !seq_in_window(seq, self.rcv_cur, horizon) {
            log::trace!(
                "connection {} dropping out-of-window seq {} (rcv_cur {})",
                self.remote_addr,
                seq,
                self.rcv_cur
            );
            self.stats.duplicates += 1;
            if !view.has(Flags::RST) {
                self.send_ack();
            }
            return;
        }
        if view.has(Flags::RST) {
            log::info!("connection {} reset by peer", self.remote_addr);
            match self.state {
                ConnectionState::Open => self.enter_close_wait(CloseReason::Reset, now),
                _ => self.enter_closed(CloseReason::Reset),
            }
            return;
        }
        let syn_rcvd = self.state == ConnectionState::SynRcvd;
        if view.has(Flags::SYN) || (syn_rcvd && view.has(Flags::EAK)) {
            log::debug!("connection {} protocol violation: {}", self.remote_addr, view);
            self.emit(&Packet::rst(self.snd_nxt, None));
            self.enter_closed(CloseReason::ProtocolViolation);
            return;
        }
        if !view.has(Flags::ACK) {
            return;
        }
        if syn_rcvd {
            if view.ack() != self.snd_iss {
                self.emit(&Packet::rst(view.ack().wrapping_add(1), None));
                self.enter_closed(CloseReason::ProtocolViolation);
                return;
            }
            self.snd_una = view.ack().wrapping_add(1);
            self.unacked.clear();
            self.set_state(ConnectionState::Open);
            self.lifecycle = Some(Lifecycle::Established);
            log::info!("accepted connection from {}", self.remote_addr);
        } else {
            self.process_ack(view.ack());
        }
        if view.has(Flags::EAK) {
            self.process_eak(view);
        }
        if view.data_len() > 0 || view.has(Flags::NUL) {
            let payload = if view.has(Flags::NUL) {
                None
            } else {
                Some(view.payload().to_vec())
            };
            self.accept_segment(seq, payload);
            self.send_ack();
        }
    }

    fn process_ack(&mut self, ack: u32) {
        if !(seq_le(self.snd_una, ack) && seq_lt(ack, self.snd_nxt)) {
            return;
        }
        self.unacked.retain(|&seq, _| !seq_le(seq, ack));
        self.snd_una = ack.wrapping_add(1);
    }

    fn process_eak(&mut self, view: &PacketView<'_>) {
        for seq in view.eak_entries() {
            if seq_le(self.snd_una, seq) && seq_lt(seq, self.snd_nxt) {
                self.unacked.remove(&seq);
            }
        }
    }

    fn accept_segment(&mut self, seq: u32, payload: Option<Vec<u8>>) {
        if self.out_of_order.contains_key(&seq) {
            self.stats.duplicates += 1;
            return;
        }
        let in_order = seq == self.rcv_cur.wrapping_add(1);
        match payload {
            Some(payload) if !in_order && !self.sequenced => {
                self.unordered.push_back(payload);
                self.out_of_order.insert(seq, None);
            }
            payload => {
                self.out_of_order.insert(seq, payload);
            }
        }
        while let Some(segment) = self.out_of_order.remove(&self.rcv_cur.wrapping_add(1)) {
            self.rcv_cur = self.rcv_cur.wrapping_add(1);
            if let Some(payload) = segment {
                self.ready.push_back(payload);
            }
        }
    }
}

/// One RDP connection to a remote peer.
///
/// Connections are created by a [`Client`](crate::Client) or [`Server`](crate::Server) and handed
/// out as `Arc<Connection>`; every method takes `&self` and may be called from any thread.
/// All protocol state lives behind a per-connection lock, so acknowledgment processing and data
/// delivery for one connection never interleave.
pub struct Connection {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    link: Weak<dyn Link>,
    tcb: Mutex<Tcb>,
    cond: Condvar,
}

impl Connection {
    pub(crate) fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        cfg: &RdpConfig,
        link: Weak<dyn Link>,
    ) -> Self {
        Self {
            local_addr,
            remote_addr,
            link,
            tcb: Mutex::new(Tcb::new(remote_addr, cfg)),
            cond: Condvar::new(),
        }
    }

    /// Runs `f` under the connection lock, then wakes waiters and flushes
    /// queued packets and lifecycle callbacks with the lock released.
    fn with_tcb<R>(&self, f: impl FnOnce(&mut Tcb) -> R) -> R {
        let mut tcb = self.tcb.lock();
        let out = f(&mut tcb);
        let outbox = std::mem::take(&mut tcb.outbox);
        let lifecycle = tcb.lifecycle.take();
        drop(tcb);
        self.cond.notify_all();
        self.flush(outbox, lifecycle);
        out
    }

    fn flush(&self, outbox: Vec<Vec<u8>>, lifecycle: Option<Lifecycle>) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        for buf in &outbox {
            link.transmit(buf, self.remote_addr);
        }
        match lifecycle {
            Some(Lifecycle::Established) => link.established(self),
            Some(Lifecycle::Released) => link.release(self),
            Some(Lifecycle::Closed) => link.close(self),
            None => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock()
    }

    /// Waits for a change to the connection, returning true once `deadline` has passed.
    /// A deadline too far out to represent waits without one.
    fn wait(&self, tcb: &mut MutexGuard<'_, Tcb>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.cond.wait_until(tcb, deadline).timed_out(),
            None => {
                self.cond.wait(tcb);
                false
            }
        }
    }

    /// Opens the connection.
    ///
    /// A passive open waits in `Listen` for the peer's SYN. An active open sends a SYN advertising
    /// `rcv_max` and `rbuf_max` and moves to `SynSent`. Fails with [`Error::AlreadyOpen`] unless
    /// the connection is `Closed`.
    pub fn open(&self, passive: bool, rcv_max: u16, rbuf_max: u16) -> Result<()> {
        self.with_tcb(|tcb| tcb.open(passive, rcv_max, rbuf_max, Instant::now()))
    }

    /// Sends one message.
    ///
    /// # Errors
    /// * [`Error::ResourceExhausted`] if the peer's window of unacknowledged packets is full.
    /// * [`Error::Fragmentation`] if the packet would exceed the peer's maximum segment size.
    /// * [`Error::ConnectionReset`], [`Error::NotOpen`] if the connection is not `Open`.
    ///
    /// Nothing is queued or transmitted when an error is returned.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.with_tcb(|tcb| tcb.send(payload, Instant::now()))
    }

    /// Sends a NUL segment. It occupies a sequence number and is acknowledged like data,
    /// but is never delivered to the peer application.
    pub fn keepalive(&self) -> Result<()> {
        self.with_tcb(|tcb| tcb.keepalive(Instant::now()))
    }

    /// Blocks until a message is available and returns it.
    ///
    /// Sequenced connections return messages strictly in order. Unsequenced connections
    /// additionally return messages that arrived ahead of a gap, once no in-order message is waiting.
    /// Fails once the connection is closed, reset, or in close-wait; a thread blocked here is
    /// woken when that happens.
    pub fn receive(&self) -> Result<Vec<u8>> {
        let mut tcb = self.lock();
        loop {
            if let Some(payload) = tcb.pop_ready() {
                return Ok(payload);
            }
            if !tcb.state.is_live() {
                return Err(tcb.unusable_error());
            }
            self.cond.wait(&mut tcb);
        }
    }

    /// Like [`receive`](Connection::receive), but gives up with [`Error::Timeout`].
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut tcb = self.lock();
        loop {
            if let Some(payload) = tcb.pop_ready() {
                return Ok(payload);
            }
            if !tcb.state.is_live() {
                return Err(tcb.unusable_error());
            }
            if self.wait(&mut tcb, deadline) {
                return tcb.pop_ready().ok_or(Error::Timeout);
            }
        }
    }

    /// Returns the next message if one is ready, without blocking.
    pub fn try_receive(&self) -> Result<Option<Vec<u8>>> {
        let mut tcb = self.lock();
        match tcb.pop_ready() {
            Some(payload) => Ok(Some(payload)),
            None if tcb.state.is_live() => Ok(None),
            None => Err(tcb.unusable_error()),
        }
    }

    /// Closes the connection.
    ///
    /// An open connection sends a reset and lingers in close-wait; a handshaking one sends a reset
    /// and closes immediately. Fails with [`Error::Closing`] in close-wait and [`Error::NotOpen`]
    /// when already closed.
    pub fn close(&self) -> Result<()> {
        self.with_tcb(|tcb| tcb.close(Instant::now()))
    }

    /// Tears the connection down to `Closed` immediately, skipping close-wait.
    pub fn abort(&self) {
        self.with_tcb(|tcb| tcb.abort())
    }

    /// Blocks until the connection reaches `state`, returning `false` if `timeout` elapses
    /// first or the connection closes in a way that can no longer reach `state`.
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut tcb = self.lock();
        loop {
            if tcb.state == state {
                return true;
            }
            let terminal = tcb.state == ConnectionState::Closed
                || (tcb.state == ConnectionState::CloseWait && state != ConnectionState::Closed);
            if terminal {
                return false;
            }
            if self.wait(&mut tcb, deadline) {
                return tcb.state == state;
            }
        }
    }

    /// Feeds one inbound packet through the state machine.
    pub fn on_segment_arrival(&self, view: &PacketView<'_>, now: Instant) {
        self.with_tcb(|tcb| tcb.on_segment_arrival(view, now))
    }

    /// Resends every unacknowledged packet whose retransmission deadline has passed.
    pub fn on_retransmission_tick(&self, now: Instant) {
        self.with_tcb(|tcb| tcb.on_retransmission_tick(now))
    }

    /// Ends close-wait, moving the connection to `Closed`.
    pub fn close_wait_timeout(&self) {
        self.with_tcb(|tcb| tcb.close_wait_timeout())
    }

    pub fn close_wait_deadline(&self) -> Option<Instant> {
        self.lock().close_wait_deadline
    }
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
    pub fn is_passive(&self) -> bool {
        self.lock().passive
    }
    pub fn is_sequenced(&self) -> bool {
        self.lock().sequenced
    }
    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats
    }
    pub fn snd_iss(&self) -> u32 {
        self.lock().snd_iss
    }
    pub fn snd_nxt(&self) -> u32 {
        self.lock().snd_nxt
    }
    pub fn snd_una(&self) -> u32 {
        self.lock().snd_una
    }
    /// The peer's limit on our unacknowledged packets.
    pub fn snd_max(&self) -> u32 {
        self.lock().snd_max
    }
    /// The peer's maximum segment size.
    pub fn sbuf_max(&self) -> usize {
        self.lock().sbuf_max
    }
    pub fn rcv_cur(&self) -> u32 {
        self.lock().rcv_cur
    }
    pub fn rcv_irs(&self) -> u32 {
        self.lock().rcv_irs
    }
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }
    pub fn out_of_order_len(&self) -> usize {
        self.lock().out_of_order.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

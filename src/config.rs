use std::time::Duration;

use crate::consts::{
    DEFAULT_CLOSE_WAIT_TIMEOUT, DEFAULT_RBUF_MAX, DEFAULT_RCV_MAX, DEFAULT_RETRANSMIT_INTERVAL,
    DEFAULT_SEQUENCED, DEFAULT_TICK_INTERVAL,
};

/// Configuration shared by every connection of a client or server.
///
/// * `rcv_max` - The number of unacknowledged segments this side will buffer, advertised in SYNs.
/// * `rbuf_max` - The largest packet (including IP/UDP overhead) this side accepts, advertised in SYNs.
/// * `sequenced` - Whether actively opened connections require in-order delivery.
/// * `retransmit_interval` - How long an unacknowledged packet waits before it is sent again.
/// * `close_wait_timeout` - How long a connection lingers in close-wait answering stray packets.
/// * `tick_interval` - How often the manager checks retransmission and close-wait timers.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use rdp::RdpConfig;
///
/// let cfg = RdpConfig::new()
///     .rcv_max(64)
///     .sequenced(false)
///     .retransmit_interval(Duration::from_millis(200));
/// assert_eq!(cfg.get_rcv_max(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct RdpConfig {
    rcv_max: u16,
    rbuf_max: u16,
    sequenced: bool,
    retransmit_interval: Duration,
    close_wait_timeout: Duration,
    tick_interval: Duration,
}

impl Default for RdpConfig {
    fn default() -> Self {
        Self {
            rcv_max: DEFAULT_RCV_MAX,
            rbuf_max: DEFAULT_RBUF_MAX,
            sequenced: DEFAULT_SEQUENCED,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            close_wait_timeout: DEFAULT_CLOSE_WAIT_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl RdpConfig {
    /// Create a new, default configuration.
    pub fn new() -> Self {
        Self::default()
    }
    /// Set the number of outstanding segments this side will buffer.
    /// The default is 256.
    pub fn rcv_max(mut self, rcv_max: u16) -> Self {
        self.rcv_max = rcv_max.max(1);
        self
    }
    /// Set the largest packet this side accepts. The default is 4096 bytes.
    pub fn rbuf_max(mut self, rbuf_max: u16) -> Self {
        self.rbuf_max = rbuf_max;
        self
    }
    /// Set whether actively opened connections deliver strictly in order.
    /// The default is `true`. Passively opened connections follow the peer's choice.
    pub fn sequenced(mut self, sequenced: bool) -> Self {
        self.sequenced = sequenced;
        self
    }
    /// The default is 1 second.
    pub fn retransmit_interval(mut self, interval: Duration) -> Self {
        self.retransmit_interval = interval;
        self
    }
    /// The default is 30 seconds.
    pub fn close_wait_timeout(mut self, timeout: Duration) -> Self {
        self.close_wait_timeout = timeout;
        self
    }
    /// The default is 1 second.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn get_rcv_max(&self) -> u16 {
        self.rcv_max
    }
    pub fn get_rbuf_max(&self) -> u16 {
        self.rbuf_max
    }
    pub fn is_sequenced(&self) -> bool {
        self.sequenced
    }
    pub fn get_retransmit_interval(&self) -> Duration {
        self.retransmit_interval
    }
    pub fn get_close_wait_timeout(&self) -> Duration {
        self.close_wait_timeout
    }
    pub fn get_tick_interval(&self) -> Duration {
        self.tick_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RdpConfig::default();
        assert_eq!(cfg.get_rcv_max(), 256);
        assert_eq!(cfg.get_rbuf_max(), 4096);
        assert!(cfg.is_sequenced());
        assert_eq!(cfg.get_retransmit_interval(), Duration::from_millis(1000));
        assert_eq!(cfg.get_close_wait_timeout(), Duration::from_millis(30_000));
    }

    #[test]
    fn zero_window_is_clamped() {
        assert_eq!(RdpConfig::new().rcv_max(0).get_rcv_max(), 1);
    }
}

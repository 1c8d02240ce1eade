use std::time::Duration;

pub const RDP_VERSION: u8 = 2;

/// Size of the fixed header, in bytes.
pub const FIXED_HEADER_SIZE: usize = 12;
/// Size of the SYN variable header, in bytes (includes one pad byte).
pub const SYN_HEADER_SIZE: usize = 6;
pub const EAK_ENTRY_SIZE: usize = 4;
/// Largest header the one-byte header length field can describe (255 words, rounded down to even).
pub const MAX_HEADER_SIZE: usize = 510;
/// Maximum number of out-of-order sequence numbers one EAK packet can carry.
pub const MAX_EAK_ENTRIES: usize = (MAX_HEADER_SIZE - FIXED_HEADER_SIZE) / EAK_ENTRY_SIZE;
/// IPv4 (20) + UDP (8) header bytes assumed when checking a packet against the peer's segment size.
pub const UDP_IP_OVERHEAD: usize = 28;
pub const MAX_PKT_BUF_SIZE: usize = 65_535;

pub const DEFAULT_RCV_MAX: u16 = 256;
pub const DEFAULT_RBUF_MAX: u16 = 4096;
pub const DEFAULT_SEQUENCED: bool = true;
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_CLOSE_WAIT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

pub(crate) const SERVER_SOCKET_RECV_BUF_SIZE: usize = 4 * 1024 * 1024;
pub(crate) const SERVER_SOCKET_SEND_BUF_SIZE: usize = 4 * 1024 * 1024;
/// How long the receive loop blocks on the socket before checking for shutdown.
pub(crate) const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

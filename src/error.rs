use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Socket(#[from] crate::socket::Error),
    #[error("invalid packet: {0}")]
    Packet(#[from] crate::packet::Error),
    #[error("connection refused by peer")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("packet size {size} exceeds the peer's maximum segment size of {max}")]
    Fragmentation { size: usize, max: usize },
    #[error("send window is full ({outstanding} unacknowledged packets)")]
    ResourceExhausted { outstanding: u32 },
    #[error("timed out waiting for the connection")]
    Timeout,
    #[error("connection is not open")]
    NotOpen,
    #[error("connection is already open")]
    AlreadyOpen,
    #[error("connection is already closing")]
    Closing,
    #[error("a connection to {0} already exists")]
    ConnectionExists(SocketAddr),
    #[error("connection manager has shut down")]
    ManagerShutdown,
}

impl Error {
    /// Returns true if the same operation may succeed when retried later, unchanged.
    ///
    /// A [`Fragmentation`](Error::Fragmentation) error is not retryable as is,
    /// the payload has to shrink first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. } | Error::Timeout)
    }
}

use std::net::SocketAddr;

use crate::error::Error;

/// A trait for sending and receiving datagrams.
///
/// The connection manager is generic over `T: Transceiver`, which lets any datagram transport
/// stand in for the default [`RdpSocket`](crate::RdpSocket) (the tests use an in-memory network).
///
/// Implementations are shared between the receive loop, the tick thread and every caller
/// thread that sends, so they must be `Send + Sync`.
pub trait Transceiver: Send + Sync + 'static {
    type IntoError: Into<Error>;
    /// Returns the local address of the socket (i.e. the address it is bound to).
    fn addr(&self) -> SocketAddr;
    /// Receives a datagram, if one arrives within a short poll interval.
    ///
    /// May block, but only briefly: the receive loop checks for shutdown between calls.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::IntoError>;
    /// Sends a datagram to the specified address.
    ///
    /// Should **NOT** block if the datagram cannot be sent.
    fn send(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, Self::IntoError>;
}

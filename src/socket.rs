use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::consts::{
    SERVER_SOCKET_RECV_BUF_SIZE, SERVER_SOCKET_SEND_BUF_SIZE, SOCKET_POLL_INTERVAL,
};
use crate::transceiver::Transceiver;

#[derive(thiserror::Error, Debug)]
#[error("failed to create and bind udp socket: {0}")]
pub struct Error(#[from] std::io::Error);

pub type Result<T> = std::result::Result<T, Error>;

/// The default [`Transceiver`]: a UDP socket whose reads time out after a short poll interval.
pub struct RdpSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl RdpSocket {
    pub fn new(addr: impl ToSocketAddrs) -> Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no socket addresses found")
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_send_buffer_size(SERVER_SOCKET_SEND_BUF_SIZE)?;
        socket.set_recv_buffer_size(SERVER_SOCKET_RECV_BUF_SIZE)?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(SOCKET_POLL_INTERVAL))?;
        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;
        Ok(RdpSocket { socket, local_addr })
    }
}

impl Transceiver for RdpSocket {
    type IntoError = crate::error::Error;

    fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn recv(&self, buf: &mut [u8]) -> std::result::Result<Option<(usize, SocketAddr)>, Self::IntoError> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) if len > 0 => Ok(Some((len, addr))),
            Ok(_) => Ok(None),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, buf: &[u8], addr: SocketAddr) -> std::result::Result<usize, Self::IntoError> {
        match self.socket.send_to(buf, addr) {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    #[test]
    fn send_and_recv_on_localhost() {
        let a = RdpSocket::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b = RdpSocket::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert_eq!(a.send(b"ping", b.addr()).unwrap(), 4);

        let mut buf = [0u8; 64];
        let start = Instant::now();
        loop {
            if let Some((len, from)) = b.recv(&mut buf).unwrap() {
                assert_eq!(&buf[..len], b"ping");
                assert_eq!(from, a.addr());
                break;
            }
            assert!(start.elapsed().as_secs() < 5, "datagram never arrived");
        }
    }

    #[test]
    fn recv_times_out_quietly() {
        let socket = RdpSocket::new((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.recv(&mut buf).unwrap().is_none());
    }
}

mod bytes;
mod config;
mod consts;
mod error;
mod manager;
mod seq;
mod socket;
mod transceiver;

#[cfg(test)]
mod simulator;

pub mod client;
pub mod connection;
pub mod packet;
pub mod server;

pub use client::Client;
pub use config::RdpConfig;
pub use connection::{CloseReason, Connection, ConnectionState, ConnectionStats};
pub use consts::*;
pub use error::{Error, Result};
pub use manager::{ConnectionManager, NewConnectionHook};
pub use packet::{Flags, Packet, PacketView, SynOptions, VariableHeader};
pub use server::Server;
pub use socket::RdpSocket;
pub use transceiver::Transceiver;

//! Tunnelled connections for the data plane
//!
//! The [`SocketConnector`] is what the torrent engine calls instead
//! of `TcpStream::connect`: it leases a circuit, asks the exit to
//! open the destination, and hands back a [`TunnelSocket`].

mod session;
mod socket;

pub use session::{SessionEvent, SessionRouter, TunnelStream};
pub use socket::{DowngradeNotice, SocketConnector, TunnelSocket};

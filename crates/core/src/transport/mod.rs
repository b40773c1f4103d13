//! Datagram transport and inbound routing
//!
//! The overlay runs over single-datagram frames. [`Transport`] is the
//! send handle (UDP in production, [`MemoryRouter`] in tests); the
//! [`Dispatcher`] decodes inbound frames and routes replies to their
//! waiting requesters.

mod datagram;
mod dispatch;

pub use datagram::{bind_udp, Inbound, MemoryRouter, Transport};
pub use dispatch::{CircuitRouter, Dispatcher, Event, PendingKey};

use crate::wire::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use swarmveil_common::protocol;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Stream of received frames, tagged with their source address
pub type Inbound = mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>;

/// Handle for sending frames into the overlay
///
/// Cloneable; every subsystem that needs to transmit holds one. The
/// receive side is a single [`Inbound`] channel drained by the node's
/// event loop.
#[derive(Clone)]
pub struct Transport {
    inner: TransportInner,
    local_addr: SocketAddr,
}

#[derive(Clone)]
enum TransportInner {
    Udp(Arc<UdpSocket>),
    Memory(Arc<MemoryRouter>),
}

impl Transport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one raw frame. Datagram semantics: best effort, no
    /// ordering or delivery guarantee.
    pub async fn send_frame(&self, dest: SocketAddr, frame: &[u8]) -> std::io::Result<()> {
        if frame.len() > protocol::MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame exceeds maximum message size",
            ));
        }

        match &self.inner {
            TransportInner::Udp(socket) => {
                socket.send_to(frame, dest).await?;
            }
            TransportInner::Memory(router) => {
                router.deliver(self.local_addr, dest, frame);
            }
        }
        trace!(%dest, len = frame.len(), "sent frame");
        Ok(())
    }

    pub async fn send_message(&self, dest: SocketAddr, message: &Message) -> std::io::Result<()> {
        self.send_frame(dest, &message.encode()).await
    }
}

/// Bind a UDP socket and pump received datagrams into a channel
pub async fn bind_udp(addr: SocketAddr) -> std::io::Result<(Transport, Inbound)> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();

    let recv_socket = Arc::clone(&socket);
    tokio::spawn(async move {
        let mut buf = vec![0u8; protocol::MAX_MESSAGE_SIZE];
        loop {
            match recv_socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if tx.send((from, buf[..len].to_vec())).is_err() {
                        debug!("inbound channel closed, stopping receive loop");
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "udp receive failed");
                }
            }
        }
    });

    debug!(%local_addr, "udp transport bound");
    Ok((
        Transport {
            inner: TransportInner::Udp(socket),
            local_addr,
        },
        rx,
    ))
}

/// In-process datagram network for tests: frames are routed between
/// attached endpoints by address, with no real sockets involved.
pub struct MemoryRouter {
    routes: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>>,
}

impl MemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Attach an endpoint at the given address
    pub fn attach(self: &Arc<Self>, addr: SocketAddr) -> (Transport, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .expect("memory router lock poisoned")
            .insert(addr, tx);

        (
            Transport {
                inner: TransportInner::Memory(Arc::clone(self)),
                local_addr: addr,
            },
            rx,
        )
    }

    fn deliver(&self, from: SocketAddr, dest: SocketAddr, frame: &[u8]) {
        let routes = self.routes.lock().expect("memory router lock poisoned");
        if let Some(tx) = routes.get(&dest) {
            // A closed endpoint behaves like an unreachable host.
            let _ = tx.send((from, frame.to_vec()));
        }
    }
}

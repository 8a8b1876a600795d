//! The narrow interface the query engine needs from the outbound UDP
//! socket. Kept separate from `mio`'s own `UdpSocket` so tests can swap in
//! a channel-backed fake instead of binding a real port.

use std::net::SocketAddr;

pub trait Net {
    /// Enqueue `bytes` for delivery to `addr`. Returns `false` if the
    /// local send queue synchronously rejected the datagram (the caller
    /// transitions the owning query to `Delayed` when this happens).
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> bool;
}

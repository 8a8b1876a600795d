//! Deterministic fixtures shared by `guess_swarm` and `guess_net` tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, Duration, UTC};

use crate::sha::ShaHash;

/// Allows tests to time travel into the future relative to "now".
pub fn travel_into_future(offset: Duration) -> DateTime<UTC> {
    UTC::now().checked_add(offset).unwrap()
}

/// Allows tests to time travel into the past relative to "now".
pub fn travel_into_past(offset: Duration) -> DateTime<UTC> {
    UTC::now().checked_sub(offset).unwrap()
}

/// A stable dummy ipv4 socket address, parameterized by the last octet and
/// port so tests can cheaply mint distinct, recognizable peers.
pub fn dummy_socket_addr(last_octet: u8, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::new(10, 0, 0, last_octet),
        port,
    ))
}

/// A stable dummy SHA-1, derived from a short tag so assertions can compare
/// by eye against the tag that produced it.
pub fn dummy_sha1(tag: &str) -> ShaHash {
    ShaHash::from_bytes(tag.as_bytes())
}

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Classify an address the way the pool filter in the query engine needs to:
/// private/loopback/unspecified ranges are never worth contacting.
pub fn is_routable_v4(addr: &Ipv4Addr) -> bool {
    !(addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_unspecified()
        || addr.is_multicast())
}

/// The all-zeroes route, used as a sentinel "no preferred source address".
pub fn default_route_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0))
}

//! Recovery of the address a redirected client was actually trying to
//! reach, before the packet filter pointed it at us.

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Query `SO_ORIGINAL_DST` on an accepted socket. `None` when the kernel has
/// no NAT entry for the flow (connection was not redirected, conntrack is
/// absent) or on platforms without the option; callers fall back to the peer
/// address with the listener's nominal port.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> Option<SocketAddr> {
    socket2::SockRef::from(stream)
        .original_dst()
        .ok()
        .and_then(|addr| addr.as_socket())
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> Option<SocketAddr> {
    None
}

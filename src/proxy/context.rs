use std::net::SocketAddr;

use crate::config::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use crate::proxy::relay::Deadline;

/// Which listener accepted the flow. Decides how the peek buffer is
/// interpreted and which port to assume when the packet filter gave us
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerClass {
    /// Peek bytes are expected to be a TLS ClientHello; route by SNI.
    Tls,
    /// Peek bytes are expected to be an HTTP request head; route by Host.
    Http,
}

impl ListenerClass {
    pub fn nominal_port(self) -> u16 {
        match self {
            ListenerClass::Tls => DEFAULT_HTTPS_PORT,
            ListenerClass::Http => DEFAULT_HTTP_PORT,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ListenerClass::Tls => "SNI",
            ListenerClass::Http => "Host",
        }
    }
}

/// Per-connection state, owned by one handler task for the lifetime of the
/// accepted flow.
pub struct ConnectionContext {
    pub client_addr: SocketAddr,
    pub class: ListenerClass,
    /// Where the client was originally headed. Falls back to the peer
    /// address with the listener's nominal port when the kernel query fails.
    pub original_dst: SocketAddr,
    /// Bytes consumed while classifying the flow; replayed to the upstream
    /// before relaying starts.
    pub peek_buf: Vec<u8>,
    /// Host extracted from SNI or the Host header, or the original
    /// destination IP as a fallback match string.
    pub host_name: String,
    pub target_port: u16,
    pub deadline: Deadline,
}

impl ConnectionContext {
    pub fn new(
        client_addr: SocketAddr,
        class: ListenerClass,
        original_dst: Option<SocketAddr>,
        deadline: Deadline,
    ) -> Self {
        let original_dst = original_dst
            .unwrap_or_else(|| SocketAddr::new(client_addr.ip(), class.nominal_port()));
        Self {
            client_addr,
            class,
            original_dst,
            peek_buf: Vec::new(),
            host_name: String::new(),
            target_port: class.nominal_port(),
            deadline,
        }
    }
}

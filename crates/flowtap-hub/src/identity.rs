use std::fmt;
use std::net::SocketAddr;

use axum::http::HeaderMap;
use flowtap_core::ConnectionKey;
use tracing::warn;

pub const REAL_IP_HEADER: &str = "x-real-ip";
pub const REAL_PORT_HEADER: &str = "x-real-port";

/// This host's side of every observed connection, fixed at startup.
#[derive(Clone, Debug)]
pub struct LocalEndpoint {
    pub addr: String,
    pub port: u16,
}

impl LocalEndpoint {
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self {
            addr: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct PeerEndpoint {
    pub addr: String,
    pub port: u16,
    pub from_proxy_headers: bool,
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Resolves the observer's endpoint of the connection being observed: the
/// socket peer, unless a reverse proxy in front of the hub supplied both
/// override headers with a usable address and port.
pub fn resolve_peer(remote: SocketAddr, headers: &HeaderMap) -> PeerEndpoint {
    let real_ip = header_value(headers, REAL_IP_HEADER);
    let real_port = header_value(headers, REAL_PORT_HEADER);
    if let (Some(addr), Some(port_text)) = (real_ip, real_port) {
        match port_text.parse::<u16>() {
            Ok(port) if !addr.is_empty() => {
                return PeerEndpoint {
                    addr: addr.to_string(),
                    port,
                    from_proxy_headers: true,
                };
            }
            _ => {
                warn!(event = "proxy_header_invalid", ip = addr, port = port_text);
            }
        }
    }
    PeerEndpoint {
        addr: remote.ip().to_string(),
        port: remote.port(),
        from_proxy_headers: false,
    }
}

/// Key for the observer's own connection: the hub's endpoint is the local
/// side, the observer's endpoint the remote side.
pub fn derive_key(local: &LocalEndpoint, peer: &PeerEndpoint) -> ConnectionKey {
    ConnectionKey::new(
        local.addr.clone(),
        peer.addr.clone(),
        local.port,
        peer.port,
    )
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

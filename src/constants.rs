use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const CANVAS_WIDTH: usize = 512;
pub const CANVAS_HEIGHT: usize = 512;

pub const LISTEN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8765);

/// Text frame accepted as a ping without JSON wrapping.
pub const LEGACY_PING: &str = "ping";

pub mod routes {
    pub const ROOT: &str = "/";
    pub const WS: &str = "/ws";
}

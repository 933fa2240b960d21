use std::net::{IpAddr, SocketAddr};

pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod node;
pub mod registry;
pub mod router;
pub mod uri;
pub mod wire;

/// Converts an IP address and port to a socket address.
fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

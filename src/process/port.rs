use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::debug;

use crate::error::{AgentError, Result};

/// Ask the kernel for an unused TCP port on the loopback interface.
pub fn pick_free_port() -> Result<u16> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.bind(&addr.into())?;

    let port = socket
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .ok_or_else(|| AgentError::Other("Bound socket has no inet address".to_string()))?;

    debug!("Picked free port {}", port);
    Ok(port)
}

//! Free-port discovery.
//!
//! Ports are probed with a local TCP connect: a refused connection means
//! nothing is listening and the port is taken. Another process may still
//! bind the port between the probe and container start.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::config::PortRange;
use crate::errors::{ReesError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Whether something accepts connections on `127.0.0.1:port`.
pub async fn is_port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// First port in `range` with no listener.
pub async fn find_open_port(range: PortRange) -> Result<u16> {
    for port in range.start..=range.end {
        if !is_port_in_use(port).await {
            debug!(port, "allocated port");
            return Ok(port);
        }
    }
    Err(ReesError::PortAllocation {
        start: range.start,
        end: range.end,
    })
}

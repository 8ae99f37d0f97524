//! Listening socket setup.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket};

use super::config::SlaveConfig;
use crate::error::{MbapError, Result};

/// Pending-connection backlog of the listening socket.
const BACKLOG: u32 = 1024;

/// Bind the listening socket described by `config`.
///
/// With `dualstack` and the IPv4 wildcard address, the IPv6 wildcard is tried
/// first so that IPv4-mapped peers are accepted too; hosts without IPv6 fall
/// back to the IPv4 wildcard.
pub(crate) async fn bind(config: &SlaveConfig) -> Result<TcpListener> {
    let reuse = !config.exclusive;
    let address = resolve(&config.address, config.port).await?;

    if config.dualstack && address.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
        let wildcard = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port);
        match listen(wildcard, reuse) {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("IPv6 wildcard unavailable, using IPv4: {}", e),
        }
    }

    listen(address, reuse).map_err(|e| {
        MbapError::Communication(format!("failed to listen on {}: {}", address, e))
    })
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| MbapError::Configuration(format!("bind.address {} did not resolve", host)))
}

fn listen(address: SocketAddr, reuse: bool) -> io::Result<TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(reuse)?;
    socket.bind(address)?;
    socket.listen(BACKLOG)
}

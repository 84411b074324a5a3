use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DNS_PORT: u16 = 53;

/// Parse a DNS resolver address.
///
/// Accepts `IP:PORT`, `[IPv6]:PORT`, or a bare IP (port 53 is implied). Host
/// names are rejected: the resolver must be reachable without another resolver.
pub fn parse_resolver_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    if addr.is_empty() {
        anyhow::bail!("empty resolver address");
    }
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let bare = addr
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(addr);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }
    anyhow::bail!("resolver {addr:?} must be an IP address with optional port (e.g. 8.8.8.8:53)")
}

/// The local listener always binds loopback only.
pub fn local_listen_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

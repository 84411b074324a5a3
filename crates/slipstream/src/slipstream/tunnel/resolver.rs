use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use tokio::net::UdpSocket;
use trust_dns_client::{
    client::{AsyncClient, ClientHandle},
    op::ResponseCode,
    rr::{DNSClass, Name, RData, RecordType},
    udp::UdpClientStream,
};

use crate::slipstream::tunnel::TunnelError;

/// Port the tunnel server listens on; appended to the resolved address.
pub const TUNNEL_SERVER_PORT: u16 = 5300;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the tunnel domain against one explicit DNS server over UDP.
///
/// The operating system resolver is never consulted: the configured server may
/// itself be part of the tunnel infrastructure.
#[derive(Debug, Clone)]
pub struct Resolver {
    server: SocketAddr,
    timeout: Duration,
}

impl Resolver {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout > Duration::ZERO {
            self.timeout = timeout;
        }
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Resolves `domain` and pairs the first address with `port`.
    pub async fn resolve_endpoint(
        &self,
        domain: &str,
        port: u16,
    ) -> Result<SocketAddr, TunnelError> {
        let ips = self.lookup_host(domain).await?;
        let ip = ips
            .first()
            .copied()
            .ok_or_else(|| TunnelError::resolution(domain, "no A/AAAA records"))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Host lookup: A records first, AAAA only when there is no IPv4 answer.
    pub async fn lookup_host(&self, domain: &str) -> Result<Vec<IpAddr>, TunnelError> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(TunnelError::resolution(domain, "empty domain"));
        }
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let fqdn = if domain.ends_with('.') {
            domain.to_string()
        } else {
            format!("{domain}.")
        };
        let name = Name::from_str(&fqdn).map_err(|e| TunnelError::resolution(domain, e))?;

        let stream = UdpClientStream::<UdpSocket>::with_timeout(self.server, self.timeout);
        let (mut client, bg) = AsyncClient::connect(stream)
            .await
            .map_err(|e| TunnelError::resolution(domain, e))?;
        let bg = tokio::spawn(bg);

        let res = async {
            let v4 = query(&mut client, domain, &name, RecordType::A).await?;
            if !v4.is_empty() {
                return Ok(v4);
            }
            query(&mut client, domain, &name, RecordType::AAAA).await
        }
        .await;

        drop(client);
        bg.abort();

        let ips = res?;
        if ips.is_empty() {
            return Err(TunnelError::resolution(domain, "no A/AAAA records"));
        }
        tracing::debug!(domain = %domain, resolver = %self.server, addrs = ips.len(), "resolve: ok");
        Ok(ips)
    }
}

async fn query(
    client: &mut AsyncClient,
    domain: &str,
    name: &Name,
    rtype: RecordType,
) -> Result<Vec<IpAddr>, TunnelError> {
    let resp = client
        .query(name.clone(), DNSClass::IN, rtype)
        .await
        .map_err(|e| TunnelError::resolution(domain, e))?;

    match resp.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Err(TunnelError::resolution(domain, "no such domain")),
        code => return Err(TunnelError::resolution(domain, format!("server answered {code}"))),
    }

    let mut out = Vec::new();
    for answer in resp.answers() {
        match answer.data() {
            Some(RData::A(a)) => out.push(IpAddr::V4(Ipv4Addr::from(*a))),
            Some(RData::AAAA(aaaa)) => out.push(IpAddr::V6(Ipv6Addr::from(*aaaa))),
            // CNAME chains and anything else the recursor includes.
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slipstream::tunnel::testing;

    #[tokio::test]
    async fn resolves_first_address_with_tunnel_port() {
        let dns = testing::spawn_dns_authority(
            "tunnel.test.",
            &[("ns", Ipv4Addr::new(10, 1, 2, 3)), ("other", Ipv4Addr::new(10, 9, 9, 9))],
        )
        .await;

        let r = Resolver::new(dns);
        let ep = r
            .resolve_endpoint("ns.tunnel.test", TUNNEL_SERVER_PORT)
            .await
            .expect("resolve");
        assert_eq!(ep, "10.1.2.3:5300".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn trailing_dot_is_accepted() {
        let dns =
            testing::spawn_dns_authority("tunnel.test.", &[("ns", Ipv4Addr::new(10, 1, 2, 3))])
                .await;

        let ips = Resolver::new(dns)
            .lookup_host("ns.tunnel.test.")
            .await
            .expect("lookup");
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]);
    }

    #[tokio::test]
    async fn unknown_name_is_a_resolution_failure() {
        let dns =
            testing::spawn_dns_authority("tunnel.test.", &[("ns", Ipv4Addr::new(10, 1, 2, 3))])
                .await;

        let err = Resolver::new(dns)
            .with_timeout(Duration::from_secs(2))
            .resolve_endpoint("missing.elsewhere.test", TUNNEL_SERVER_PORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Resolution { .. }), "got {err:?}");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn empty_domain_is_rejected_without_a_query() {
        // Nothing listens here; an actual query would time out instead.
        let r = Resolver::new("127.0.0.1:9".parse().unwrap());
        let err = r.lookup_host("  ").await.unwrap_err();
        assert!(err.to_string().contains("empty domain"));
    }

    #[tokio::test]
    async fn ip_literal_skips_the_query() {
        let r = Resolver::new("127.0.0.1:9".parse().unwrap());
        let ep = r
            .resolve_endpoint("192.0.2.7", TUNNEL_SERVER_PORT)
            .await
            .expect("literal");
        assert_eq!(ep, "192.0.2.7:5300".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn unreachable_resolver_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let err = Resolver::new(addr)
            .with_timeout(Duration::from_millis(200))
            .lookup_host("ns.tunnel.test")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Resolution { .. }));
    }
}

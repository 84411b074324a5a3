//! Loopback fixtures: a DNS authority and a QUIC echo server.

use std::{
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use quinn::{Connection, Endpoint, ServerConfig};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{net::UdpSocket, sync::mpsc};
use trust_dns_server::{
    authority::{Catalog, ZoneType},
    proto::rr::{Name, RData, Record, rdata::A},
    server::ServerFuture,
    store::in_memory::InMemoryAuthority,
};

use crate::slipstream::config;
use crate::slipstream::tunnel::transport::{ALPN_H3, CongestionControl, QuicDialOptions};

/// Serves `records` (relative to `zone`) over UDP on an ephemeral loopback port.
pub async fn spawn_dns_authority(zone: &str, records: &[(&str, Ipv4Addr)]) -> SocketAddr {
    let origin = Name::from_str(zone).expect("zone name");
    let mut authority = InMemoryAuthority::empty(origin.clone(), ZoneType::Primary, false);
    for (i, (host, ip)) in records.iter().enumerate() {
        let fqdn = Name::from_str(host)
            .expect("host name")
            .append_domain(&origin)
            .expect("append zone");
        let record = Record::from_rdata(fqdn, 300, RData::A(A::from(*ip)));
        authority.upsert_mut(record, i as u32 + 1);
    }

    let mut catalog = Catalog::new();
    catalog.upsert(origin.into(), Box::new(Arc::new(authority)));

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind dns");
    let addr = socket.local_addr().expect("dns addr");

    let mut server = ServerFuture::new(catalog);
    server.register_socket(socket);
    tokio::spawn(async move {
        let _ = server.block_until_done().await;
    });
    addr
}

/// A QUIC server that echoes every bidirectional stream back to its opener.
///
/// Each accepted connection is reported on `connections` so tests can kill it,
/// and how each stream's request ended is reported on `reads`.
pub struct EchoServer {
    pub addr: SocketAddr,
    pub endpoint: Endpoint,
    pub connections: mpsc::UnboundedReceiver<Connection>,
    pub reads: mpsc::UnboundedReceiver<Result<usize, String>>,
}

pub fn spawn_echo_server() -> EchoServer {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(["localhost".to_string()]).expect("self-signed cert");
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("tls13")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("server cert");
    tls.alpn_protocols = vec![ALPN_H3.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).expect("quic crypto");
    let server_cfg = ServerConfig::with_crypto(Arc::new(crypto));
    let endpoint =
        Endpoint::server(server_cfg, "127.0.0.1:0".parse().unwrap()).expect("quic endpoint");
    let addr = endpoint.local_addr().expect("quic addr");

    let (tx, rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();
    let ep = endpoint.clone();
    tokio::spawn(async move {
        while let Some(incoming) = ep.accept().await {
            let tx = tx.clone();
            let reads_tx = reads_tx.clone();
            tokio::spawn(async move {
                let Ok(conn) = incoming.await else {
                    return;
                };
                let _ = tx.send(conn.clone());
                while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                    let reads_tx = reads_tx.clone();
                    tokio::spawn(async move {
                        // Answer only after the opener's FIN, so a missing
                        // half-close shows up as a hang.
                        let res = recv.read_to_end(16 * 1024 * 1024).await;
                        let _ = reads_tx.send(res.as_ref().map(Vec::len).map_err(ToString::to_string));
                        let Ok(data) = res else {
                            return;
                        };
                        let _ = send.write_all(&data).await;
                        let _ = send.finish();
                        let _ = send.stopped().await;
                    });
                }
            });
        }
    });

    EchoServer {
        addr,
        endpoint,
        connections: rx,
        reads: reads_rx,
    }
}

pub fn dial_options() -> QuicDialOptions {
    QuicDialOptions {
        server_name: "localhost".into(),
        insecure_skip_verify: true,
        ca_file: None,
        keep_alive: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(5),
        congestion: CongestionControl::Cubic,
        gso: false,
        dial_timeout: Duration::from_secs(5),
    }
}

pub fn reconnect_fast() -> config::ReconnectConfig {
    config::ReconnectConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        reresolve_after: 3,
        max_attempts: 0,
    }
}

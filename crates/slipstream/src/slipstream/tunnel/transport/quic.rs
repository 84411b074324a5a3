use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{
    ClientConfig, Connection, Endpoint, TransportConfig,
    congestion::{BbrConfig, CubicConfig, NewRenoConfig},
};

use crate::slipstream::tunnel::{
    TunnelError,
    transport::{
        ALPN_H3, BoxedStream, CongestionControl, Dialer, QuicDialOptions, TransportSession,
        TunnelStream,
    },
};

pub struct QuicDialer;

impl QuicDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn dial(
        &self,
        endpoint: SocketAddr,
        opts: &QuicDialOptions,
    ) -> Result<Arc<dyn TransportSession>, TunnelError> {
        let client_cfg =
            client_config(opts).map_err(|e| TunnelError::establish(endpoint, format!("{e:#}")))?;

        let bind: SocketAddr = if endpoint.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let mut ep = Endpoint::client(bind).map_err(|e| TunnelError::establish(endpoint, e))?;
        ep.set_default_client_config(client_cfg);

        let connecting = ep
            .connect(endpoint, &opts.server_name)
            .map_err(|e| TunnelError::establish(endpoint, e))?;

        let conn = match tokio::time::timeout(opts.dial_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(TunnelError::establish(endpoint, err)),
            Err(_) => {
                ep.close(0u32.into(), b"dial timeout");
                return Err(TunnelError::establish(
                    endpoint,
                    format!(
                        "handshake timed out after {}",
                        humantime::format_duration(opts.dial_timeout)
                    ),
                ));
            }
        };

        tracing::debug!(
            endpoint = %endpoint,
            server_name = %opts.server_name,
            congestion = %opts.congestion,
            gso = opts.gso,
            "quic: handshake complete"
        );
        Ok(Arc::new(QuicSession { conn, _endpoint: ep }))
    }
}

fn client_config(opts: &QuicDialOptions) -> anyhow::Result<ClientConfig> {
    let crypto = quic_tls::client_crypto_config(
        opts.insecure_skip_verify,
        opts.ca_file.as_deref(),
        vec![ALPN_H3.to_vec()],
    )?;
    let mut cfg = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    cfg.transport_config(Arc::new(transport_config(opts)?));
    Ok(cfg)
}

pub fn transport_config(opts: &QuicDialOptions) -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();

    let keep_alive = (opts.keep_alive > Duration::ZERO).then_some(opts.keep_alive);
    cfg.keep_alive_interval(keep_alive);
    cfg.max_idle_timeout(Some(opts.idle_timeout.try_into()?));
    cfg.enable_segmentation_offload(opts.gso);

    match opts.congestion {
        CongestionControl::Cubic => {
            cfg.congestion_controller_factory(Arc::new(CubicConfig::default()));
        }
        CongestionControl::Bbr => {
            cfg.congestion_controller_factory(Arc::new(BbrConfig::default()));
        }
        CongestionControl::NewReno => {
            cfg.congestion_controller_factory(Arc::new(NewRenoConfig::default()));
        }
    }
    Ok(cfg)
}

struct QuicSession {
    conn: Connection,
    // Owns the UDP socket; dropped together with the session.
    _endpoint: Endpoint,
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> Result<BoxedStream, TunnelError> {
        match self.conn.open_bi().await {
            Ok((send, recv)) => Ok(Box::new(QuicBiStream { send, recv })),
            Err(_) if self.conn.close_reason().is_some() => Err(TunnelError::SessionClosed),
            Err(err) => Err(TunnelError::StreamOpen(err.to_string())),
        }
    }

    async fn closed(&self) -> String {
        self.conn.closed().await.to_string()
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn close(&self, reason: &str) {
        self.conn.close(0u32.into(), reason.as_bytes());
    }

    fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl TunnelStream for QuicBiStream {
    fn abort(&mut self) {
        // Either half may already be closed by the peer.
        let _ = self.send.reset(0u32.into());
        let _ = self.recv.stop(0u32.into());
    }
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().send, cx)
    }

    // Sends FIN on the stream; the receive half stays open.
    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

mod quic_tls {
    use std::{fs, path::Path, sync::Arc};

    use anyhow::Context;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn client_crypto_config(
        insecure_skip_verify: bool,
        ca_file: Option<&Path>,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?;

        if insecure_skip_verify {
            let mut cfg = builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth();
            cfg.alpn_protocols = next_protos;
            return Ok(cfg);
        }

        let mut root = rustls::RootCertStore::empty();
        root.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = ca_file {
            for cert in load_certs(path)? {
                root.add(cert)
                    .with_context(|| format!("tls: add root from {}", path.display()))?;
            }
        }

        let mut cfg = builder.with_root_certificates(root).with_no_client_auth();
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("tls: parse {}", path.display()))?;
        if certs.is_empty() {
            anyhow::bail!("tls: no certificates found in {}", path.display());
        }
        Ok(certs)
    }

    /// Certificate verifier that treats any certificate as valid.
    ///
    /// NOTE: vulnerable to MITM. Only enabled through `insecure_skip_verify`.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slipstream::tunnel::testing;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn transport_config_accepts_every_congestion_controller() {
        for cc in [
            CongestionControl::Cubic,
            CongestionControl::Bbr,
            CongestionControl::NewReno,
        ] {
            let mut opts = testing::dial_options();
            opts.congestion = cc;
            opts.gso = true;
            transport_config(&opts).expect("transport config");
        }
    }

    #[test]
    fn transport_config_allows_disabled_keep_alive() {
        let mut opts = testing::dial_options();
        opts.keep_alive = Duration::ZERO;
        transport_config(&opts).expect("transport config");
    }

    #[test]
    fn transport_config_rejects_out_of_range_idle_timeout() {
        let mut opts = testing::dial_options();
        opts.idle_timeout = Duration::MAX;
        assert!(transport_config(&opts).is_err());
    }

    #[tokio::test]
    async fn dial_and_echo_over_one_stream() {
        let server = testing::spawn_echo_server();
        let sess = QuicDialer::new()
            .dial(server.addr, &testing::dial_options())
            .await
            .expect("dial");
        assert_eq!(sess.remote_addr(), server.addr);

        let mut st = sess.open_stream().await.expect("open");
        st.write_all(b"ping").await.unwrap();
        st.shutdown().await.unwrap();
        let mut got = Vec::new();
        st.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        sess.close("test done");
        assert!(sess.is_closed());
        assert!(matches!(
            sess.open_stream().await,
            Err(TunnelError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn strict_verification_rejects_self_signed_server() {
        let server = testing::spawn_echo_server();
        let mut opts = testing::dial_options();
        opts.insecure_skip_verify = false;

        let err = match QuicDialer::new().dial(server.addr, &opts).await {
            Ok(_) => panic!("self-signed certificate accepted"),
            Err(err) => err,
        };
        assert!(matches!(err, TunnelError::Establish { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn dial_times_out_when_nothing_answers() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut opts = testing::dial_options();
        opts.dial_timeout = Duration::from_millis(200);

        let err = match QuicDialer::new()
            .dial(silent.local_addr().unwrap(), &opts)
            .await
        {
            Ok(_) => panic!("dial to a silent socket succeeded"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("timed out"), "got {err}");
    }
}

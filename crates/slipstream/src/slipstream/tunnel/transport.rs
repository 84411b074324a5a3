use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::slipstream::tunnel::TunnelError;

/// A bidirectional byte stream carried by the bridge.
///
/// `shutdown` ends the write half cleanly; `abort` tears the stream down so the
/// peer sees a reset rather than a clean end.
pub trait TunnelStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {
    fn abort(&mut self);
}

pub type BoxedStream = Box<dyn TunnelStream>;

impl TunnelStream for tokio::net::TcpStream {
    // A zero linger turns the close that follows into a RST.
    #[allow(deprecated)]
    fn abort(&mut self) {
        if let Err(err) = self.set_linger(Some(Duration::ZERO)) {
            tracing::debug!(err = %err, "tcp: set linger failed");
        }
    }
}

#[cfg(test)]
impl TunnelStream for tokio::io::DuplexStream {
    fn abort(&mut self) {}
}

/// ALPN identifier advertised during the handshake.
pub const ALPN_H3: &[u8] = b"h3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    #[default]
    Cubic,
    Bbr,
    NewReno,
}

impl FromStr for CongestionControl {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let n = name.trim().to_ascii_lowercase();
        match n.as_str() {
            "" | "cubic" => Ok(Self::Cubic),
            "bbr" => Ok(Self::Bbr),
            "newreno" | "new_reno" | "reno" => Ok(Self::NewReno),
            _ => anyhow::bail!(
                "tunnel: unknown congestion control {name:?} (expected cubic|bbr|newreno)"
            ),
        }
    }
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cubic => write!(f, "cubic"),
            Self::Bbr => write!(f, "bbr"),
            Self::NewReno => write!(f, "newreno"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuicDialOptions {
    /// TLS server name (SNI); also the name the certificate is checked against.
    pub server_name: String,
    /// Accept any server certificate. Exposes the session to MITM.
    pub insecure_skip_verify: bool,
    /// Extra PEM roots trusted in addition to the webpki set.
    pub ca_file: Option<PathBuf>,
    /// Zero disables keep-alive probes.
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    pub congestion: CongestionControl,
    pub gso: bool,
    pub dial_timeout: Duration,
}

/// Establishes transport sessions. A failed dial is returned, never retried.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dial(
        &self,
        endpoint: SocketAddr,
        opts: &QuicDialOptions,
    ) -> Result<Arc<dyn TransportSession>, TunnelError>;
}

/// One multiplexed session. Many tasks may call `open_stream` concurrently.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> Result<BoxedStream, TunnelError>;

    /// Resolves once the session is dead, with a human readable reason.
    async fn closed(&self) -> String;

    fn is_closed(&self) -> bool;

    /// Tears the session down; every open stream fails its next read/write.
    fn close(&self, reason: &str);

    fn remote_addr(&self) -> SocketAddr;
}

pub mod quic;

use std::net::SocketAddr;

/// Failures of the tunnel core.
///
/// `Resolution` and `Bind` only happen at startup and end the process; every other
/// variant is contained to either the session (the supervisor re-establishes) or a
/// single bridged connection.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("resolve {domain:?}: {reason}")]
    Resolution { domain: String, reason: String },

    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("establish session to {endpoint}: {reason}")]
    Establish { endpoint: SocketAddr, reason: String },

    #[error("open stream: {0}")]
    StreamOpen(String),

    #[error("session closed")]
    SessionClosed,

    #[error("copy: {0}")]
    Copy(#[from] std::io::Error),
}

impl TunnelError {
    pub fn resolution(domain: &str, reason: impl std::fmt::Display) -> Self {
        Self::Resolution {
            domain: domain.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn establish(endpoint: SocketAddr, reason: impl std::fmt::Display) -> Self {
        Self::Establish {
            endpoint,
            reason: reason.to_string(),
        }
    }

    /// Startup failures that the process cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Resolution { .. } | Self::Bind { .. })
    }
}

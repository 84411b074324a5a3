//! TCP-over-QUIC tunnel client.
//!
//! The endpoint is discovered through DNS, one QUIC session is kept alive by the
//! [`client::Supervisor`], and every accepted local TCP connection is relayed over
//! its own bidirectional stream by [`bridge::Bridge`].

pub mod acceptor;
pub mod bridge;
pub mod client;
pub mod error;
pub mod manager;
pub mod resolver;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use error::TunnelError;

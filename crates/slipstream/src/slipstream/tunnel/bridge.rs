use std::{net::SocketAddr, sync::Arc};

use tokio::io::AsyncWriteExt;

use crate::slipstream::{
    telemetry,
    tunnel::{TunnelError, manager::SessionManager, transport::TunnelStream},
};

/// Relays one local connection over its own stream on the shared session.
///
/// Each direction is copied independently; EOF on one side is forwarded as a
/// half-close so the other direction keeps flowing until it ends too. A copy
/// error aborts both sides, so neither peer mistakes a cut-off transfer for a
/// complete one.
#[derive(Clone)]
pub struct Bridge {
    sessions: Arc<SessionManager>,
    bridges: telemetry::SharedBridges,
    buffer_size: usize,
}

/// Bytes moved by one finished bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub upstream: u64,
    pub downstream: u64,
}

impl Bridge {
    pub fn new(
        sessions: Arc<SessionManager>,
        bridges: telemetry::SharedBridges,
        buffer_size: usize,
    ) -> Self {
        Self {
            sessions,
            bridges,
            buffer_size: buffer_size.max(1024),
        }
    }

    /// Runs the bridge to completion. Failures stay with this connection.
    pub async fn handle<S>(&self, conn: S, peer: SocketAddr)
    where
        S: TunnelStream,
    {
        let _active = telemetry::ActiveBridgeGuard::new();
        if let Err(err) = self.relay(conn, peer).await {
            tracing::debug!(client = %peer, err = %err, "bridge: ended with error");
        }
    }

    pub async fn relay<S>(&self, mut conn: S, peer: SocketAddr) -> Result<BridgeStats, TunnelError>
    where
        S: TunnelStream,
    {
        let bid = telemetry::new_bridge_id();

        let (mut stream, generation) = match self.sessions.open_stream().await {
            Ok(v) => v,
            Err(err) => {
                metrics::counter!(telemetry::STREAM_OPEN_FAILURES_TOTAL).increment(1);
                tracing::warn!(bid = %bid, client = %peer, err = %err, "bridge: stream open failed");
                let _ = conn.shutdown().await;
                return Err(err);
            }
        };

        let _registered =
            telemetry::Registered::new(self.bridges.clone(), bid.clone(), peer, generation);
        tracing::debug!(bid = %bid, client = %peer, session = generation, "bridge: open");

        let res = tokio::io::copy_bidirectional_with_sizes(
            &mut conn,
            &mut *stream,
            self.buffer_size,
            self.buffer_size,
        )
        .await;

        let (upstream, downstream) = match res {
            Ok(v) => v,
            Err(err) => {
                stream.abort();
                conn.abort();
                tracing::debug!(bid = %bid, client = %peer, err = %err, "bridge: aborted");
                return Err(TunnelError::Copy(err));
            }
        };

        metrics::counter!(telemetry::BYTES_UPSTREAM_TOTAL).increment(upstream);
        metrics::counter!(telemetry::BYTES_DOWNSTREAM_TOTAL).increment(downstream);
        tracing::debug!(
            bid = %bid,
            client = %peer,
            upstream,
            downstream,
            "bridge: closed"
        );

        Ok(BridgeStats {
            upstream,
            downstream,
        })
    }
}

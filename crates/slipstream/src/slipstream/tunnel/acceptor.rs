use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};

use crate::slipstream::tunnel::TunnelError;

/// The local TCP listener. Binding is separate from serving so a bind failure
/// surfaces before anything else starts.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts until `shutdown` flips, handing each connection to its own task.
    ///
    /// Returns the still-running connection tasks so the caller decides how
    /// long to wait for them.
    pub async fn run<H, Fut>(
        self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinSet<()>
    where
        H: Fn(TcpStream, SocketAddr) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(listen_addr = %self.local_addr, "tcp: listening");

        let mut conns = JoinSet::new();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = self.listener.accept() => {
                    match res {
                        Ok((conn, peer)) => {
                            if let Err(err) = conn.set_nodelay(true) {
                                tracing::debug!(client = %peer, err = %err, "tcp: set_nodelay failed");
                            }
                            if tracing::enabled!(tracing::Level::DEBUG) {
                                tracing::debug!(client = %peer, "tcp: accepted");
                            }
                            conns.spawn(handler(conn, peer));
                        }
                        Err(err) => {
                            // Usually fd exhaustion; back off instead of spinning.
                            tracing::warn!(err = %err, "tcp: accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }

        tracing::info!(listen_addr = %self.local_addr, "tcp: stopped accepting");
        conns
    }
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use rand::{RngExt, rng};
use tokio::sync::watch;

use crate::slipstream::{
    config::ReconnectConfig,
    telemetry,
    tunnel::{
        manager::SessionManager,
        resolver::Resolver,
        transport::{Dialer, QuicDialOptions},
    },
};

pub struct SupervisorOptions {
    pub domain: String,
    pub server_port: u16,
    pub dial: QuicDialOptions,
    pub reconnect: ReconnectConfig,
}

/// Keeps exactly one session installed in the [`SessionManager`].
///
/// Dials the endpoint, waits for the session to die, and dials again with
/// exponential backoff. The domain is resolved again after repeated dial
/// failures and after an established session is lost.
pub struct Supervisor {
    opts: SupervisorOptions,
    resolver: Resolver,
    dialer: Arc<dyn Dialer>,
    sessions: Arc<SessionManager>,
    endpoint: SocketAddr,
}

impl Supervisor {
    pub fn new(
        opts: SupervisorOptions,
        resolver: Resolver,
        dialer: Arc<dyn Dialer>,
        sessions: Arc<SessionManager>,
        endpoint: SocketAddr,
    ) -> Self {
        Self {
            opts,
            resolver,
            dialer,
            sessions,
            endpoint,
        }
    }

    /// Runs until shutdown. Only returns an error when `max_attempts`
    /// consecutive dials have failed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let rc = &self.opts.reconnect;
        let mut endpoint = self.endpoint;
        let mut backoff = rc.initial_backoff;
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let dialed = tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                res = self.dialer.dial(endpoint, &self.opts.dial) => res,
            };

            match dialed {
                Ok(sess) => {
                    failures = 0;
                    backoff = rc.initial_backoff;
                    metrics::counter!(telemetry::SESSIONS_ESTABLISHED_TOTAL).increment(1);

                    let handle = self.sessions.install(sess);
                    tracing::info!(
                        transport = %self.dialer.name(),
                        endpoint = %endpoint,
                        session = handle.generation(),
                        "tunnel: session established"
                    );

                    let reason = tokio::select! {
                        reason = handle.closed() => reason,
                        _ = wait_shutdown(&mut shutdown) => break,
                    };

                    self.sessions.invalidate(handle.generation(), &reason);
                    metrics::counter!(telemetry::SESSION_FAILURES_TOTAL).increment(1);
                    tracing::warn!(
                        endpoint = %endpoint,
                        session = handle.generation(),
                        uptime = %humantime::format_duration(round_ms(handle.uptime())),
                        reason = %reason,
                        "tunnel: session lost"
                    );

                    endpoint = self.reresolve(endpoint).await;

                    // Redial at once unless the session died young, which
                    // usually means the server is rejecting us.
                    if handle.uptime() >= rc.initial_backoff {
                        continue;
                    }
                }
                Err(err) => {
                    failures += 1;
                    metrics::counter!(telemetry::SESSION_FAILURES_TOTAL).increment(1);

                    if rc.max_attempts > 0 && failures >= rc.max_attempts {
                        tracing::error!(
                            endpoint = %endpoint,
                            attempts = failures,
                            err = %err,
                            "tunnel: giving up"
                        );
                        anyhow::bail!("tunnel: giving up after {failures} failed attempts: {err}");
                    }

                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt = failures,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: establish failed; retrying"
                    );

                    if rc.reresolve_after > 0 && failures % rc.reresolve_after == 0 {
                        endpoint = self.reresolve(endpoint).await;
                    }
                }
            }

            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(jittered(backoff)) => {}
            }

            backoff = (backoff * 2).min(rc.max_backoff);
        }

        self.sessions.close("shutdown");
        tracing::info!("tunnel: supervisor stopped");
        Ok(())
    }

    /// Looks the domain up again. A failed lookup keeps the previous endpoint.
    async fn reresolve(&self, current: SocketAddr) -> SocketAddr {
        match self
            .resolver
            .resolve_endpoint(&self.opts.domain, self.opts.server_port)
            .await
        {
            Ok(next) => {
                if next != current {
                    tracing::info!(from = %current, to = %next, "tunnel: endpoint changed");
                }
                next
            }
            Err(err) => {
                tracing::warn!(
                    domain = %self.opts.domain,
                    resolver = %self.resolver.server(),
                    err = %err,
                    "tunnel: re-resolve failed; keeping endpoint"
                );
                current
            }
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Adds up to 20% random delay so many clients don't retry in lockstep.
fn jittered(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    d.mul_f64(1.0 + rng().random_range(0.0..0.2))
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::slipstream::{
    admin, config, logging, telemetry,
    tunnel::{
        TunnelError,
        acceptor::Acceptor,
        bridge::Bridge,
        client::{Supervisor, SupervisorOptions},
        manager::SessionManager,
        resolver::Resolver,
        transport::{Dialer, quic::QuicDialer},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(cli: config::Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("config: current dir")?;
    let resolved = config::resolve_config_path(cli.config.clone(), &cwd)?;
    let cfg = match &resolved {
        Some(r) => config::load_config(&cli, Some(&r.path))
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => config::load_config(&cli, None)?,
    };

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(r) = &resolved {
        tracing::info!(path = %r.path.display(), source = %r.source, "config: loaded");
    }

    let prom = Arc::new(telemetry::init_prometheus()?);

    let app = match App::start(cfg, prom).await {
        Ok(app) => app,
        Err(err) => {
            let fatal = err
                .chain()
                .filter_map(|e| e.downcast_ref::<TunnelError>())
                .any(TunnelError::is_fatal);
            tracing::error!(err = %format!("{err:#}"), fatal, "slipstream: startup failed");
            return Err(err);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown: signal");
        let _ = shutdown_tx.send(true);
    });

    let res = app.run(shutdown_rx).await;
    signal.abort();

    if let Err(err) = &res {
        tracing::error!(err = %format!("{err:#}"), "slipstream: exiting");
    }
    res
}

/// A started client: endpoint resolved, local port bound, nothing running yet.
pub struct App {
    cfg: Arc<config::Config>,
    acceptor: Acceptor,
    supervisor: Supervisor,
    sessions: Arc<SessionManager>,
    bridges: telemetry::SharedBridges,
    admin: Option<(TcpListener, admin::AdminState)>,
}

impl App {
    /// Resolves the endpoint, then binds. Either failure is fatal, and a
    /// resolution failure leaves nothing bound.
    pub async fn start(
        cfg: config::Config,
        prom: telemetry::SharedPrometheusHandle,
    ) -> anyhow::Result<Self> {
        Self::start_with_dialer(cfg, prom, Arc::new(QuicDialer::new())).await
    }

    pub async fn start_with_dialer(
        cfg: config::Config,
        prom: telemetry::SharedPrometheusHandle,
        dialer: Arc<dyn Dialer>,
    ) -> anyhow::Result<Self> {
        tracing::info!(
            domain = %cfg.domain,
            resolver = %cfg.resolver,
            dns_timeout = %humantime::format_duration(cfg.dns_timeout),
            listen_addr = %cfg.listen_addr(),
            server_port = cfg.server_port,
            congestion_control = %cfg.congestion,
            keep_alive = %humantime::format_duration(cfg.keep_alive),
            idle_timeout = %humantime::format_duration(cfg.idle_timeout),
            gso = cfg.gso,
            admin_addr = %cfg.admin_addr,
            "slipstream: starting"
        );

        if cfg.tls.insecure_skip_verify {
            tracing::warn!(
                server_name = %cfg.tls.server_name,
                "tls: certificate verification disabled; the tunnel server is not authenticated"
            );
        }

        let resolver = Resolver::new(cfg.resolver).with_timeout(cfg.dns_timeout);
        let endpoint = resolver
            .resolve_endpoint(&cfg.domain, cfg.server_port)
            .await
            .with_context(|| format!("resolve tunnel endpoint via {}", cfg.resolver))?;
        tracing::info!(domain = %cfg.domain, endpoint = %endpoint, "tunnel: endpoint resolved");

        let acceptor = Acceptor::bind(cfg.listen_addr())
            .await
            .context("listen")?;
        tracing::info!(listen_addr = %acceptor.local_addr(), "tcp: bound");

        let sessions = Arc::new(SessionManager::new(cfg.stream_wait_timeout));
        let bridges = Arc::new(telemetry::BridgeRegistry::new());

        let admin = if cfg.admin_addr.trim().is_empty() {
            None
        } else {
            let addr: SocketAddr = cfg
                .admin_addr
                .trim()
                .parse()
                .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
            let listener = admin::bind(addr).await?;
            let state = admin::AdminState {
                prom,
                bridges: bridges.clone(),
                sessions: sessions.clone(),
            };
            Some((listener, state))
        };

        let supervisor = Supervisor::new(
            SupervisorOptions {
                domain: cfg.domain.clone(),
                server_port: cfg.server_port,
                dial: cfg.dial_options(),
                reconnect: cfg.reconnect.clone(),
            },
            resolver,
            dialer,
            sessions.clone(),
            endpoint,
        );

        Ok(Self {
            cfg: Arc::new(cfg),
            acceptor,
            supervisor,
            sessions,
            bridges,
            admin,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    #[cfg(test)]
    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    /// Serves until `shutdown` flips or the supervisor gives up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let App {
            cfg,
            acceptor,
            supervisor,
            sessions,
            bridges,
            admin,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        {
            let stop = stop_rx.clone();
            tasks.spawn(async move { supervisor.run(stop).await });
        }

        if let Some((listener, state)) = admin {
            let stop = stop_rx.clone();
            tasks.spawn(async move { admin::serve_with_shutdown(listener, state, stop).await });
        }

        let bridge = Bridge::new(sessions, bridges, cfg.buffer_size);
        let mut accept = tokio::spawn(acceptor.run(
            move |conn, peer| {
                let bridge = bridge.clone();
                async move { bridge.handle(conn, peer).await }
            },
            stop_rx,
        ));

        let mut accepted = None;
        let mut accept_done = false;
        let res = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => Ok(()),
            res = tasks.join_next() => match res {
                Some(Ok(Ok(()))) | None => Ok(()),
                Some(Ok(Err(err))) => Err(err),
                Some(Err(join_err)) => Err(join_err.into()),
            },
            res = &mut accept => {
                accept_done = true;
                match res {
                    Ok(conns) => {
                        accepted = Some(conns);
                        Ok(())
                    }
                    Err(join_err) => Err(anyhow::Error::from(join_err).context("accept loop")),
                }
            }
        };

        let _ = stop_tx.send(true);

        // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
        let drain = async {
            let conns = match accepted {
                Some(conns) => Some(conns),
                None if accept_done => None,
                None => (&mut accept).await.ok(),
            };
            if let Some(mut conns) = conns {
                while conns.join_next().await.is_some() {}
            }
            while tasks.join_next().await.is_some() {}
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(
                timeout = %humantime::format_duration(DRAIN_TIMEOUT),
                "shutdown: drain timed out; aborting remaining tasks"
            );
            accept.abort();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!("slipstream: stopped");
        res
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop anymore.
            std::future::pending::<()>().await;
        }
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::slipstream::{telemetry, tunnel::manager::SessionManager};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub bridges: telemetry::SharedBridges,
    pub sessions: Arc<SessionManager>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/session", get(session))
        .route("/conns", get(conns))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))
}

pub async fn serve_with_shutdown(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("admin: local addr")?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("admin: serve")?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    session: bool,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            session: st.sessions.current().is_some(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn session(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match st.sessions.snapshot() {
        Some(snap) => (StatusCode::OK, Json(Some(snap))),
        None => (StatusCode::SERVICE_UNAVAILABLE, Json(None)),
    }
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.bridges.snapshot()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::slipstream::tunnel::manager::fake::FakeSession;

    async fn get_raw(addr: SocketAddr, path: &str) -> String {
        let mut s = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let req = format!("GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n");
        s.write_all(req.as_bytes()).await.expect("write");
        let mut out = String::new();
        s.read_to_string(&mut out).await.expect("read");
        out
    }

    fn json_body(resp: &str) -> serde_json::Value {
        let (_, body) = resp.split_once("\r\n\r\n").expect("http body");
        serde_json::from_str(body).expect("json body")
    }

    #[tokio::test]
    async fn endpoints_report_session_and_bridges() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let sessions = Arc::new(SessionManager::new(Duration::from_millis(50)));
        let bridges = Arc::new(telemetry::BridgeRegistry::new());
        let state = AdminState {
            prom: Arc::new(recorder.handle()),
            bridges: bridges.clone(),
            sessions: sessions.clone(),
        };

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.expect("bind");
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve_with_shutdown(listener, state, rx));

        let resp = get_raw(addr, "/health").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "got: {resp}");
        assert!(resp.contains("\"session\":false"), "got: {resp}");

        let resp = get_raw(addr, "/session").await;
        assert!(resp.starts_with("HTTP/1.1 503"), "got: {resp}");

        sessions.install(FakeSession::new());
        let _reg = telemetry::Registered::new(
            bridges.clone(),
            "b-test".into(),
            "127.0.0.1:40000".parse().unwrap(),
            1,
        );

        let resp = get_raw(addr, "/health").await;
        assert!(resp.contains("\"session\":true"), "got: {resp}");

        let session = json_body(&get_raw(addr, "/session").await);
        assert_eq!(session["generation"], 1);
        assert_eq!(session["remote"], "127.0.0.1:5300");
        assert_eq!(session["alive"], true);

        let conns = json_body(&get_raw(addr, "/conns").await);
        assert_eq!(conns[0]["id"], "b-test");
        assert_eq!(conns[0]["session"], 1);

        let resp = get_raw(addr, "/metrics").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "got: {resp}");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("admin stops on shutdown")
            .unwrap()
            .expect("serve");
    }
}

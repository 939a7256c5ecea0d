use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::rtun::telemetry;
use crate::rtun::tunnel::manager::Manager;

#[derive(Clone)]
pub struct AdminState {
    /// `None` when no recorder was installed (tests, embedding).
    pub prom: Option<telemetry::SharedPrometheusHandle>,
    pub tunnels: Arc<Manager>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnels", get(tunnels))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    tunnels: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            tunnels: st.tunnels.len(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.prom {
        Some(h) => (StatusCode::OK, h.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled\n".to_string()),
    }
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.tunnels.snapshot()))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::rtun::tunnel::{Listen, Tunnel};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        c.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_health_and_tunnel_snapshot() {
        let manager = Arc::new(Manager::new());
        let (a, _b) = tokio::io::duplex(64);
        let t = Tunnel::builder(a).key("office").build();
        manager.register_client("office", t, "10.0.0.1:5000".into(), Some(Listen::tcp(8022)), None);

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        let server = tokio::spawn(serve_listener(
            ln,
            AdminState {
                prom: None,
                tunnels: manager,
            },
            rx,
        ));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "got: {health}");
        assert!(health.contains("\"tunnels\":1"));

        let tunnels = get(addr, "/tunnels").await;
        assert!(tunnels.contains("\"key\":\"office\""), "got: {tunnels}");
        assert!(tunnels.contains("\"port\":8022"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 404"));

        stop.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}

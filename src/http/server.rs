//! HTTP server hosting a router behind the admission layer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::AdmissionLayer;
use crate::admission::{AdmissionController, Sweeper, SystemClock};
use crate::error::{FloodgateError, Result};

/// HTTP server whose every request passes through admission control.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The shared admission controller
    controller: Arc<AdmissionController>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, controller: Arc<AdmissionController>) -> Self {
        Self { addr, controller }
    }

    /// The guarded router: `/health`, `/stats` and a 404 fallback.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/stats", get(stats))
            .fallback(not_found)
            .with_state(Arc::clone(&self.controller))
            .layer(AdmissionLayer::new(Arc::clone(&self.controller)))
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// Starts the background sweeper when `sweep_interval_ms` is non-zero and
    /// stops it after the server has drained.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let app = self.router();

        let sweep_interval_ms = self.controller.settings().sweep_interval_ms;
        let sweeper = (sweep_interval_ms > 0).then(|| {
            Sweeper::spawn(
                Arc::clone(&self.controller),
                SystemClock,
                Duration::from_millis(sweep_interval_ms),
            )
        });

        info!(
            addr = %local_addr,
            limit = self.controller.settings().limit,
            window_ms = self.controller.settings().window_duration_ms,
            "Starting HTTP server with admission control"
        );

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }

        result.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Io(e)
        })
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(controller): State<Arc<AdmissionController>>) -> impl IntoResponse {
    let settings = controller.settings();
    Json(serde_json::json!({
        "active_counters": controller.counter_count(),
        "limit": settings.limit,
        "window_duration_ms": settings.window_duration_ms,
        "retention_windows": settings.retention_windows,
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "message": "Not found" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionSettings;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    fn server(limit: u64) -> HttpServer {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let settings = AdmissionSettings::with_limit(limit, 60_000);
        let controller = Arc::new(AdmissionController::from_settings(settings).unwrap());
        HttpServer::new(addr, controller)
    }

    fn get_from(uri: &str, peer: &str) -> Request<Body> {
        let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_reports_status() {
        let response = server(10)
            .router()
            .oneshot(get_from("/health", "10.0.0.1:1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_router_routes() {
        let app = server(10).router();

        let health = app.clone().oneshot(get_from("/health", "10.0.0.1:1")).await.unwrap();
        let stats = app.clone().oneshot(get_from("/stats", "10.0.0.1:1")).await.unwrap();
        let missing = app.oneshot(get_from("/nope", "10.0.0.1:1")).await.unwrap();

        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(stats.status(), StatusCode::OK);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(stats.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["active_counters"], 1);
        assert_eq!(body["limit"], 10);
    }

    #[tokio::test]
    async fn test_fallback_is_guarded() {
        let app = server(1).router();

        let first = app.clone().oneshot(get_from("/nope", "10.0.0.1:1")).await.unwrap();
        let second = app.oneshot(get_from("/health", "10.0.0.1:1")).await.unwrap();

        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_serve_limits_by_peer_address() {
        let server = server(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(server.serve_on(listener, async move {
            let _ = stop_rx.await;
        }));

        let first = raw_get(addr, "/health").await;
        let second = raw_get(addr, "/health").await;

        assert!(first.starts_with("HTTP/1.1 200"), "{}", first);
        assert!(second.starts_with("HTTP/1.1 429"), "{}", second);
        assert!(second.contains("Rate limit exceeded"));

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}

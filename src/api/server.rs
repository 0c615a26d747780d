//! HTTP server setup: router, middleware, graceful shutdown.

use super::state::ApiState;
use super::{auth, communications, strategic, webhooks};

use axum::Json;
use axum::Router;
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// All routes, with state attached. Exposed separately from the listener so
/// tests can drive it in-process.
pub fn build_router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/stats", get(communications::stats))
        .route("/sync/{provider}", post(communications::sync_provider))
        .route("/communications", get(communications::list_communications))
        .route("/communications/analyze", post(communications::analyze_pending))
        .route("/communications/reanalyze", post(communications::reanalyze))
        .route("/communications/{id}", get(communications::get_communication))
        .route("/communications/{id}/exclude", post(communications::set_excluded))
        .route("/strategic/latest", get(strategic::latest))
        .route("/strategic/history", get(strategic::history))
        .route("/strategic/refresh", post(strategic::refresh))
        .route("/auth/gmail/url", get(auth::gmail_url))
        .route("/auth/gmail/callback", get(auth::gmail_callback))
        .route(
            "/auth/gmail",
            get(auth::gmail_status).delete(auth::gmail_disconnect),
        )
        .layer(cors);

    let webhook_routes = Router::new()
        .route("/voice", post(webhooks::voice))
        .route("/recording", post(webhooks::recording))
        .route("/transcription", post(webhooks::transcription))
        .route("/sms", post(webhooks::sms));

    Router::new()
        .nest("/api", api_routes)
        .nest("/webhooks/twilio", webhook_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown_rx` flips to true.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

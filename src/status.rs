//! Read-only HTTP status for the daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::signer::ChainSigner;
use crate::notify::NotificationDispatcher;

#[derive(Clone)]
pub struct StatusState {
    pub signer: Arc<ChainSigner>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: StatusState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status endpoint listening on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "changelog-sentinel",
        "timestamp": chrono::Utc::now()
    }))
}

async fn status_endpoint(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let mut status = serde_json::json!({
        "service": "changelog-sentinel",
        "timestamp": chrono::Utc::now(),
        "initial_sync": state.dispatcher.in_initial_sync(),
        "audit_log": state.signer.log().path().display().to_string(),
    });

    match state.signer.current_serial().await {
        Ok(serial) => {
            status["status"] = "healthy".into();
            status["serial"] = serial.into();
        }
        Err(e) => {
            status["status"] = "error".into();
            status["error"] = e.to_string().into();
        }
    }

    Json(status)
}

//! Webhook and health HTTP endpoints.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::bot::Bot;
use crate::models::OutcomeStatus;

/// Create the router with all endpoints.
pub fn create_router(bot: Arc<Bot>) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(bot)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(bot: Arc<Bot>, bind: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(address = %bind, "Webhook server listening");

    axum::serve(listener, create_router(bot))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Webhook server failed")
}

/// Every accepted body gets 202; ignored (outside market hours) gets 200.
async fn webhook(State(bot): State<Arc<Bot>>, body: Bytes) -> impl IntoResponse {
    let outcome = bot.handle_webhook(&body).await;
    let code = match outcome.status {
        OutcomeStatus::Ignored => StatusCode::OK,
        OutcomeStatus::Processed | OutcomeStatus::Rejected => StatusCode::ACCEPTED,
    };
    (code, Json(outcome))
}

async fn health(State(bot): State<Arc<Bot>>) -> impl IntoResponse {
    Json(bot.health().await)
}

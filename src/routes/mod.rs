use std::sync::Arc;

use axum::{
    routing::{get, MethodRouter},
    Router,
};

use crate::AppState;

pub mod games;
pub mod health;
pub mod ingest;
pub mod webhooks;

/// Every route of the service. `create_webhook` is the webhook registration
/// endpoint, passed in so the caller can wrap it in a rate limiter.
pub fn app(create_webhook: MethodRouter<Arc<AppState>>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/games", games::router())
        .nest("/api/webhooks", webhooks::router(create_webhook))
        .nest("/api/ingest", ingest::router())
}

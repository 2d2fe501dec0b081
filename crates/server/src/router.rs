//! HTTP router construction.

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;
use crate::{api, auth};

/// Build the application router: public probes plus the gated API.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/query", post(api::query))
        .route("/api/reports/{filename}", get(api::download_report))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_allowed_user,
        ));

    let public = Router::new()
        .route("/api/health", get(api::health))
        .route("/api/health/ready", get(api::ready));

    protected
        .merge(public)
        .layer(cors_layer(&state.cors_origin))
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    match origin.trim() {
        "*" | "" => layer.allow_origin(Any),
        origin => match HeaderValue::from_str(origin) {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                tracing::warn!(%origin, "invalid CORS origin, allowing any");
                layer.allow_origin(Any)
            }
        },
    }
}

mod matching;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, middleware, routing::get, routing::post};
use serde::Serialize;

use crate::middleware as app_middleware;
use crate::observability;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/match/start", post(matching::start_match))
        .route("/v1/match/poll", post(matching::poll_match))
        .route("/v1/match/cancel", post(matching::cancel_match))
        .route("/v1/match/partner", post(matching::get_partner))
        .route(
            "/v1/match/attach-conversation",
            post(matching::attach_conversation),
        )
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        app = app.layer(app_middleware::rate_limit_layer());
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = match state.db.health_check().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(error = %err, backend = state.db.name(), "store health check failed");
            "degraded"
        }
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        store,
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(rendered) => rendered.into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

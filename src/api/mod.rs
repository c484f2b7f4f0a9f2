//! HTTP API surface under /api/v1 plus health endpoints.

mod admin_api;
mod decisions_api;
mod dlq_api;
mod events_api;
mod health;
mod signals_api;

use crate::auth::{require_admin, require_read, require_submit};
use crate::middleware::rate_limit::rate_limit_middleware;
use crate::middleware::RateLimiter;
use crate::publisher::websocket_handler;
use crate::state::AppState;
use axum::{
    middleware as axum_mw,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

/// Full application router. Scope enforcement: ingress needs submit, queries
/// need read, admin surfaces need admin; health endpoints are public.
pub fn router(state: AppState, rate_limiter: Option<Arc<RateLimiter>>) -> Router {
    let mut submit_routes = Router::new()
        .route("/api/v1/signals", post(signals_api::submit_signal))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), require_submit));
    if let Some(limiter) = rate_limiter {
        submit_routes =
            submit_routes.route_layer(axum_mw::from_fn_with_state(limiter, rate_limit_middleware));
    }

    let read_routes = Router::new()
        .route("/api/v1/events", get(events_api::list_events))
        .route("/api/v1/events/:event_id", get(events_api::get_event))
        .route(
            "/api/v1/events/:event_id/status",
            get(events_api::get_event_status),
        )
        .route("/api/v1/decisions", get(decisions_api::list_decisions))
        .route(
            "/api/v1/decisions/:event_id",
            get(decisions_api::decisions_for_event),
        )
        .route("/api/v1/dlq", get(dlq_api::list_dlq))
        .route("/api/v1/dlq/:dlq_id", get(dlq_api::get_dlq))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), require_read));

    // The subscription transport authenticates inside the handler (token via
    // the bearer subprotocol) so rejections arrive as WS close codes, not
    // HTTP statuses.
    let ws_routes = Router::new().route("/api/v1/ws", get(websocket_handler));

    let admin_routes = Router::new()
        .route("/api/v1/dlq/:dlq_id/retry", post(dlq_api::retry_dlq))
        .route("/api/v1/dlq/:dlq_id/resolve", post(dlq_api::resolve_dlq))
        .route("/api/v1/llm-configs", get(admin_api::list_llm_configs))
        .route(
            "/api/v1/llm-configs/:model",
            put(admin_api::put_llm_config)
                .patch(admin_api::patch_llm_config)
                .delete(admin_api::delete_llm_config),
        )
        .route(
            "/api/v1/llm-configs/:model/enable",
            post(admin_api::enable_llm_config),
        )
        .route(
            "/api/v1/llm-configs/:model/disable",
            post(admin_api::disable_llm_config),
        )
        .route(
            "/api/v1/llm-configs/:model/test",
            post(admin_api::test_llm_config),
        )
        .route("/api/v1/prompts", get(admin_api::list_prompts))
        .route(
            "/api/v1/prompts/:name/:version",
            get(admin_api::get_prompt)
                .put(admin_api::put_prompt)
                .delete(admin_api::delete_prompt),
        )
        .route(
            "/api/v1/prompts/:name/:version/activate",
            post(admin_api::activate_prompt),
        )
        .route_layer(axum_mw::from_fn_with_state(state.clone(), require_admin));

    let public_routes = Router::new()
        .route("/health", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/metrics", get(health::metrics));

    Router::new()
        .merge(public_routes)
        .merge(submit_routes)
        .merge(read_routes)
        .merge(ws_routes)
        .merge(admin_routes)
        .with_state(state)
}

//! HTTP API handlers and routing.

mod admin;
pub mod error;
mod fleet;
mod health;
pub mod request_context;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, Method},
    middleware::{self, Next},
    response::Response,
    Router,
};
use fleet_proto::FLEET_API_PREFIX;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Router for the node-facing listener.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config().max_request_bytes;

    let fleet = fleet::routes().layer(middleware::from_fn_with_state(
        state.clone(),
        track_load,
    ));

    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest(FLEET_API_PREFIX, fleet)
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        // Application state
        .with_state(state)
}

/// Router for the administration listener.
pub fn create_admin_router(state: AppState) -> Router {
    let body_limit = state.config().max_request_bytes;

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", admin::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Counts the request as in flight for load shedding.
async fn track_load(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let coordinator = state.coordinator().clone();
    let _guard = coordinator.load().enter();
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{clock::SystemClock, config::Config, db::Store, fleet::Coordinator};

    fn state(max_request_bytes: usize) -> AppState {
        let config = Config {
            max_request_bytes,
            ..Config::default()
        };
        let coordinator = Coordinator::new(
            Store::open_in_memory().unwrap(),
            Arc::new(SystemClock),
            config.fleet.clone(),
        );
        AppState::new(coordinator, config)
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let app = create_router(state(64));
        let body = format!(r#"{{"heartbeat_interval": 5.0, "pad": "{}"}}"#, "x".repeat(128));

        let resp = app
            .oneshot(post(&format!("{FLEET_API_PREFIX}/create-node"), body))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_fleet_requests_leave_no_load_behind() {
        let state = state(1024);
        let app = create_router(state.clone());

        let resp = app
            .oneshot(post(
                &format!("{FLEET_API_PREFIX}/create-node"),
                r#"{"heartbeat_interval": 5.0}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.coordinator().load().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_admin_routes_not_on_fleet_listener() {
        let app = create_router(state(1024));

        let resp = app
            .oneshot(Request::get("/v1/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

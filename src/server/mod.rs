pub mod error;
pub mod identity;
pub mod routes;
pub mod ws;

use crate::state::AppState;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/trades", post(routes::create_trade).get(routes::get_trades))
        .route("/api/trades/{id}/settle", post(routes::settle_trade))
        .route("/api/sweep", post(routes::sweep))
        .route("/api/account", get(routes::get_account))
        .route("/api/quota", get(routes::get_quota))
        .route("/api/settings", put(routes::put_settings))
        .route("/api/positions", post(routes::open_position))
        .route("/api/positions/{id}/close", post(routes::close_position))
        .route("/api/deposit", post(routes::deposit))
        .route("/api/limits", get(routes::get_limits))
        .route("/api/counters", get(routes::get_counters))
        .route("/ws", get(ws::ws_handler))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

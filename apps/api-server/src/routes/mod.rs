mod caption;

pub use caption::CaptionResponse;

use crate::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn get_routes(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/", get(|| async { "caption server is running" }))
        .route("/caption", post(caption::generate_caption))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer({
            let cors = CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any);
            cors
        })
        .with_state(state)
}

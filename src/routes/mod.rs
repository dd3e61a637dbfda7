use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod health;
pub mod notifications;
pub mod sequences;
pub mod track;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_headers(tower_http::cors::AllowHeaders::mirror_request());

    let sequence_routes = Router::new()
        .route("/:id/launch", post(sequences::launch))
        .route("/:id/pause", post(sequences::pause))
        .route("/:id/resume", post(sequences::resume))
        .route("/:id/reset", post(sequences::reset));

    // Both routes share the :hash position; the pixel handler strips the
    // ".png" suffix itself.
    let track_routes = Router::new()
        .route("/:hash", get(track::open_pixel))
        .route("/:hash/click", get(track::click));

    Router::new()
        .nest("/sequences", sequence_routes)
        .nest("/api/track", track_routes)
        .route("/api/gmail/notifications", post(notifications::receive))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
}

pub mod api;
pub mod auth;
pub mod chat;
pub mod cors;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Limits;

pub use auth::AuthUser;
pub use state::AppState;

/// Base64 inflates images by a third; leave room for history and text.
const BODY_LIMIT_FACTOR: usize = 4;

/// Largest request body accepted on `/chat` and `/api`.
pub fn body_limit(limits: &Limits) -> usize {
    limits.max_image_size.saturating_mul(BODY_LIMIT_FACTOR)
}

pub fn router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let api_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let api = Router::new()
        .route("/api/me", get(api::me))
        .route("/api/models", get(api::list_models))
        .route("/api/preferences", get(api::get_preferences).put(api::put_preferences))
        .route(
            "/api/conversations",
            post(api::create_conversation).get(api::list_conversations),
        )
        .route(
            "/api/conversations/:id",
            get(api::get_conversation).delete(api::delete_conversation),
        )
        .route("/api/conversations/:id/name", put(api::rename_conversation))
        .route("/api/conversations/:id/pin", post(api::toggle_pin))
        .route(
            "/api/conversations/:id/messages",
            get(api::list_messages).post(api::send_message),
        )
        .route("/api/conversations/:id/images", post(api::generate_image))
        .route("/api/uploads", post(api::create_upload_url))
        .route("/api/uploads/:ticket", post(api::upload))
        .route("/api/files/:id", get(api::download))
        .layer(api_cors);

    let body_limit = body_limit(&state.config.limits);

    Router::new()
        .route("/health", get(api::health))
        .route("/chat", post(chat::chat).options(chat::preflight))
        .merge(api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    BoxError, Router,
};
use http::HeaderValue;
use tower::ServiceBuilder;
use tower_cookies::CookieManagerLayer;
use tower_http::cors::CorsLayer;

use crate::{error::AppError, request_tracing, ServerState};

use super::handlers::{auth, batch, email};

pub struct AppRouter;

impl AppRouter {
    pub fn create(state: ServerState) -> Router {
        let frontend_origin = state.config.frontend.base_url.origin().ascii_serialization();
        let origins = [frontend_origin]
            .into_iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect::<Vec<_>>();

        let cors_layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true);

        let timeout = Duration::from_secs(state.config.server.request_timeout_secs);

        let router = Router::new()
            .route("/", get(|| async { "Inbox extraction server" }))
            .nest(
                "/auth",
                Router::new()
                    .route("/google", get(auth::handler_auth_google))
                    .route("/callback", get(auth::handler_auth_callback))
                    .route("/refresh", post(auth::handler_refresh))
                    .route("/logout", post(auth::handler_logout))
                    .route("/me", get(auth::handler_me)),
            )
            .nest(
                "/emails",
                Router::new()
                    .route("/", get(email::list_messages))
                    .route("/processed", get(email::list_processed))
                    .route("/batch", post(batch::submit_batch))
                    .route(
                        "/:id",
                        get(email::get_message).delete(email::delete_message),
                    )
                    .route("/:id/labels", post(email::modify_labels)),
            )
            .layer(CookieManagerLayer::new())
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .timeout(timeout),
            );

        request_tracing::with_request_tracing(router)
            .layer(cors_layer)
            .with_state(state)
            .fallback(handler_404)
    }
}

async fn handle_timeout_error(err: BoxError) -> AppError {
    if err.is::<tower::timeout::error::Elapsed>() {
        AppError::RequestTimeout
    } else {
        AppError::Internal(anyhow::anyhow!("Unhandled middleware error: {err}"))
    }
}

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Route does not exist")
}

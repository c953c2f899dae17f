//! API routes

pub mod billing;
pub mod health;


use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let mut public_api_routes: Router<AppState> = Router::new();
    let mut protected_api_routes: Router<AppState> = Router::new();

    if state.config.enable_billing {
        // Stripe webhook authenticates by signature, not JWT
        public_api_routes = public_api_routes.route("/billing/webhook", post(billing::webhook));

        protected_api_routes = protected_api_routes
            .route("/billing/checkout", post(billing::create_checkout))
            .route(
                "/billing/cancel",
                post(billing::cancel_subscription).delete(billing::reactivate_subscription),
            )
            .route("/billing/subscription", get(billing::get_subscription))
            .route("/billing/features", get(billing::get_features));
    }

    let protected_api_routes = protected_api_routes
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}

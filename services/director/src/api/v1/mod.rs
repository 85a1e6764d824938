//! API v1 routes.

mod services;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().nest("/services", services::routes())
}

use crate::state::AppState;
use axum::Router;

pub mod cache;
pub mod claims;
pub mod handlers;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod providers;
pub mod repo;
pub mod repo_types;
pub mod services;
pub mod session;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::auth_routes())
}

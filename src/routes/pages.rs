//! JSON stand-ins for the app's pages. Rendering lives elsewhere; these
//! exist so route protection has something to protect.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::{
    auth::session::{MaybeSession, RequiredSession},
    state::AppState,
};

pub fn page_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(home))
        .route("/dashboard", get(dashboard))
        .route("/profile", get(profile))
}

pub async fn home(MaybeSession(session): MaybeSession) -> Json<Value> {
    Json(json!({
        "page": "home",
        "user": session.as_ref().map(|s| s.display_name()),
    }))
}

pub async fn dashboard(RequiredSession(session): RequiredSession) -> Json<Value> {
    Json(json!({
        "page": "dashboard",
        "welcome": session.display_name(),
        "user": session.user,
    }))
}

pub async fn profile(RequiredSession(session): RequiredSession) -> Json<Value> {
    Json(json!({
        "page": "profile",
        "user": session.user,
        "expires": session.expires.unix_timestamp(),
    }))
}

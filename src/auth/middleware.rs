use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::debug;

use crate::{
    auth::session::{get_session, login_redirect_target, Session},
    state::AppState,
};

/// Routes that only make sense without a session.
pub const AUTH_ONLY_ROUTES: &[&str] = &["/login", "/register"];

/// Route prefixes that need a session.
pub const PROTECTED_PREFIXES: &[&str] = &["/dashboard", "/profile", "/api/user"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Public,
    AuthOnly,
    Protected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Continue,
    RedirectToLogin { return_to: String },
    RedirectToHome,
}

// `/dashboard` covers `/dashboard/x` but not `/dashboards`.
fn under_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

pub fn classify(path: &str) -> RouteClass {
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    if AUTH_ONLY_ROUTES.contains(&path) {
        RouteClass::AuthOnly
    } else if PROTECTED_PREFIXES.iter().any(|p| under_prefix(path, p)) {
        RouteClass::Protected
    } else {
        RouteClass::Public
    }
}

/// `path_and_query` is what the login page sends the user back to.
pub fn decide(path: &str, path_and_query: &str, session: Option<&Session>) -> AccessDecision {
    match (classify(path), session.is_some()) {
        (RouteClass::AuthOnly, true) => AccessDecision::RedirectToHome,
        (RouteClass::Protected, false) => AccessDecision::RedirectToLogin {
            return_to: path_and_query.to_string(),
        },
        _ => AccessDecision::Continue,
    }
}

/// Decodes the session locally (no I/O) and applies [`decide`]. A decoded
/// session is handed to handlers through request extensions.
pub async fn access_guard(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let session = get_session(req.headers(), &state.keys);
    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    match decide(&path, &path_and_query, session.as_ref()) {
        AccessDecision::Continue => {
            if let Some(session) = session {
                req.extensions_mut().insert(session);
            }
            next.run(req).await
        }
        AccessDecision::RedirectToLogin { return_to } => {
            debug!(%path, "no session for protected route");
            Redirect::temporary(&login_redirect_target(&return_to)).into_response()
        }
        AccessDecision::RedirectToHome => {
            debug!(%path, "signed-in user sent away from auth page");
            Redirect::temporary("/").into_response()
        }
    }
}

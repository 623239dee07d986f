use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{instrument, warn};

use crate::{
    auth::{
        repo_types::PublicUser,
        services::IssuedSession,
        session::{
            clear_oauth_state_cookie, clear_session_cookie, extract_session_token,
            oauth_state_cookie, read_cookie, session_cookie, MaybeSession,
            OAUTH_STATE_COOKIE_NAME,
        },
    },
    error::{AppError, AppResult},
    state::AppState,
};

/// Where failed provider sign-ins land.
pub const PROVIDER_FAILURE_REDIRECT: &str = "/login?error=ProviderFailure";

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: PublicUser,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub sign_in_url: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(rename = "callbackUrl")]
    pub callback_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/login", get(login_page))
        .route("/register", get(register_page).post(register))
        .route("/sign-in", post(sign_in))
        .route("/sign-out", post(sign_out))
        .route("/auth/providers", get(list_providers))
        .route("/auth/:provider", get(provider_sign_in))
        .route("/auth/:provider/callback", get(provider_callback))
        .route("/api/session", get(current_session))
}

/// Malformed bodies get the JSON error envelope instead of axum's plain text.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::JsonDataError(e)) => {
            Err(AppError::validation(e.body_text(), "MISSING_FIELD"))
        }
        Err(_) => Err(AppError::validation("Invalid JSON body", "INVALID_JSON")),
    }
}

fn issued_response(
    state: &AppState,
    status: StatusCode,
    issued: IssuedSession,
) -> AppResult<Response> {
    let cookie = session_cookie(&issued.token, &state.keys, state.config.cookie_secure)
        .context("build session cookie")?;
    Ok((
        status,
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(SessionResponse {
            user: issued.user,
            expires_at: issued.expires_at,
        }),
    )
        .into_response())
}

#[instrument(skip(state, body))]
pub async fn sign_in(
    State(state): State<AppState>,
    body: Result<Json<SignInRequest>, JsonRejection>,
) -> AppResult<Response> {
    let payload = json_body(body)?;
    let issued = state
        .auth
        .sign_in_with_credentials(&payload.email, &payload.password)
        .await?;
    issued_response(&state, StatusCode::OK, issued)
}

#[instrument(skip(state, body))]
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<Response> {
    let payload = json_body(body)?;
    let issued = state
        .auth
        .register(&payload.email, &payload.password, payload.name.as_deref())
        .await?;
    issued_response(&state, StatusCode::CREATED, issued)
}

/// Always clears the cookie, even when there was nothing to sign out of.
#[instrument(skip(state, headers))]
pub async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let token = extract_session_token(&headers);
    state.auth.sign_out(token.as_deref()).await;
    let cookie = clear_session_cookie(state.config.cookie_secure).context("clear session cookie")?;
    Ok((StatusCode::NO_CONTENT, AppendHeaders([(SET_COOKIE, cookie)])).into_response())
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(
        state
            .auth
            .providers()
            .iter()
            .map(|p| ProviderInfo {
                id: p.id(),
                name: p.display_name(),
                sign_in_url: format!("/auth/{}", p.id()),
            })
            .collect(),
    )
}

#[instrument(skip(state))]
pub async fn provider_sign_in(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
) -> AppResult<Response> {
    if state.auth.providers().get(&provider).is_none() {
        return Err(AppError::NotFound);
    }
    let redirect = state
        .auth
        .begin_provider_sign_in(&provider, query.callback_url.as_deref())?;
    let cookie = oauth_state_cookie(&redirect.state_token, state.config.cookie_secure)
        .context("build oauth state cookie")?;
    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Redirect::temporary(&redirect.authorize_url),
    )
        .into_response())
}

#[instrument(skip(state, headers, query))]
pub async fn provider_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let secure = state.config.cookie_secure;
    let clear_state = clear_oauth_state_cookie(secure).context("clear oauth state cookie")?;

    let (code, returned_state) = match (query.code, query.state, query.error) {
        (Some(code), Some(returned_state), None) => (code, returned_state),
        (_, _, error) => {
            warn!(%provider, error = ?error, "provider callback without code");
            return Ok((
                AppendHeaders([(SET_COOKIE, clear_state)]),
                Redirect::to(PROVIDER_FAILURE_REDIRECT),
            )
                .into_response());
        }
    };

    let state_token = read_cookie(&headers, OAUTH_STATE_COOKIE_NAME);
    let outcome = state
        .auth
        .complete_provider_sign_in(&provider, &code, &returned_state, state_token.as_deref())
        .await;

    match outcome {
        Ok((issued, next)) => {
            let cookie =
                session_cookie(&issued.token, &state.keys, secure).context("build session cookie")?;
            Ok((
                AppendHeaders([(SET_COOKIE, clear_state), (SET_COOKIE, cookie)]),
                Redirect::to(&next),
            )
                .into_response())
        }
        Err(e) => {
            warn!(%provider, error = %e, "provider sign-in failed");
            Ok((
                AppendHeaders([(SET_COOKIE, clear_state)]),
                Redirect::to(PROVIDER_FAILURE_REDIRECT),
            )
                .into_response())
        }
    }
}

/// Reports what the server sees; useful while wiring up a client.
/// `cacheActive` is the advisory marker, `null` when unknown.
pub async fn current_session(
    State(state): State<AppState>,
    MaybeSession(session): MaybeSession,
) -> Json<serde_json::Value> {
    let cache_active = match &session {
        Some(s) => state.auth.session_marker(s.user.id).await,
        None => None,
    };
    Json(serde_json::json!({
        "authenticated": session.is_some(),
        "session": session,
        "cacheActive": cache_active,
    }))
}

pub async fn login_page(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Json<serde_json::Value> {
    let providers: Vec<&str> = state.auth.providers().ids();
    Json(serde_json::json!({
        "page": "login",
        "providers": providers,
        "callbackUrl": query.callback_url,
        "error": query.error,
    }))
}

pub async fn register_page() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "page": "register" }))
}

use axum::{
    extract::{rejection::JsonRejection, Query},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    auth::session::MaybeSession,
    error::{AppError, AppResult, AuthError},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ExampleQuery {
    pub action: Option<String>,
}

pub fn example_routes() -> Router<AppState> {
    Router::new().route("/api/example", get(get_example).post(post_example))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Shows the error envelope: `?action=validation-error` or `?action=auth-error`.
pub async fn get_example(
    MaybeSession(session): MaybeSession,
    Query(query): Query<ExampleQuery>,
) -> AppResult<Json<Value>> {
    match query.action.as_deref() {
        Some("validation-error") => Err(AppError::validation(
            "Invalid parameters provided",
            "INVALID_PARAMS",
        )),
        Some("auth-error") => Err(AuthError::SessionExpiredOrAbsent.into()),
        _ => Ok(Json(json!({
            "message": "API is working correctly!",
            "timestamp": now_rfc3339(),
            "user": session
                .and_then(|s| s.user.email)
                .unwrap_or_else(|| "Not authenticated".into()),
        }))),
    }
}

pub async fn post_example(
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let Json(body) = body.map_err(|_| AppError::validation("Invalid JSON body", "INVALID_JSON"))?;
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::validation("Message is required", "MISSING_FIELD"))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("Received: {message}"),
            "timestamp": now_rfc3339(),
        })),
    ))
}

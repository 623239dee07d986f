use axum::{extract::State, routing::get, Json, Router};
use tracing::{error, instrument, warn};

use crate::{
    auth::{repo_types::PublicUser, session::RequiredSession},
    error::{AppResult, AuthError},
    state::AppState,
};

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/api/user/me", get(me_route))
}

/// Re-resolves the token subject, so a deleted account stops working here
/// even while its token is still within its lifetime.
#[instrument(skip(state, session))]
pub async fn me_route(
    State(state): State<AppState>,
    RequiredSession(session): RequiredSession,
) -> AppResult<Json<PublicUser>> {
    let user_id = session.user.id;
    let user = state.auth.users().find_by_id(user_id).await.map_err(|e| {
        error!(error = %e, user_id = %user_id, "user lookup failed");
        e
    })?;
    match user {
        Some(user) => Ok(Json(PublicUser::from(&user))),
        None => {
            warn!(user_id = %user_id, "session subject no longer exists");
            Err(AuthError::SessionExpiredOrAbsent.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_me_response_serialization() {
        let response = PublicUser {
            id: uuid::Uuid::new_v4(),
            email: "test@example.com".to_string(),
            name: None,
            image: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test@example.com"));
        assert!(json.contains("id"));
        assert!(!json.contains("password"));
    }
}

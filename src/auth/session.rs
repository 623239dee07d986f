//! Session transport and the read-side accessor.
//!
//! `get_session` never fails: a missing, malformed, forged or expired token
//! is just "no session". `require_session` turns that into a redirect value
//! the handler returns, so the pipeline stops instead of unwinding.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
        request::Parts,
        HeaderMap, HeaderValue,
    },
    response::{IntoResponse, Redirect, Response},
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{claims::SessionClaims, jwt::SessionKeys, jwt::OAUTH_STATE_TTL};

pub const SESSION_COOKIE_NAME: &str = "session_token";
pub const OAUTH_STATE_COOKIE_NAME: &str = "oauth_state";
pub const LOGIN_PATH: &str = "/login";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
}

/// Identity resolved from a valid session token.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Session {
    pub user: SessionUser,
    #[serde(with = "time::serde::rfc3339")]
    pub expires: OffsetDateTime,
}

impl Session {
    pub fn from_claims(claims: SessionClaims) -> Self {
        let expires = OffsetDateTime::from_unix_timestamp(claims.exp as i64)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Self {
            user: SessionUser {
                id: claims.sub,
                name: claims.name,
                email: claims.email,
                image: claims.picture,
            },
            expires,
        }
    }

    /// Name, else the local part of the email, else "User".
    pub fn display_name(&self) -> String {
        if let Some(name) = self.user.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.user
            .email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or("User")
            .to_string()
    }
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            if key.trim() == name && !val.trim().is_empty() {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Session token from the `Authorization` header or the session cookie.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| read_cookie(headers, SESSION_COOKIE_NAME))
}

fn cookie(name: &str, value: &str, max_age: u64, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub fn session_cookie(
    token: &str,
    keys: &SessionKeys,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(SESSION_COOKIE_NAME, token, keys.session_ttl().as_secs(), secure)
}

pub fn clear_session_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(SESSION_COOKIE_NAME, "", 0, secure)
}

pub fn oauth_state_cookie(token: &str, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(OAUTH_STATE_COOKIE_NAME, token, OAUTH_STATE_TTL.as_secs(), secure)
}

pub fn clear_oauth_state_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    cookie(OAUTH_STATE_COOKIE_NAME, "", 0, secure)
}

/// Only same-site absolute paths are allowed as post-sign-in targets.
pub fn sanitize_callback(callback: Option<&str>) -> String {
    match callback.map(str::trim) {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// `/login?callbackUrl=<encoded return path>`.
pub fn login_redirect_target(return_to: &str) -> String {
    format!(
        "{LOGIN_PATH}?callbackUrl={}",
        urlencoding::encode(return_to)
    )
}

pub fn get_session(headers: &HeaderMap, keys: &SessionKeys) -> Option<Session> {
    let token = extract_session_token(headers)?;
    match keys.verify_session(&token) {
        Ok(claims) => Some(Session::from_claims(claims)),
        Err(e) => {
            debug!(error = %e, "ignoring unusable session token");
            None
        }
    }
}

/// Short-circuit response produced when a session is required but absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRedirect {
    pub target: String,
}

impl IntoResponse for SessionRedirect {
    fn into_response(self) -> Response {
        Redirect::temporary(&self.target).into_response()
    }
}

pub fn require_session(
    headers: &HeaderMap,
    keys: &SessionKeys,
    redirect_to: Option<&str>,
) -> Result<Session, SessionRedirect> {
    get_session(headers, keys).ok_or_else(|| SessionRedirect {
        target: redirect_to.unwrap_or(LOGIN_PATH).to_string(),
    })
}

/// Session decoded by the access middleware or, failing that, from headers.
fn session_from_parts(parts: &Parts, keys: &SessionKeys) -> Option<Session> {
    if let Some(session) = parts.extensions.get::<Session>() {
        return Some(session.clone());
    }
    get_session(&parts.headers, keys)
}

/// Optional session for handlers that work either way.
pub struct MaybeSession(pub Option<Session>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeSession
where
    S: Send + Sync,
    SessionKeys: FromRef<S>,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = SessionKeys::from_ref(state);
        Ok(MaybeSession(session_from_parts(parts, &keys)))
    }
}

/// Session or a redirect to the login page that returns here afterwards.
pub struct RequiredSession(pub Session);

#[async_trait]
impl<S> FromRequestParts<S> for RequiredSession
where
    S: Send + Sync,
    SessionKeys: FromRef<S>,
{
    type Rejection = SessionRedirect;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = SessionKeys::from_ref(state);
        let return_to = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if let Some(session) = parts.extensions.get::<Session>() {
            return Ok(RequiredSession(session.clone()));
        }
        let target = login_redirect_target(return_to);
        require_session(&parts.headers, &keys, Some(&target)).map(RequiredSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        claims::TokenKind,
        jwt::{test_keys, test_user},
        repo_types::User,
    };

    fn with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn expired_token(keys: &SessionKeys) -> String {
        let past = (OffsetDateTime::now_utc().unix_timestamp() - 7200) as usize;
        keys.sign_raw(&SessionClaims {
            sub: Uuid::new_v4(),
            name: None,
            email: None,
            picture: None,
            iat: past - 60,
            exp: past,
            iss: "test-issuer".into(),
            aud: "test-aud".into(),
            kind: TokenKind::Session,
        })
    }

    #[test]
    fn reads_session_cookie_among_others() {
        let headers = with_cookie("theme=dark; session_token=abc.def.ghi; other=1");
        assert_eq!(extract_session_token(&headers).as_deref(), Some("abc.def.ghi"));
        assert_eq!(read_cookie(&headers, "theme").as_deref(), Some("dark"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = with_cookie("session_token=from-cookie");
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn get_session_resolves_valid_cookie() {
        let keys = test_keys("s");
        let user = test_user("ada@example.com");
        let token = keys.sign_session(&user).unwrap().token;
        let session = get_session(&with_cookie(&format!("session_token={token}")), &keys)
            .expect("session");
        assert_eq!(session.user.id, user.id);
        assert_eq!(session.user.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn get_session_is_none_for_absent_malformed_expired_or_forged() {
        let keys = test_keys("s");
        let forged = test_keys("other").sign_session(&test_user("a@b.io")).unwrap().token;
        assert_eq!(get_session(&HeaderMap::new(), &keys), None);
        assert_eq!(get_session(&with_cookie("session_token=%%%garbage"), &keys), None);
        assert_eq!(
            get_session(&with_cookie(&format!("session_token={}", expired_token(&keys))), &keys),
            None
        );
        assert_eq!(get_session(&with_cookie(&format!("session_token={forged}")), &keys), None);
    }

    #[test]
    fn require_session_redirects_when_absent() {
        let keys = test_keys("s");
        let redirect = require_session(&HeaderMap::new(), &keys, None).unwrap_err();
        assert_eq!(redirect.target, "/login");

        let expired = with_cookie(&format!("session_token={}", expired_token(&keys)));
        let redirect = require_session(&expired, &keys, Some("/login?from=profile")).unwrap_err();
        assert_eq!(redirect.target, "/login?from=profile");

        let response = redirect.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::TEMPORARY_REDIRECT);
    }

    #[test]
    fn cookies_are_http_only_and_scoped() {
        let keys = test_keys("s");
        let set = session_cookie("tok", &keys, true).unwrap();
        let set = set.to_str().unwrap();
        assert!(set.starts_with("session_token=tok; Path=/; HttpOnly; SameSite=Lax"));
        assert!(set.contains(&format!("Max-Age={}", 30 * 24 * 60 * 60)));
        assert!(set.ends_with("; Secure"));

        let cleared = clear_session_cookie(false).unwrap();
        assert!(cleared.to_str().unwrap().contains("Max-Age=0"));
        assert!(!cleared.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn callback_sanitising() {
        assert_eq!(sanitize_callback(Some("/dashboard?tab=1")), "/dashboard?tab=1");
        assert_eq!(sanitize_callback(Some("https://evil.example")), "/");
        assert_eq!(sanitize_callback(Some("//evil.example")), "/");
        assert_eq!(sanitize_callback(Some("/\\evil.example")), "/");
        assert_eq!(sanitize_callback(None), "/");
    }

    #[test]
    fn login_target_encodes_return_path() {
        assert_eq!(login_redirect_target("/dashboard"), "/login?callbackUrl=%2Fdashboard");
        assert_eq!(
            login_redirect_target("/profile?tab=a&b=c"),
            "/login?callbackUrl=%2Fprofile%3Ftab%3Da%26b%3Dc"
        );
    }

    #[test]
    fn display_name_fallbacks() {
        let keys = test_keys("s");
        let mut user = test_user("grace@example.com");
        let session = |u: &User| {
            Session::from_claims(keys.verify_session(&keys.sign_session(u).unwrap().token).unwrap())
        };
        assert_eq!(session(&user).display_name(), "Ada");
        user.name = None;
        assert_eq!(session(&user).display_name(), "grace");

        let mut anon = session(&user);
        anon.user.email = None;
        assert_eq!(anon.display_name(), "User");
    }

    fn parts_for(uri: &str, headers: HeaderMap) -> Parts {
        let mut request = axum::http::Request::builder().uri(uri).body(()).unwrap();
        *request.headers_mut() = headers;
        request.into_parts().0
    }

    #[tokio::test]
    async fn required_session_extractor_redirects_with_return_path() {
        let keys = test_keys("s");
        let mut parts = parts_for("/profile?tab=a", HeaderMap::new());
        let rejection = RequiredSession::from_request_parts(&mut parts, &keys)
            .await
            .err()
            .unwrap();
        assert_eq!(rejection.target, "/login?callbackUrl=%2Fprofile%3Ftab%3Da");
    }

    #[tokio::test]
    async fn required_session_extractor_accepts_cookie_or_extension() {
        let keys = test_keys("s");
        let token = keys.sign_session(&test_user("a@b.io")).unwrap().token;
        let mut parts = parts_for("/profile", with_cookie(&format!("session_token={token}")));
        let RequiredSession(session) = RequiredSession::from_request_parts(&mut parts, &keys)
            .await
            .ok()
            .unwrap();
        assert_eq!(session.user.email.as_deref(), Some("a@b.io"));

        let mut parts = parts_for("/profile", HeaderMap::new());
        parts.extensions.insert(session.clone());
        let RequiredSession(from_ext) = RequiredSession::from_request_parts(&mut parts, &keys)
            .await
            .ok()
            .unwrap();
        assert_eq!(from_ext, session);
    }
}

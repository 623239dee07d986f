use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        cache::AdvisoryCache,
        jwt::SessionKeys,
        password::CredentialHasher,
        providers::ProviderRegistry,
        repo::UserStore,
        repo_types::{PublicUser, User},
        session::sanitize_callback,
    },
    error::AuthError,
};

pub const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Emails compare case-insensitively: stored and looked up lowercase.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInPhase {
    Received,
    Validating,
    Authenticated,
    Rejected,
}

struct Attempt {
    method: &'static str,
    phase: SignInPhase,
}

impl Attempt {
    fn new(method: &'static str) -> Self {
        debug!(method, phase = ?SignInPhase::Received, "sign-in attempt");
        Self {
            method,
            phase: SignInPhase::Received,
        }
    }

    fn advance(&mut self, next: SignInPhase) {
        debug!(method = self.method, from = ?self.phase, to = ?next, "sign-in transition");
        self.phase = next;
    }

    fn reject(&mut self, err: AuthError) -> AuthError {
        self.advance(SignInPhase::Rejected);
        err
    }
}

/// Result of a successful sign-in.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub user: PublicUser,
    pub expires_at: OffsetDateTime,
}

/// First leg of a provider sign-in.
#[derive(Debug, Clone)]
pub struct ProviderRedirect {
    pub authorize_url: String,
    /// Signed OAuth state; goes into a short-lived cookie.
    pub state_token: String,
}

/// Orchestrates sign-in, registration and sign-out.
#[derive(Clone)]
pub struct AuthCoordinator {
    users: Arc<dyn UserStore>,
    hasher: Arc<dyn CredentialHasher>,
    keys: SessionKeys,
    cache: AdvisoryCache,
    providers: ProviderRegistry,
    // Verified against when the account is missing so both paths cost the same.
    dummy_digest: Arc<str>,
}

impl AuthCoordinator {
    pub fn new(
        users: Arc<dyn UserStore>,
        hasher: Arc<dyn CredentialHasher>,
        keys: SessionKeys,
        cache: AdvisoryCache,
        providers: ProviderRegistry,
    ) -> anyhow::Result<Self> {
        let dummy_digest = hasher.hash("authgate-dummy-password")?.into();
        Ok(Self {
            users,
            hasher,
            keys,
            cache,
            providers,
            dummy_digest,
        })
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    async fn verify_password(&self, plain: &str, digest: &str) -> bool {
        let hasher = self.hasher.clone();
        let (plain, digest) = (plain.to_string(), digest.to_string());
        match tokio::task::spawn_blocking(move || hasher.verify(&plain, &digest)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                error!(error = %e, "stored password hash is malformed");
                false
            }
            Err(e) => {
                error!(error = %e, "password verification task failed");
                false
            }
        }
    }

    async fn hash_password(&self, plain: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let plain = plain.to_string();
        let digest = tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .map_err(|e| anyhow::anyhow!("hash task failed: {e}"))??;
        Ok(digest)
    }

    /// Token from the stored record, then the advisory marker.
    async fn authenticated(
        &self,
        attempt: &mut Attempt,
        user: &User,
    ) -> Result<IssuedSession, AuthError> {
        let signed = self.keys.sign_session(user)?;
        attempt.advance(SignInPhase::Authenticated);
        self.cache
            .mark_active(user.id, self.keys.session_ttl())
            .await;
        info!(user_id = %user.id, method = attempt.method, "user signed in");
        Ok(IssuedSession {
            token: signed.token,
            user: PublicUser::from(user),
            expires_at: signed.expires_at,
        })
    }

    pub async fn sign_in_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<IssuedSession, AuthError> {
        let mut attempt = Attempt::new("credentials");
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(attempt.reject(AuthError::InvalidCredentials));
        }
        attempt.advance(SignInPhase::Validating);

        let user = self.users.find_by_email(&email).await.map_err(|e| {
            error!(error = %e, "find_by_email failed");
            attempt.reject(AuthError::Internal(e))
        })?;

        let verified = match user.as_ref().and_then(|u| u.password_hash.as_deref()) {
            Some(digest) => self.verify_password(password, digest).await,
            None => {
                let _ = self.verify_password(password, &self.dummy_digest).await;
                false
            }
        };

        match user {
            Some(user) if verified => self.authenticated(&mut attempt, &user).await,
            _ => {
                warn!("credentials sign-in rejected");
                Err(attempt.reject(AuthError::InvalidCredentials))
            }
        }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<IssuedSession, AuthError> {
        let mut attempt = Attempt::new("register");
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            warn!("registration with invalid email");
            return Err(attempt.reject(AuthError::Validation("Invalid email".into())));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(attempt.reject(AuthError::Validation("Password too short".into())));
        }
        attempt.advance(SignInPhase::Validating);

        if self.users.find_by_email(&email).await?.is_some() {
            warn!("registration for an existing email");
            return Err(attempt.reject(AuthError::Conflict("Email already registered".into())));
        }

        let digest = self.hash_password(password).await?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let Some(user) = self
            .users
            .create_with_password(&email, name, &digest)
            .await?
        else {
            warn!("registration lost a race for its email");
            return Err(attempt.reject(AuthError::Conflict("Email already registered".into())));
        };
        info!(user_id = %user.id, "user registered");
        self.authenticated(&mut attempt, &user).await
    }

    pub fn begin_provider_sign_in(
        &self,
        provider_id: &str,
        callback_url: Option<&str>,
    ) -> Result<ProviderRedirect, AuthError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| AuthError::ProviderFailure(format!("unknown provider {provider_id}")))?;
        let request = provider.authorization_request();
        let state_token = self.keys.sign_oauth_state(
            provider.id(),
            &request.csrf,
            &request.pkce_verifier,
            &sanitize_callback(callback_url),
        )?;
        debug!(provider = provider.id(), "provider redirect issued");
        Ok(ProviderRedirect {
            authorize_url: request.url,
            state_token,
        })
    }

    /// Returns the session and the sanitised path to continue to.
    pub async fn complete_provider_sign_in(
        &self,
        provider_id: &str,
        code: &str,
        returned_state: &str,
        state_token: Option<&str>,
    ) -> Result<(IssuedSession, String), AuthError> {
        let mut attempt = Attempt::new("provider");
        let provider = self.providers.get(provider_id).ok_or_else(|| {
            attempt.reject(AuthError::ProviderFailure(format!(
                "unknown provider {provider_id}"
            )))
        })?;

        let state = state_token
            .ok_or_else(|| AuthError::ProviderFailure("missing oauth state cookie".into()))
            .and_then(|t| {
                self.keys
                    .verify_oauth_state(t)
                    .map_err(|e| AuthError::ProviderFailure(format!("bad oauth state: {e}")))
            })
            .map_err(|e| attempt.reject(e))?;
        if state.provider != provider.id() || state.csrf != returned_state {
            return Err(attempt.reject(AuthError::ProviderFailure("oauth state mismatch".into())));
        }
        attempt.advance(SignInPhase::Validating);

        let profile = provider
            .exchange(code, &state.pkce_verifier)
            .await
            .map_err(|e| attempt.reject(AuthError::ProviderFailure(e.to_string())))?;
        let user = self.users.upsert_from_provider(&profile).await.map_err(|e| {
            error!(error = %e, provider = provider.id(), "upsert_from_provider failed");
            attempt.reject(AuthError::Internal(e))
        })?;

        let issued = self.authenticated(&mut attempt, &user).await?;
        Ok((issued, sanitize_callback(Some(&state.callback_url))))
    }

    /// Advisory marker state for `user_id`. `None` when the cache could not
    /// answer. Never used for access decisions.
    pub async fn session_marker(&self, user_id: Uuid) -> Option<bool> {
        self.cache.is_active(user_id).await
    }

    /// Clears the advisory marker of the token's subject, if any. Never fails.
    pub async fn sign_out(&self, token: Option<&str>) {
        match token.map(|t| self.keys.verify_session(t)) {
            Some(Ok(claims)) => {
                self.cache.clear(claims.sub).await;
                info!(user_id = %claims.sub, "user signed out");
            }
            Some(Err(e)) => debug!(error = %e, "sign-out with unusable token"),
            None => debug!("sign-out without session"),
        }
    }
}

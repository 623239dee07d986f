use std::time::Duration;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use crate::{
    auth::{
        claims::{OAuthStateClaims, SessionClaims, TokenKind},
        repo_types::User,
    },
    config::JwtConfig,
};

/// OAuth handshakes must complete within this window.
pub const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    session_ttl: Duration,
}

/// A freshly signed session token.
#[derive(Debug, Clone)]
pub struct SignedSession {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl SessionKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            session_ttl: cfg.session_ttl(),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    fn oauth_audience(&self) -> String {
        format!("{}:oauth-state", self.audience)
    }

    fn window(ttl: Duration) -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now, now + TimeDuration::seconds(ttl.as_secs() as i64))
    }

    /// Sign a session token whose identity fields come from the stored user.
    pub fn sign_session(&self, user: &User) -> anyhow::Result<SignedSession> {
        let (now, exp) = Self::window(self.session_ttl);
        let claims = SessionClaims {
            sub: user.id,
            name: user.name.clone(),
            email: Some(user.email.clone()),
            picture: user.image.clone(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind: TokenKind::Session,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user.id, "session jwt signed");
        Ok(SignedSession {
            token,
            expires_at: exp,
        })
    }

    pub fn sign_oauth_state(
        &self,
        provider: &str,
        csrf: &str,
        pkce_verifier: &str,
        callback_url: &str,
    ) -> anyhow::Result<String> {
        let (now, exp) = Self::window(OAUTH_STATE_TTL);
        let claims = OAuthStateClaims {
            provider: provider.to_string(),
            csrf: csrf.to_string(),
            pkce_verifier: pkce_verifier.to_string(),
            callback_url: callback_url.to_string(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.oauth_audience(),
            kind: TokenKind::OauthState,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    fn decode_with<T: DeserializeOwned>(&self, token: &str, audience: &str) -> anyhow::Result<T> {
        let mut validation = Validation::default();
        validation.set_audience(&[audience]);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<T>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }

    /// Verify signature, expiry, issuer and audience of a session token.
    pub fn verify_session(&self, token: &str) -> anyhow::Result<SessionClaims> {
        let claims: SessionClaims = self.decode_with(token, &self.audience)?;
        if claims.kind != TokenKind::Session {
            anyhow::bail!("not a session token");
        }
        debug!(user_id = %claims.sub, "session jwt verified");
        Ok(claims)
    }

    pub fn verify_oauth_state(&self, token: &str) -> anyhow::Result<OAuthStateClaims> {
        let claims: OAuthStateClaims = self.decode_with(token, &self.oauth_audience())?;
        if claims.kind != TokenKind::OauthState {
            anyhow::bail!("not an oauth state token");
        }
        Ok(claims)
    }

    #[cfg(test)]
    pub(crate) fn sign_raw<T: serde::Serialize>(&self, claims: &T) -> String {
        encode(&Header::default(), claims, &self.encoding).expect("encode test claims")
    }
}

#[cfg(test)]
pub(crate) fn test_keys(secret: &str) -> SessionKeys {
    SessionKeys::new(&JwtConfig {
        secret: secret.into(),
        issuer: "test-issuer".into(),
        audience: "test-aud".into(),
        session_ttl_days: 30,
    })
}

#[cfg(test)]
pub(crate) fn test_user(email: &str) -> User {
    let now = OffsetDateTime::now_utc();
    User {
        id: uuid::Uuid::new_v4(),
        email: email.into(),
        name: Some("Ada".into()),
        password_hash: None,
        image: Some("https://img.example/ada.png".into()),
        created_at: now,
        updated_at: now,
    }
}

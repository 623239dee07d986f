//! OAuth 2.0 identity providers (authorization code + PKCE).
//!
//! A provider turns an authorization code into a verified [`ProviderProfile`].
//! CSRF state and the PKCE verifier are produced here but carried by the
//! caller (signed cookie), so providers hold no per-login state.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tracing::info;

use crate::{
    auth::repo_types::ProviderProfile,
    config::{OAuthClientConfig, ProvidersConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("profile request failed: {0}")]
    Profile(String),
    #[error("provider returned no verified email")]
    NoVerifiedEmail,
}

/// Where to send the browser, plus the secrets to keep until the callback.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub csrf: String,
    pub pkce_verifier: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Path segment and account namespace, e.g. `github`.
    fn id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn authorization_request(&self) -> AuthorizationRequest;
    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<ProviderProfile, ProviderError>;
}

/// OAuth client type with auth URL and token URL set.
type ConfiguredClient = oauth2::Client<
    oauth2::basic::BasicErrorResponse,
    oauth2::basic::BasicTokenResponse,
    oauth2::basic::BasicTokenIntrospectionResponse,
    oauth2::StandardRevocableToken,
    oauth2::basic::BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// Shared code-flow plumbing for the concrete providers.
struct OAuthFlow {
    client: ConfiguredClient,
    http: reqwest::Client,
    scopes: &'static [&'static str],
}

impl OAuthFlow {
    fn new(
        cfg: &OAuthClientConfig,
        auth_url: &str,
        token_url: &str,
        redirect_url: String,
        scopes: &'static [&'static str],
    ) -> anyhow::Result<Self> {
        let client = BasicClient::new(ClientId::new(cfg.client_id.clone()))
            .set_client_secret(ClientSecret::new(cfg.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(auth_url.to_string()).context("auth url")?)
            .set_token_uri(TokenUrl::new(token_url.to_string()).context("token url")?)
            .set_redirect_uri(RedirectUrl::new(redirect_url).context("redirect url")?);

        // No redirects on the token endpoint (oauth2 SSRF guidance).
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("authgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build oauth http client")?;

        Ok(Self {
            client,
            http,
            scopes,
        })
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in self.scopes {
            request = request.add_scope(Scope::new((*scope).to_string()));
        }
        let (url, csrf) = request.set_pkce_challenge(pkce_challenge).url();
        AuthorizationRequest {
            url: url.to_string(),
            csrf: csrf.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        }
    }

    async fn access_token(&self, code: &str, pkce_verifier: &str) -> Result<String, ProviderError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::TokenExchange(e.to_string()))?;
        Ok(token.access_token().secret().clone())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, ProviderError> {
        self.http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProviderError::Profile(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::Profile(e.to_string()))
    }
}

/// Where a provider's authorize, token and profile endpoints live.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl ProviderEndpoints {
    pub fn github() -> Self {
        Self {
            auth_url: "https://github.com/login/oauth/authorize".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
            api_base: "https://api.github.com".into(),
        }
    }

    pub fn google() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            api_base: "https://www.googleapis.com".into(),
        }
    }
}

fn redirect_url(app_url: &str, provider: &str) -> String {
    format!("{app_url}/auth/{provider}/callback")
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    email: Option<String>,
    name: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

pub struct GitHubProvider {
    flow: OAuthFlow,
    api_base: String,
}

impl GitHubProvider {
    pub fn new(cfg: &OAuthClientConfig, app_url: &str) -> anyhow::Result<Self> {
        Self::with_endpoints(cfg, app_url, ProviderEndpoints::github())
    }

    pub fn with_endpoints(
        cfg: &OAuthClientConfig,
        app_url: &str,
        endpoints: ProviderEndpoints,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            flow: OAuthFlow::new(
                cfg,
                &endpoints.auth_url,
                &endpoints.token_url,
                redirect_url(app_url, "github"),
                &["read:user", "user:email"],
            )?,
            api_base: endpoints.api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn id(&self) -> &'static str {
        "github"
    }

    fn display_name(&self) -> &'static str {
        "GitHub"
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        self.flow.authorization_request()
    }

    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<ProviderProfile, ProviderError> {
        let token = self.flow.access_token(code, pkce_verifier).await?;
        let user: GitHubUser = self
            .flow
            .get_json(&format!("{}/user", self.api_base), &token)
            .await?;

        let email = match user.email {
            Some(email) => email,
            None => {
                let emails: Vec<GitHubEmail> = self
                    .flow
                    .get_json(&format!("{}/user/emails", self.api_base), &token)
                    .await?;
                emails
                    .into_iter()
                    .find(|e| e.primary && e.verified)
                    .map(|e| e.email)
                    .ok_or(ProviderError::NoVerifiedEmail)?
            }
        };

        Ok(ProviderProfile {
            provider: self.id().to_string(),
            provider_account_id: user.id.to_string(),
            email: email.trim().to_lowercase(),
            name: user.name.or(Some(user.login)),
            image: user.avatar_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    id: String,
    email: String,
    verified_email: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
}

pub struct GoogleProvider {
    flow: OAuthFlow,
    api_base: String,
}

impl GoogleProvider {
    pub fn new(cfg: &OAuthClientConfig, app_url: &str) -> anyhow::Result<Self> {
        Self::with_endpoints(cfg, app_url, ProviderEndpoints::google())
    }

    pub fn with_endpoints(
        cfg: &OAuthClientConfig,
        app_url: &str,
        endpoints: ProviderEndpoints,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            flow: OAuthFlow::new(
                cfg,
                &endpoints.auth_url,
                &endpoints.token_url,
                redirect_url(app_url, "google"),
                &["openid", "email", "profile"],
            )?,
            api_base: endpoints.api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn id(&self) -> &'static str {
        "google"
    }

    fn display_name(&self) -> &'static str {
        "Google"
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        self.flow.authorization_request()
    }

    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<ProviderProfile, ProviderError> {
        let token = self.flow.access_token(code, pkce_verifier).await?;
        let user: GoogleUser = self
            .flow
            .get_json(&format!("{}/oauth2/v2/userinfo", self.api_base), &token)
            .await?;
        // A missing flag is not a verified address.
        if user.verified_email != Some(true) {
            return Err(ProviderError::NoVerifiedEmail);
        }
        Ok(ProviderProfile {
            provider: self.id().to_string(),
            provider_account_id: user.id,
            email: user.email.trim().to_lowercase(),
            name: user.name,
            image: user.picture,
        })
    }
}

/// Enabled providers by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<&'static str, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(cfg: &ProvidersConfig, app_url: &str) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        if let Some(google) = &cfg.google {
            registry.register(Arc::new(GoogleProvider::new(google, app_url)?));
        }
        if let Some(github) = &cfg.github {
            registry.register(Arc::new(GitHubProvider::new(github, app_url)?));
        }
        info!(providers = ?registry.ids(), "identity providers enabled");
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn IdentityProvider>) {
        self.providers.insert(provider.id(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn IdentityProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn IdentityProvider>> {
        self.providers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_cfg() -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: "client-123".into(),
            client_secret: "shh".into(),
        }
    }

    #[test]
    fn github_authorization_url_carries_pkce_and_state() {
        let provider = GitHubProvider::new(&client_cfg(), "http://localhost:8080").unwrap();
        let req = provider.authorization_request();
        assert!(req.url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(req.url.contains("client_id=client-123"));
        assert!(req.url.contains("code_challenge_method=S256"));
        assert!(req.url.contains(&format!("state={}", req.csrf)));
        assert!(req
            .url
            .contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fauth%2Fgithub%2Fcallback"));
        assert!(!req.pkce_verifier.is_empty());
    }

    #[test]
    fn each_request_gets_fresh_secrets() {
        let provider = GoogleProvider::new(&client_cfg(), "http://localhost:8080").unwrap();
        let a = provider.authorization_request();
        let b = provider.authorization_request();
        assert_ne!(a.csrf, b.csrf);
        assert_ne!(a.pkce_verifier, b.pkce_verifier);
    }

    #[test]
    fn registry_only_holds_configured_providers() {
        let cfg = ProvidersConfig {
            google: None,
            github: Some(client_cfg()),
        };
        let registry = ProviderRegistry::from_config(&cfg, "http://localhost:8080").unwrap();
        assert_eq!(registry.ids(), vec!["github"]);
        assert!(registry.get("google").is_none());
        assert!(registry.get("github").is_some());
    }

    mod exchange {
        use super::*;
        use serde_json::json;
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn endpoints(server: &MockServer) -> ProviderEndpoints {
            ProviderEndpoints {
                auth_url: format!("{}/authorize", server.uri()),
                token_url: format!("{}/token", server.uri()),
                api_base: server.uri(),
            }
        }

        async fn mount_token(server: &MockServer) {
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "access-1",
                    "token_type": "bearer",
                })))
                .mount(server)
                .await;
        }

        async fn mount_json(server: &MockServer, at: &str, body: serde_json::Value) {
            Mock::given(method("GET"))
                .and(path(at))
                .and(header("Authorization", "Bearer access-1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(server)
                .await;
        }

        async fn github(server: &MockServer) -> GitHubProvider {
            mount_token(server).await;
            GitHubProvider::with_endpoints(&client_cfg(), "http://localhost:8080", endpoints(server))
                .unwrap()
        }

        async fn google(server: &MockServer) -> GoogleProvider {
            mount_token(server).await;
            GoogleProvider::with_endpoints(&client_cfg(), "http://localhost:8080", endpoints(server))
                .unwrap()
        }

        #[tokio::test]
        async fn github_public_email_and_name() {
            let server = MockServer::start().await;
            mount_json(
                &server,
                "/user",
                json!({
                    "id": 42,
                    "login": "octo",
                    "email": " Octo@Example.com ",
                    "name": "Octo Cat",
                    "avatar_url": "https://avatars.example/42",
                }),
            )
            .await;

            let profile = github(&server).await.exchange("code", "verifier").await.unwrap();
            assert_eq!(profile.provider, "github");
            assert_eq!(profile.provider_account_id, "42");
            assert_eq!(profile.email, "octo@example.com");
            assert_eq!(profile.name.as_deref(), Some("Octo Cat"));
            assert_eq!(profile.image.as_deref(), Some("https://avatars.example/42"));
        }

        #[tokio::test]
        async fn github_private_email_uses_primary_verified_and_login_as_name() {
            let server = MockServer::start().await;
            mount_json(
                &server,
                "/user",
                json!({ "id": 7, "login": "octo", "email": null, "name": null, "avatar_url": null }),
            )
            .await;
            mount_json(
                &server,
                "/user/emails",
                json!([
                    { "email": "old@example.com", "primary": false, "verified": true },
                    { "email": "Main@Example.com", "primary": true, "verified": true },
                ]),
            )
            .await;

            let profile = github(&server).await.exchange("code", "verifier").await.unwrap();
            assert_eq!(profile.email, "main@example.com");
            assert_eq!(profile.name.as_deref(), Some("octo"));
        }

        #[tokio::test]
        async fn github_without_primary_verified_email_is_rejected() {
            let server = MockServer::start().await;
            mount_json(
                &server,
                "/user",
                json!({ "id": 7, "login": "octo", "email": null, "name": null, "avatar_url": null }),
            )
            .await;
            mount_json(
                &server,
                "/user/emails",
                json!([
                    { "email": "main@example.com", "primary": true, "verified": false },
                    { "email": "side@example.com", "primary": false, "verified": true },
                ]),
            )
            .await;

            let err = github(&server).await.exchange("code", "verifier").await.unwrap_err();
            assert!(matches!(err, ProviderError::NoVerifiedEmail));
        }

        #[tokio::test]
        async fn token_endpoint_error_is_token_exchange() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                    "error": "invalid_grant",
                })))
                .mount(&server)
                .await;
            let provider =
                GitHubProvider::with_endpoints(&client_cfg(), "http://localhost:8080", endpoints(&server))
                    .unwrap();

            let err = provider.exchange("stale", "verifier").await.unwrap_err();
            assert!(matches!(err, ProviderError::TokenExchange(_)));
        }

        #[tokio::test]
        async fn google_verified_profile() {
            let server = MockServer::start().await;
            mount_json(
                &server,
                "/oauth2/v2/userinfo",
                json!({
                    "id": "g-1",
                    "email": "Grace@Example.com",
                    "verified_email": true,
                    "name": "Grace",
                    "picture": null,
                }),
            )
            .await;

            let profile = google(&server).await.exchange("code", "verifier").await.unwrap();
            assert_eq!(profile.provider, "google");
            assert_eq!(profile.provider_account_id, "g-1");
            assert_eq!(profile.email, "grace@example.com");
        }

        #[tokio::test]
        async fn google_unverified_or_unflagged_email_is_rejected() {
            for body in [
                json!({ "id": "g-1", "email": "a@b.io", "verified_email": false }),
                json!({ "id": "g-1", "email": "a@b.io" }),
            ] {
                let server = MockServer::start().await;
                mount_json(&server, "/oauth2/v2/userinfo", body).await;
                let err = google(&server).await.exchange("code", "verifier").await.unwrap_err();
                assert!(matches!(err, ProviderError::NoVerifiedEmail));
            }
        }
    }
}

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub session_ttl_days: i64,
}

impl JwtConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs((self.session_ttl_days.max(1) as u64) * 24 * 60 * 60)
    }
}

/// Which advisory cache backend to talk to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum CacheBackend {
    Upstash { url: String, token: String },
    Redis { url: String },
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub timeout_ms: u64,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            backend: cache_backend_from_env(),
            timeout_ms: env_parse("CACHE_TIMEOUT_MS").unwrap_or(500),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Argon2 cost parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct HashConfig {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        // argon2 crate defaults (OWASP minimum for Argon2id)
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    pub google: Option<OAuthClientConfig>,
    pub github: Option<OAuthClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub app_url: String,
    pub cookie_secure: bool,
    pub jwt: JwtConfig,
    pub cache: CacheConfig,
    pub hash: HashConfig,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "authgate".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "authgate-web".into()),
            session_ttl_days: env_parse("SESSION_TTL_DAYS").unwrap_or(30),
        };
        anyhow::ensure!(!jwt.secret.is_empty(), "JWT_SECRET must not be empty");

        let cache = CacheConfig::from_env();

        let defaults = HashConfig::default();
        let hash = HashConfig {
            m_cost: env_parse("ARGON2_M_COST").unwrap_or(defaults.m_cost),
            t_cost: env_parse("ARGON2_T_COST").unwrap_or(defaults.t_cost),
            p_cost: env_parse("ARGON2_P_COST").unwrap_or(defaults.p_cost),
        };

        let providers = ProvidersConfig {
            google: oauth_client_from_env("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET"),
            github: oauth_client_from_env("GITHUB_ID", "GITHUB_SECRET"),
        };

        Ok(Self {
            database_url,
            app_url: std::env::var("APP_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into())
                .trim_end_matches('/')
                .to_string(),
            cookie_secure: std::env::var("COOKIE_SECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            jwt,
            cache,
            hash,
            providers,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// Upstash wins over a plain Redis URL, matching the production-first order.
fn cache_backend_from_env() -> CacheBackend {
    match (
        non_empty_var("UPSTASH_REDIS_REST_URL"),
        non_empty_var("UPSTASH_REDIS_REST_TOKEN"),
    ) {
        (Some(url), Some(token)) => CacheBackend::Upstash { url, token },
        _ => match non_empty_var("REDIS_URL") {
            Some(url) => CacheBackend::Redis { url },
            None => CacheBackend::Disabled,
        },
    }
}

fn oauth_client_from_env(id_key: &str, secret_key: &str) -> Option<OAuthClientConfig> {
    Some(OAuthClientConfig {
        client_id: non_empty_var(id_key)?,
        client_secret: non_empty_var(secret_key)?,
    })
}

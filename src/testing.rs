//! In-memory stand-ins for the cache, the user store and an identity provider.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::{
    cache::{key_matches, SessionCache},
    providers::{AuthorizationRequest, IdentityProvider, ProviderError},
    repo::UserStore,
    repo_types::{ProviderProfile, User},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remembers values with the TTL they were written with. Never expires them.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Duration)>>,
}

impl MemoryCache {
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        lock(&self.entries).get(key).map(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        lock(&self.entries).insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.entries).get(key).map(|(v, _)| v.clone()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> anyhow::Result<u64> {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|key, _| !key_matches(pattern, key));
        Ok((before - entries.len()) as u64)
    }
}

/// Every call fails, like a store that refuses connections.
pub struct FailingCache;

#[async_trait]
impl SessionCache for FailingCache {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
        Err(anyhow!("connection refused"))
    }

    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Err(anyhow!("connection refused"))
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Err(anyhow!("connection refused"))
    }

    async fn delete_matching(&self, _pattern: &str) -> anyhow::Result<u64> {
        Err(anyhow!("connection refused"))
    }
}

/// Answers eventually, after sleeping for the given delay.
pub struct SlowCache(pub Duration);

#[async_trait]
impl SessionCache for SlowCache {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }

    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        tokio::time::sleep(self.0).await;
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }

    async fn delete_matching(&self, _pattern: &str) -> anyhow::Result<u64> {
        tokio::time::sleep(self.0).await;
        Ok(0)
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<Vec<User>>,
    accounts: Mutex<HashMap<(String, String), Uuid>>,
}

impl MemoryUserStore {
    pub fn len(&self) -> usize {
        lock(&self.users).len()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(lock(&self.users).iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(lock(&self.users).iter().find(|u| u.id == id).cloned())
    }

    async fn create_with_password(
        &self,
        email: &str,
        name: Option<&str>,
        password_hash: &str,
    ) -> anyhow::Result<Option<User>> {
        let mut users = lock(&self.users);
        if users.iter().any(|u| u.email == email) {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.map(str::to_string),
            password_hash: Some(password_hash.to_string()),
            image: None,
            created_at: now,
            updated_at: now,
        };
        users.push(user.clone());
        Ok(Some(user))
    }

    async fn upsert_from_provider(&self, profile: &ProviderProfile) -> anyhow::Result<User> {
        let now = OffsetDateTime::now_utc();
        let account = (profile.provider.clone(), profile.provider_account_id.clone());
        let linked = lock(&self.accounts).get(&account).copied();
        let user = {
            let mut users = lock(&self.users);
            let existing = match linked {
                Some(id) => users.iter_mut().find(|u| u.id == id),
                None => users.iter_mut().find(|u| u.email == profile.email),
            };
            match existing {
                Some(existing) => {
                    if profile.name.is_some() {
                        existing.name = profile.name.clone();
                    }
                    if profile.image.is_some() {
                        existing.image = profile.image.clone();
                    }
                    existing.updated_at = now;
                    existing.clone()
                }
                None => {
                    let user = User {
                        id: Uuid::new_v4(),
                        email: profile.email.clone(),
                        name: profile.name.clone(),
                        password_hash: None,
                        image: profile.image.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    users.push(user.clone());
                    user
                }
            }
        };
        lock(&self.accounts).entry(account).or_insert(user.id);
        Ok(user)
    }
}

/// Accepts the code `code-ok` and nothing else.
pub struct FakeProvider {
    id: &'static str,
    profile: Mutex<ProviderProfile>,
}

pub const FAKE_GOOD_CODE: &str = "code-ok";

impl FakeProvider {
    pub fn github(email: &str, account_id: &str) -> Self {
        Self {
            id: "github",
            profile: Mutex::new(ProviderProfile {
                provider: "github".into(),
                provider_account_id: account_id.into(),
                email: email.into(),
                name: Some("Octo Cat".into()),
                image: None,
            }),
        }
    }

    pub fn profile(&self) -> ProviderProfile {
        lock(&self.profile).clone()
    }

    /// The account changes its email at the provider.
    pub fn set_email(&self, email: &str) {
        lock(&self.profile).email = email.to_string();
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn id(&self) -> &'static str {
        self.id
    }

    fn display_name(&self) -> &'static str {
        "Fake GitHub"
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        let csrf = Uuid::new_v4().simple().to_string();
        AuthorizationRequest {
            url: format!("https://fake.example/authorize?state={csrf}"),
            csrf,
            pkce_verifier: Uuid::new_v4().simple().to_string(),
        }
    }

    async fn exchange(
        &self,
        code: &str,
        _pkce_verifier: &str,
    ) -> Result<ProviderProfile, ProviderError> {
        if code == FAKE_GOOD_CODE {
            Ok(self.profile())
        } else {
            Err(ProviderError::TokenExchange("bad_verification_code".into()))
        }
    }
}

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::repo_types::{ProviderProfile, User};

const USER_COLUMNS: &str = "id, email, name, password_hash, image, created_at, updated_at";

/// Durable user storage. Emails are expected to be normalised by the caller.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn create_with_password(
        &self,
        email: &str,
        name: Option<&str>,
        password_hash: &str,
    ) -> anyhow::Result<Option<User>>;
    /// Resolve the user linked to `(provider, provider_account_id)`, or
    /// insert/refresh the row for `profile.email` and link the account to
    /// it. A returning account keeps its user even if its email changed.
    async fn upsert_from_provider(&self, profile: &ProviderProfile) -> anyhow::Result<User>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create_with_password(
        &self,
        email: &str,
        name: Option<&str>,
        password_hash: &str,
    ) -> anyhow::Result<Option<User>> {
        // `None` when the email is already taken, including a lost race.
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, email, name, password_hash)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(name)
        .bind(password_hash)
        .fetch_optional(&self.db)
        .await
        .context("create user")?;
        Ok(user)
    }

    async fn upsert_from_provider(&self, profile: &ProviderProfile) -> anyhow::Result<User> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let linked = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users SET
                name = COALESCE($3, name),
                image = COALESCE($4, image),
                updated_at = NOW()
            WHERE id = (
                SELECT user_id FROM accounts
                WHERE provider = $1 AND provider_account_id = $2
            )
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&profile.provider)
        .bind(&profile.provider_account_id)
        .bind(&profile.name)
        .bind(&profile.image)
        .fetch_optional(&mut *tx)
        .await
        .context("refresh linked user")?;
        if let Some(user) = linked {
            tx.commit().await.context("commit tx")?;
            return Ok(user);
        }

        // Keep the stored name/image when the provider sends none.
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, email, name, image)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, users.name),
                image = COALESCE(EXCLUDED.image, users.image),
                updated_at = NOW()
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&profile.email)
        .bind(&profile.name)
        .bind(&profile.image)
        .fetch_one(&mut *tx)
        .await
        .context("upsert provider user")?;

        sqlx::query(
            r#"
            INSERT INTO accounts (provider, provider_account_id, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider, provider_account_id) DO NOTHING
            "#,
        )
        .bind(&profile.provider)
        .bind(&profile.provider_account_id)
        .bind(user.id)
        .execute(&mut *tx)
        .await
        .context("link provider account")?;

        tx.commit().await.context("commit tx")?;
        Ok(user)
    }
}

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("connect to database")
}

pub async fn migrate(pool: &PgPool) {
    if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
        tracing::warn!(error = %e, "migration failed; continuing");
    }
}

/// Delete every account link and user. Returns the number of users removed.
pub async fn clear_auth_data(pool: &PgPool) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await.context("begin tx")?;
    sqlx::query("DELETE FROM accounts")
        .execute(&mut *tx)
        .await
        .context("clear accounts")?;
    let users = sqlx::query("DELETE FROM users")
        .execute(&mut *tx)
        .await
        .context("clear users")?
        .rows_affected();
    tx.commit().await.context("commit tx")?;
    Ok(users)
}

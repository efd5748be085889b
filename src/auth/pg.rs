use anyhow::Context;
use async_trait::async_trait;
use sqlx::{types::Json, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::{
    repo::{MagicLinkStore, UserStore},
    repo_types::{MagicLinkToken, User, UserRow},
};

#[derive(Clone)]
pub struct PgMagicLinkStore {
    db: PgPool,
}

impl PgMagicLinkStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MagicLinkStore for PgMagicLinkStore {
    async fn insert(&self, token: MagicLinkToken) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO magic_link_tokens (token, email, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (token) DO UPDATE
                SET email = EXCLUDED.email,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&token.token)
        .bind(&token.email)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.db)
        .await
        .context("insert magic_link_tokens")?;
        Ok(())
    }

    async fn take(&self, token: &str) -> anyhow::Result<Option<MagicLinkToken>> {
        let row = sqlx::query_as::<_, MagicLinkToken>(
            r#"
            DELETE FROM magic_link_tokens
            WHERE token = $1
            RETURNING token, email, created_at, expires_at
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await
        .context("take magic_link_tokens")?;
        Ok(row)
    }

    async fn pending_count(&self) -> anyhow::Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM magic_link_tokens")
            .fetch_one(&self.db)
            .await
            .context("count magic_link_tokens")?;
        Ok(count as usize)
    }
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
    async fn find_or_create(
        &self,
        email: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<(User, bool)> {
        let candidate = User::new_for_email(email, now);
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, email, display_name, preferences, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, email, display_name, preferences, created_at
            "#,
        )
        .bind(candidate.id)
        .bind(&candidate.email)
        .bind(&candidate.display_name)
        .bind(Json(candidate.preferences.clone()))
        .bind(candidate.created_at)
        .fetch_one(&self.db)
        .await
        .context("upsert users")?;

        let created = row.id == candidate.id;
        Ok((row.into(), created))
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, display_name, preferences, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("select users by id")?;
        Ok(row.map(Into::into))
    }
}

/// These need a disposable Postgres: `DATABASE_URL=... cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::postgres::PgPoolOptions;
    use time::{macros::datetime, Duration};

    use super::*;

    async fn pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let db = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .expect("connect to DATABASE_URL");
        crate::state::run_migrations(&db).await.expect("migrations");
        Some(db)
    }

    fn record(token: &str, email: &str) -> MagicLinkToken {
        let now = datetime!(2024-05-01 09:00 UTC);
        MagicLinkToken {
            token: token.into(),
            email: email.into(),
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn take_returns_the_record_once() {
        let Some(db) = pool().await else { return };
        let store = PgMagicLinkStore::new(db);
        let token = format!("once{}", Uuid::new_v4().simple());

        store.insert(record(&token, "once@b.com")).await.unwrap();
        let taken = store.take(&token).await.unwrap().expect("first take");
        assert_eq!(taken.email, "once@b.com");
        assert_eq!(taken.expires_at, datetime!(2024-05-01 09:15 UTC));
        assert!(store.take(&token).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn concurrent_take_has_one_winner() {
        let Some(db) = pool().await else { return };
        let store = Arc::new(PgMagicLinkStore::new(db));
        let token = format!("race{}", Uuid::new_v4().simple());
        store.insert(record(&token, "race@b.com")).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let token = token.clone();
                tokio::spawn(async move { store.take(&token).await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn concurrent_find_or_create_creates_one_user() {
        let Some(db) = pool().await else { return };
        let store = Arc::new(PgUserStore::new(db));
        let email = format!("{}@race.test", Uuid::new_v4().simple());
        let now = datetime!(2024-05-01 09:00 UTC);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let email = email.clone();
                tokio::spawn(async move { store.find_or_create(&email, now).await.unwrap() })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let id = results[0].0.id;
        assert!(results.iter().all(|(user, _)| user.id == id));
        let found = store.find_by_id(id).await.unwrap().expect("stored");
        assert_eq!(found.email, email);
    }
}

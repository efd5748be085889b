use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::repo_types::{MagicLinkToken, User};

/// Pending magic-link tokens.
#[async_trait]
pub trait MagicLinkStore: Send + Sync {
    async fn insert(&self, token: MagicLinkToken) -> anyhow::Result<()>;

    /// Remove and return the record in one step, so a token can only ever be
    /// handed out to a single caller.
    async fn take(&self, token: &str) -> anyhow::Result<Option<MagicLinkToken>>;

    async fn pending_count(&self) -> anyhow::Result<usize>;
}

/// Registered users, unique by email.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Return the user for `email`, creating it if needed. The bool is `true`
    /// when this call created the record.
    async fn find_or_create(
        &self,
        email: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<(User, bool)>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
}

#[derive(Default)]
pub struct InMemoryMagicLinkStore {
    tokens: Mutex<HashMap<String, MagicLinkToken>>,
}

impl InMemoryMagicLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MagicLinkStore for InMemoryMagicLinkStore {
    async fn insert(&self, token: MagicLinkToken) -> anyhow::Result<()> {
        self.tokens.lock().await.insert(token.token.clone(), token);
        Ok(())
    }

    async fn take(&self, token: &str) -> anyhow::Result<Option<MagicLinkToken>> {
        Ok(self.tokens.lock().await.remove(token))
    }

    async fn pending_count(&self) -> anyhow::Result<usize> {
        Ok(self.tokens.lock().await.len())
    }
}

#[derive(Default)]
pub struct InMemoryUserStore {
    by_email: Mutex<HashMap<String, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.by_email.lock().await.len()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_or_create(
        &self,
        email: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<(User, bool)> {
        let mut users = self.by_email.lock().await;
        if let Some(existing) = users.get(email) {
            return Ok((existing.clone(), false));
        }
        let user = User::new_for_email(email, now);
        users.insert(email.to_string(), user.clone());
        Ok((user, true))
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let users = self.by_email.lock().await;
        Ok(users.values().find(|u| u.id == id).cloned())
    }
}

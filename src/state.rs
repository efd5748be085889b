use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use crate::auth::jwt::BearerKeys;
use crate::auth::pg::{PgMagicLinkStore, PgUserStore};
use crate::auth::repo::{InMemoryMagicLinkStore, InMemoryUserStore, MagicLinkStore, UserStore};
use crate::auth::services::{MagicLinkService, MagicLinkSettings};
use crate::clock::SystemClock;
use crate::config::AppConfig;
use crate::email::sender_from_config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<MagicLinkService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let (tokens, users): (Arc<dyn MagicLinkStore>, Arc<dyn UserStore>) =
            match &config.database_url {
                Some(url) => {
                    let db = sqlx::postgres::PgPoolOptions::new()
                        .max_connections(10)
                        .connect(url)
                        .await
                        .context("connect to database")?;
                    run_migrations(&db).await?;
                    tracing::info!("using postgres token and user stores");
                    (
                        Arc::new(PgMagicLinkStore::new(db.clone())) as Arc<dyn MagicLinkStore>,
                        Arc::new(PgUserStore::new(db)) as Arc<dyn UserStore>,
                    )
                }
                None => {
                    tracing::info!("DATABASE_URL not set; using in-memory stores");
                    (
                        Arc::new(InMemoryMagicLinkStore::new()) as Arc<dyn MagicLinkStore>,
                        Arc::new(InMemoryUserStore::new()) as Arc<dyn UserStore>,
                    )
                }
            };

        let sender = sender_from_config(
            &config.email,
            config.magic_link.ttl_minutes,
            config.is_development(),
        );
        let auth = Arc::new(MagicLinkService::new(
            tokens,
            users,
            sender,
            BearerKeys::from_config(&config.jwt),
            Arc::new(SystemClock),
            MagicLinkSettings::from_config(&config),
        ));

        Ok(Self { config, auth })
    }

    /// In-memory state for tests, with time under the caller's control.
    #[cfg(test)]
    pub fn fake_with_clock(clock: Arc<dyn crate::clock::Clock>) -> Self {
        let config = Arc::new(AppConfig::for_tests());
        let auth = Arc::new(MagicLinkService::new(
            Arc::new(InMemoryMagicLinkStore::new()),
            Arc::new(InMemoryUserStore::new()),
            Arc::new(crate::email::LogSender::new(true)),
            BearerKeys::from_config(&config.jwt),
            clock,
            MagicLinkSettings::from_config(&config),
        ));
        Self { config, auth }
    }
}

/// Applies `./migrations`. A failure stops startup.
pub async fn run_migrations(db: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("run database migrations")?;
    tracing::info!("database migrations applied");
    Ok(())
}

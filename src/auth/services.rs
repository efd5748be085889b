use std::sync::Arc;

use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use time::Duration;
use tracing::{debug, info, warn};

use crate::{
    auth::{
        error::AuthError,
        jwt::BearerKeys,
        repo::{MagicLinkStore, UserStore},
        repo_types::{MagicLinkToken, User},
    },
    clock::Clock,
    config::AppConfig,
    email::MagicLinkSender,
};

const TOKEN_LEN: usize = 32;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn redact(token: &str) -> &str {
    token.get(..6).unwrap_or(token)
}

#[derive(Debug, Clone)]
pub struct MagicLinkSettings {
    pub ttl: Duration,
    pub base_url: String,
    /// Reject addresses that don't look like `local@domain.tld`.
    pub strict_email: bool,
}

impl MagicLinkSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            ttl: Duration::minutes(cfg.magic_link.ttl_minutes),
            base_url: cfg.magic_link.base_url.clone(),
            strict_email: !cfg.is_development(),
        }
    }
}

/// A freshly issued link. Only surfaced to HTTP callers in development.
#[derive(Debug, Clone)]
pub struct IssuedLink {
    pub token: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Redeemed {
    pub user: User,
    pub bearer_token: String,
}

/// Issues, redeems and validates login credentials. Owns nothing global:
/// stores, delivery and time all come in through the constructor.
pub struct MagicLinkService {
    tokens: Arc<dyn MagicLinkStore>,
    users: Arc<dyn UserStore>,
    sender: Arc<dyn MagicLinkSender>,
    keys: BearerKeys,
    clock: Arc<dyn Clock>,
    settings: MagicLinkSettings,
}

impl MagicLinkService {
    pub fn new(
        tokens: Arc<dyn MagicLinkStore>,
        users: Arc<dyn UserStore>,
        sender: Arc<dyn MagicLinkSender>,
        keys: BearerKeys,
        clock: Arc<dyn Clock>,
        settings: MagicLinkSettings,
    ) -> Self {
        Self {
            tokens,
            users,
            sender,
            keys,
            clock,
            settings,
        }
    }

    pub fn magic_link_url(&self, token: &str) -> String {
        format!("{}/api/auth/verify?token={}", self.settings.base_url, token)
    }

    pub async fn request_magic_link(&self, email: &str) -> Result<IssuedLink, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AuthError::MissingEmail);
        }
        if self.settings.strict_email && !is_valid_email(&email) {
            warn!(%email, "invalid email");
            return Err(AuthError::InvalidEmail);
        }

        let now = self.clock.now();
        let record = MagicLinkToken {
            token: generate_token(),
            email: email.clone(),
            created_at: now,
            expires_at: now
                .checked_add(self.settings.ttl)
                .ok_or_else(|| anyhow::anyhow!("magic link ttl overflows the clock"))?,
        };
        let issued = IssuedLink {
            url: self.magic_link_url(&record.token),
            token: record.token.clone(),
        };
        self.tokens.insert(record).await?;
        info!(%email, token = redact(&issued.token), "magic link issued");

        let sender = self.sender.clone();
        let url = issued.url.clone();
        tokio::spawn(async move {
            if let Err(e) = sender.send(&email, &url).await {
                warn!(error = %e, %email, "magic link delivery failed");
            }
        });

        Ok(issued)
    }

    pub async fn redeem_magic_link(&self, token: &str) -> Result<Redeemed, AuthError> {
        let record = match self.tokens.take(token).await? {
            Some(r) => r,
            None => {
                warn!(token = redact(token), "unknown or already used magic link");
                return Err(AuthError::InvalidToken);
            }
        };

        let now = self.clock.now();
        if record.is_expired(now) {
            warn!(email = %record.email, "magic link expired");
            return Err(AuthError::TokenExpired);
        }

        let (user, created) = self.users.find_or_create(&record.email, now).await?;
        if created {
            info!(user_id = %user.id, email = %user.email, "user created");
        }

        let bearer_token = self.keys.sign(user.id, &user.email, now)?;
        info!(user_id = %user.id, email = %user.email, "magic link redeemed");
        Ok(Redeemed { user, bearer_token })
    }

    /// Never errors: anything malformed, forged or stale is just `false`.
    pub fn validate_bearer_token(&self, token: &str) -> bool {
        match self.keys.decode(token) {
            Ok(claims) => self.keys.is_fresh(&claims, self.clock.now()),
            Err(e) => {
                debug!(error = %e, "bearer token rejected");
                false
            }
        }
    }

    pub async fn current_user(&self, token: &str) -> Result<User, AuthError> {
        let claims = self
            .keys
            .decode(token)
            .map_err(|_| AuthError::TokenInvalidOrExpired)?;
        if !self.keys.is_fresh(&claims, self.clock.now()) {
            return Err(AuthError::TokenInvalidOrExpired);
        }
        self.users
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::TokenInvalidOrExpired)
    }

    pub async fn pending_count(&self) -> Result<usize, AuthError> {
        Ok(self.tokens.pending_count().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::repo::{InMemoryMagicLinkStore, InMemoryUserStore},
        clock::ManualClock,
        config::JwtConfig,
        email::{DeliveryError, LogSender},
    };
    use async_trait::async_trait;
    use time::macros::datetime;
    use tokio::sync::mpsc;

    struct Harness {
        service: Arc<MagicLinkService>,
        clock: Arc<ManualClock>,
        users: Arc<InMemoryUserStore>,
    }

    fn keys() -> BearerKeys {
        BearerKeys::from_config(&JwtConfig {
            secret: "test-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            ttl_hours: 24,
        })
    }

    fn settings(strict_email: bool) -> MagicLinkSettings {
        MagicLinkSettings {
            ttl: Duration::minutes(15),
            base_url: "http://localhost:8080".into(),
            strict_email,
        }
    }

    fn harness_with(sender: Arc<dyn MagicLinkSender>, strict_email: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 09:00 UTC)));
        let users = Arc::new(InMemoryUserStore::new());
        let service = Arc::new(MagicLinkService::new(
            Arc::new(InMemoryMagicLinkStore::new()),
            users.clone(),
            sender,
            keys(),
            clock.clone(),
            settings(strict_email),
        ));
        Harness {
            service,
            clock,
            users,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(LogSender::default()), false)
    }

    struct ChannelSender(mpsc::UnboundedSender<(String, String)>);

    #[async_trait]
    impl MagicLinkSender for ChannelSender {
        async fn send(&self, email: &str, url: &str) -> Result<(), DeliveryError> {
            let _ = self.0.send((email.to_string(), url.to_string()));
            Ok(())
        }
    }

    struct FailingSender;

    #[async_trait]
    impl MagicLinkSender for FailingSender {
        async fn send(&self, _email: &str, _url: &str) -> Result<(), DeliveryError> {
            Err(DeliveryError::Send("smtp down".into()))
        }
    }

    #[test]
    fn email_regex_accepts_plain_addresses() {
        assert!(is_valid_email("a@b.com"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("not an email"));
    }

    #[test]
    fn generated_tokens_are_unique_alphanumeric() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_email_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.service.request_magic_link("").await,
            Err(AuthError::MissingEmail)
        ));
        assert!(matches!(
            h.service.request_magic_link("   ").await,
            Err(AuthError::MissingEmail)
        ));
        assert_eq!(h.service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lenient_mode_accepts_any_non_empty_email() {
        let h = harness();
        h.service.request_magic_link("not-an-email").await.unwrap();
        assert_eq!(h.service.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn strict_mode_rejects_malformed_email() {
        let h = harness_with(Arc::new(LogSender::default()), true);
        assert!(matches!(
            h.service.request_magic_link("not-an-email").await,
            Err(AuthError::InvalidEmail)
        ));
        h.service.request_magic_link("a@b.com").await.unwrap();
    }

    #[tokio::test]
    async fn link_is_delivered_to_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = harness_with(Arc::new(ChannelSender(tx)), false);
        let issued = h.service.request_magic_link(" A@B.com ").await.unwrap();

        let (email, url) = rx.recv().await.expect("delivered");
        assert_eq!(email, "a@b.com");
        assert_eq!(url, issued.url);
        assert_eq!(
            url,
            format!("http://localhost:8080/api/auth/verify?token={}", issued.token)
        );
    }

    #[tokio::test]
    async fn delivery_failure_does_not_fail_request() {
        let h = harness_with(Arc::new(FailingSender), false);
        let issued = h.service.request_magic_link("a@b.com").await.unwrap();
        h.service.redeem_magic_link(&issued.token).await.unwrap();
    }

    #[tokio::test]
    async fn redeem_creates_user_with_defaults_and_is_single_use() {
        let h = harness();
        let issued = h.service.request_magic_link("a@b.com").await.unwrap();
        h.clock.advance(Duration::minutes(1));

        let redeemed = h.service.redeem_magic_link(&issued.token).await.unwrap();
        assert_eq!(redeemed.user.email, "a@b.com");
        assert_eq!(redeemed.user.display_name, "a");
        assert_eq!(redeemed.user.preferences.theme, "system");
        assert!(h.service.validate_bearer_token(&redeemed.bearer_token));

        assert!(matches!(
            h.service.redeem_magic_link(&issued.token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let h = harness();
        assert!(matches!(
            h.service.redeem_magic_link("nope").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_removed_on_discovery() {
        let h = harness();
        let before = h.service.pending_count().await.unwrap();
        let issued = h.service.request_magic_link("a@b.com").await.unwrap();
        h.clock.advance(Duration::minutes(16));

        assert!(matches!(
            h.service.redeem_magic_link(&issued.token).await,
            Err(AuthError::TokenExpired)
        ));
        assert_eq!(h.service.pending_count().await.unwrap(), before);
        assert_eq!(h.users.len().await, 0);

        assert!(matches!(
            h.service.redeem_magic_link(&issued.token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn token_is_still_good_at_exact_expiry() {
        let h = harness();
        let issued = h.service.request_magic_link("a@b.com").await.unwrap();
        h.clock.advance(Duration::minutes(15));
        h.service.redeem_magic_link(&issued.token).await.unwrap();
    }

    #[tokio::test]
    async fn returning_user_keeps_identity() {
        let h = harness();
        let first = h.service.request_magic_link("a@b.com").await.unwrap();
        let first = h.service.redeem_magic_link(&first.token).await.unwrap();
        let second = h.service.request_magic_link("A@b.com").await.unwrap();
        let second = h.service.redeem_magic_link(&second.token).await.unwrap();
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(h.users.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemption_succeeds_once() {
        let h = harness();
        let issued = h.service.request_magic_link("race@b.com").await.unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let service = h.service.clone();
                let token = issued.token.clone();
                tokio::spawn(async move { service.redeem_magic_link(&token).await })
            })
            .collect();

        let mut ok = 0;
        let mut invalid = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AuthError::InvalidToken) => invalid += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(invalid, 1);
        assert_eq!(h.users.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tokens_for_same_email_share_one_user() {
        let h = harness();
        let mut tokens = Vec::new();
        for _ in 0..8 {
            tokens.push(h.service.request_magic_link("same@b.com").await.unwrap().token);
        }
        let handles: Vec<_> = tokens
            .into_iter()
            .map(|token| {
                let service = h.service.clone();
                tokio::spawn(async move { service.redeem_magic_link(&token).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().user.id);
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.users.len().await, 1);
    }

    #[tokio::test]
    async fn bearer_token_lapses_after_24_hours() {
        let h = harness();
        let issued = h.service.request_magic_link("a@b.com").await.unwrap();
        let redeemed = h.service.redeem_magic_link(&issued.token).await.unwrap();

        h.clock.advance(Duration::hours(24) - Duration::milliseconds(1));
        assert!(h.service.validate_bearer_token(&redeemed.bearer_token));

        h.clock.advance(Duration::milliseconds(2));
        assert!(!h.service.validate_bearer_token(&redeemed.bearer_token));
    }

    #[tokio::test]
    async fn malformed_bearer_tokens_are_invalid() {
        let h = harness();
        assert!(!h.service.validate_bearer_token(""));
        assert!(!h.service.validate_bearer_token("session_notanumber_xyz"));
        assert!(!h.service.validate_bearer_token("a.b.c"));
    }

    #[tokio::test]
    async fn current_user_resolves_bearer_token() {
        let h = harness();
        let issued = h.service.request_magic_link("me@b.com").await.unwrap();
        let redeemed = h.service.redeem_magic_link(&issued.token).await.unwrap();

        let me = h.service.current_user(&redeemed.bearer_token).await.unwrap();
        assert_eq!(me, redeemed.user);

        h.clock.advance(Duration::hours(25));
        assert!(matches!(
            h.service.current_user(&redeemed.bearer_token).await,
            Err(AuthError::TokenInvalidOrExpired)
        ));
    }
}

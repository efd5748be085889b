use std::ops::RangeInclusive;

use anyhow::Context;
use serde::Deserialize;

const DEV_JWT_SECRET: &str = "focusflow-dev-secret";

/// Up to one year.
const BEARER_TTL_HOURS: RangeInclusive<i64> = 1..=8_760;
/// Up to one day.
const MAGIC_LINK_TTL_MINUTES: RangeInclusive<i64> = 1..=1_440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => anyhow::bail!("unknown APP_ENV {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MagicLinkConfig {
    pub ttl_minutes: i64,
    pub base_url: String,
    /// Return the raw token and link from `POST /api/auth/magic-link`.
    pub expose_dev_token: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub magic_link: MagicLinkConfig,
    pub email: EmailConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = match std::env::var("APP_ENV") {
            Ok(v) => Environment::parse(&v)?,
            Err(_) => Environment::Development,
        };

        let secret = match (std::env::var("JWT_SECRET"), environment) {
            (Ok(s), _) if !s.is_empty() => s,
            (_, Environment::Production) => {
                anyhow::bail!("JWT_SECRET must be set when APP_ENV=production")
            }
            (_, Environment::Development) => {
                tracing::warn!("JWT_SECRET not set; using the development secret");
                DEV_JWT_SECRET.into()
            }
        };

        let jwt = JwtConfig {
            secret,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "focusflow".into()),
            audience: std::env::var("JWT_AUDIENCE")
                .unwrap_or_else(|_| "focusflow-extension".into()),
            ttl_hours: parse_in_range("BEARER_TTL_HOURS", 24, BEARER_TTL_HOURS)?,
        };

        let magic_link = MagicLinkConfig {
            ttl_minutes: parse_in_range("MAGIC_LINK_TTL_MINUTES", 15, MAGIC_LINK_TTL_MINUTES)?,
            base_url: std::env::var("MAGIC_LINK_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into())
                .trim_end_matches('/')
                .to_string(),
            expose_dev_token: std::env::var("EXPOSE_DEV_TOKEN")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(environment == Environment::Development),
        };

        let email = EmailConfig {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "FocusFlow <noreply@focusflow.dev>".into()),
        };

        Ok(Self {
            environment,
            database_url: std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            jwt,
            magic_link,
            email,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            environment: Environment::Development,
            database_url: None,
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_hours: 24,
            },
            magic_link: MagicLinkConfig {
                ttl_minutes: 15,
                base_url: "http://localhost:8080".into(),
                expose_dev_token: true,
            },
            email: EmailConfig {
                resend_api_key: None,
                from: "FocusFlow <noreply@focusflow.dev>".into(),
            },
        }
    }
}

fn parse_in_range(key: &str, default: i64, range: RangeInclusive<i64>) -> anyhow::Result<i64> {
    match std::env::var(key) {
        Ok(v) => check_range(key, &v, range),
        Err(_) => Ok(default),
    }
}

fn check_range(key: &str, raw: &str, range: RangeInclusive<i64>) -> anyhow::Result<i64> {
    let value = raw
        .trim()
        .parse::<i64>()
        .with_context(|| format!("{key} must be an integer"))?;
    if !range.contains(&value) {
        anyhow::bail!(
            "{key}={value} is out of range ({}..={})",
            range.start(),
            range.end()
        );
    }
    Ok(value)
}

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{clock::unix_millis, config::JwtConfig};

/// Bearer token payload. `iat_ms` is the authoritative issue time; the
/// validity window is measured from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,       // user ID
    pub email: String,   // bound address
    pub iat_ms: i64,     // issued at (unix millis)
    pub exp: i64,        // expires at (unix seconds, informational)
    pub iss: String,     // issuer
    pub aud: String,     // audience
}

/// HS256 keys plus issuer/audience and the bearer validity window.
#[derive(Clone)]
pub struct BearerKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

impl BearerKeys {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::hours(cfg.ttl_hours),
        }
    }

    pub fn sign(&self, user_id: Uuid, email: &str, now: OffsetDateTime) -> anyhow::Result<String> {
        let expires_at = now
            .checked_add(self.ttl)
            .ok_or_else(|| anyhow::anyhow!("bearer ttl {} overflows the clock", self.ttl))?;
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iat_ms: unix_millis(now),
            exp: expires_at.unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user_id, "bearer token signed");
        Ok(token)
    }

    /// Checks signature, issuer and audience only. Freshness is judged
    /// against the injected clock by [`BearerKeys::is_fresh`].
    pub fn decode(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }

    pub fn is_fresh(&self, claims: &Claims, now: OffsetDateTime) -> bool {
        let ttl_ms = i64::try_from(self.ttl.whole_milliseconds()).unwrap_or(i64::MAX);
        unix_millis(now).saturating_sub(claims.iat_ms) < ttl_ms
    }
}

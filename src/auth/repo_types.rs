use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

/// Pending one-time login token.
#[derive(Clone, FromRow)]
pub struct MagicLinkToken {
    pub token: String,
    pub email: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl MagicLinkToken {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

impl std::fmt::Debug for MagicLinkToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagicLinkToken")
            .field("token", &"[REDACTED]")
            .field("email", &self.email)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrations {
    pub google_calendar: bool,
    pub notion: bool,
    pub todoist: bool,
}

/// Extension settings, seeded once when the user is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub theme: String,
    pub primary_color: String,
    pub accent_color: String,
    pub focus_minutes: u32,
    pub short_break_minutes: u32,
    pub long_break_minutes: u32,
    pub sessions_before_long_break: u32,
    pub notifications_enabled: bool,
    pub sound_enabled: bool,
    pub auto_start_breaks: bool,
    pub integrations: Integrations,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: "system".into(),
            primary_color: "#6366f1".into(),
            accent_color: "#f59e0b".into(),
            focus_minutes: 25,
            short_break_minutes: 5,
            long_break_minutes: 15,
            sessions_before_long_break: 4,
            notifications_enabled: true,
            sound_enabled: true,
            auto_start_breaks: false,
            integrations: Integrations {
                google_calendar: false,
                notion: false,
                todoist: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub preferences: Preferences,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// Fresh record for an email that has never logged in.
    pub fn new_for_email(email: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: display_name_for(email),
            preferences: Preferences::default(),
            created_at: now,
        }
    }
}

/// Local part of the address, or the whole string when there is no `@`.
pub fn display_name_for(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

/// `users` row as stored in Postgres.
#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub preferences: Json<Preferences>,
    pub created_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            id: r.id,
            email: r.email,
            display_name: r.display_name,
            preferences: r.preferences.0,
            created_at: r.created_at,
        }
    }
}

use crate::caption;
use crate::config;
use crate::error::ConfigurationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a pairing a session authenticates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccountRole {
    Source,
    Destination,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Source => "source",
            AccountRole::Destination => "destination",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(AccountRole::Source),
            "destination" => Some(AccountRole::Destination),
            _ => None,
        }
    }
}

/// Login credentials as collected by the front end. Never persisted.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Per-user proxy URL; overrides `instagram.proxy` for this user's calls.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Opaque authenticated state for one account role.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub account: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub valid: bool,
    /// Proxy the session was created through. Later calls reuse it.
    pub proxy: Option<String>,
}

impl Session {
    pub fn new(account: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            token: token.into(),
            expires_at: None,
            valid: true,
            proxy: None,
        }
    }

    /// A session is usable while it is flagged valid and not past its expiry.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.valid && self.expires_at.map_or(true, |exp| exp > now)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("expires_at", &self.expires_at)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", content = "template", rename_all = "snake_case")]
pub enum CaptionMode {
    Original,
    Template(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashtagPolicy {
    Keep,
    Strip,
}

/// Which media kinds a pairing forwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentFilter {
    pub reels: bool,
    pub photos: bool,
    pub carousels: bool,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self {
            reels: true,
            photos: true,
            carousels: true,
        }
    }
}

impl ContentFilter {
    pub fn allows(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Photo => self.photos,
            MediaKind::Video => self.reels,
            MediaKind::Carousel => self.carousels,
        }
    }
}

/// Per-pairing customization. Always validated before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingOptions {
    pub caption: CaptionMode,
    pub hashtags: HashtagPolicy,
    pub content: ContentFilter,
    pub interval_minutes: u32,
}

impl PairingOptions {
    pub fn with_defaults(policy: &config::Scheduler) -> Self {
        Self {
            caption: CaptionMode::Original,
            hashtags: HashtagPolicy::Keep,
            content: ContentFilter::default(),
            interval_minutes: policy.default_interval_minutes,
        }
    }

    pub fn validate(&self, policy: &config::Scheduler) -> Result<(), ConfigurationError> {
        let (min, max) = (policy.min_interval_minutes, policy.max_interval_minutes);
        if self.interval_minutes < min || self.interval_minutes > max {
            return Err(ConfigurationError::IntervalOutOfRange {
                got: self.interval_minutes,
                min,
                max,
            });
        }
        if !(self.content.reels || self.content.photos || self.content.carousels) {
            return Err(ConfigurationError::NoContentTypes);
        }
        if let CaptionMode::Template(template) = &self.caption {
            caption::validate_template(template)?;
        }
        Ok(())
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.interval_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

/// A (source, destination) pairing together with the owning user's flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pairing {
    pub id: i64,
    pub user_id: i64,
    pub tg_user_id: i64,
    pub source_account: String,
    pub destination_account: String,
    pub options: PairingOptions,
    pub paused: bool,
    pub auth_suspended: bool,
    pub user_paused: bool,
}

impl Pairing {
    /// Whether the scheduler should hold a job for this pairing.
    pub fn is_schedulable(&self) -> bool {
        !self.paused && !self.auth_suspended && !self.user_paused
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Carousel,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Carousel => "carousel",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    AuthSuspended,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "SUCCESS",
            RunOutcome::Failed => "FAILED",
            RunOutcome::AuthSuspended => "AUTH_SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(RunOutcome::Success),
            "FAILED" => Some(RunOutcome::Failed),
            "AUTH_SUSPENDED" => Some(RunOutcome::AuthSuspended),
            _ => None,
        }
    }
}

/// Result of one job run, kept in memory and mirrored onto the pairing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub published: u32,
    pub skipped: u32,
    pub error: Option<String>,
}

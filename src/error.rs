//! Error taxonomy shared by the fetcher, executor, scheduler and service.
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by platform calls. The scheduler turns each of these into
/// a job state transition; none of them escapes a job run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Session or credentials rejected. Requires a human re-login.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout or unexpected server response.
    #[error("transient platform error: {0}")]
    Transient(String),

    /// The item cannot be republished on the destination surface.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

/// Invalid pairing options, rejected before they reach the scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("posting interval {got} min outside allowed range {min}..={max} min")]
    IntervalOutOfRange { got: u32, min: u32, max: u32 },

    #[error("at least one content type must be enabled")]
    NoContentTypes,

    #[error("caption template must not be empty")]
    EmptyTemplate,

    #[error("unknown caption placeholder {{{0}}}")]
    UnknownPlaceholder(String),

    #[error("account name must not be empty")]
    EmptyAccount,

    #[error("source and destination must differ")]
    SameAccount,

    #[error("proxy must be an http(s) URL with a host")]
    InvalidProxy,
}

/// Errors returned by the inbound interface.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("pairing {0} not found")]
    PairingNotFound(i64),

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("pairing already exists for {source_account} -> {destination_account}")]
    DuplicatePairing {
        source_account: String,
        destination_account: String,
    },

    #[error("login failed: {0}")]
    Login(PlatformError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

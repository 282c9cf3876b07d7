use crate::model::MediaKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Video,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Image => "photo",
            ResourceKind::Video => "video",
        }
    }
}

/// One downloadable file of a media item. Carousels carry several, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaResource {
    pub kind: ResourceKind,
    pub url: String,
}

/// A post as listed on a source account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaItem {
    pub id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub caption: Option<String>,
    pub taken_at: DateTime<Utc>,
    /// Set for ephemeral content that disappears from the source.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: Vec<MediaResource>,
}

/// A downloaded resource ready to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    pub kind: ResourceKind,
    pub data: Vec<u8>,
}

/// Successful login grant.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub session_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct MediaListResponse {
    pub items: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureResponse {
    pub media_id: String,
}

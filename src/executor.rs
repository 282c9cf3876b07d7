//! Repost Executor: download a source item and publish it to a destination.
//!
//! The executor does not deduplicate. Callers gate it with the ledger.
use crate::caption;
use crate::error::PlatformError;
use crate::instagram::model::{MediaItem, ResourceKind, UploadPart};
use crate::instagram::InstagramService;
use crate::model::{MediaKind, PairingOptions, Session};
use crate::retry::{with_retries, RetryPolicy};
use std::sync::Arc;
use tracing::{info, instrument};

/// Largest carousel the destination accepts.
pub const MAX_CAROUSEL_ITEMS: usize = 10;

#[derive(Clone)]
pub struct RepostExecutor {
    api: Arc<dyn InstagramService>,
    retry: RetryPolicy,
}

impl RepostExecutor {
    pub fn new(api: Arc<dyn InstagramService>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Publish `item` to `destination`. Returns the new media id when the
    /// platform reports one.
    ///
    /// Downloads and part uploads are retried on transient errors. The final
    /// configure call is sent once; if it fails the item stays unmarked and
    /// a later run tries it again.
    #[instrument(skip(self, session, item, options), fields(media_id = %item.id, kind = item.kind.as_str()))]
    pub async fn publish(
        &self,
        session: &Session,
        destination: &str,
        item: &MediaItem,
        options: &PairingOptions,
        source_account: &str,
    ) -> Result<Option<String>, PlatformError> {
        check_publishable(item)?;

        let api = self.api.as_ref();
        let mut upload_ids = Vec::with_capacity(item.resources.len());
        for resource in &item.resources {
            let data = with_retries(self.retry, "download", move || {
                api.download(session, resource)
            })
            .await?;
            let part = UploadPart {
                kind: resource.kind,
                data,
            };
            let part = &part;
            let upload_id = with_retries(self.retry, "upload_part", move || {
                api.upload_part(session, part)
            })
            .await?;
            upload_ids.push(upload_id);
        }

        let caption = caption::render(options, item, source_account);
        let media_id = api
            .configure(session, destination, item.kind, &upload_ids, &caption)
            .await?;
        info!(destination, new_media_id = ?media_id, "published");
        Ok(media_id)
    }
}

/// Reject items the destination surface cannot take before any download.
pub fn check_publishable(item: &MediaItem) -> Result<(), PlatformError> {
    if item.expires_at.is_some() {
        return Err(PlatformError::UnsupportedMedia(format!(
            "{} is ephemeral content",
            item.id
        )));
    }
    if item.resources.is_empty() {
        return Err(PlatformError::UnsupportedMedia(format!(
            "{} has no downloadable resources",
            item.id
        )));
    }
    let expected = match item.kind {
        MediaKind::Photo => Some(ResourceKind::Image),
        MediaKind::Video => Some(ResourceKind::Video),
        MediaKind::Carousel => None,
    };
    match expected {
        Some(kind) => {
            if item.resources.len() != 1 || item.resources[0].kind != kind {
                return Err(PlatformError::UnsupportedMedia(format!(
                    "{} {} does not carry exactly one {} resource",
                    item.kind.as_str(),
                    item.id,
                    kind.as_str()
                )));
            }
        }
        None => {
            if item.resources.len() > MAX_CAROUSEL_ITEMS {
                return Err(PlatformError::UnsupportedMedia(format!(
                    "carousel {} has {} items, limit is {}",
                    item.id,
                    item.resources.len(),
                    MAX_CAROUSEL_ITEMS
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instagram::model::MediaResource;
    use chrono::Utc;

    fn resource(kind: ResourceKind, n: usize) -> MediaResource {
        MediaResource {
            kind,
            url: format!("https://cdn/{}", n),
        }
    }

    fn item(kind: MediaKind, resources: Vec<MediaResource>) -> MediaItem {
        MediaItem {
            id: "m".into(),
            kind,
            caption: None,
            taken_at: Utc::now(),
            expires_at: None,
            resources,
        }
    }

    #[test]
    fn accepts_regular_posts() {
        assert!(check_publishable(&item(MediaKind::Photo, vec![resource(ResourceKind::Image, 1)])).is_ok());
        assert!(check_publishable(&item(MediaKind::Video, vec![resource(ResourceKind::Video, 1)])).is_ok());
        let mixed = vec![
            resource(ResourceKind::Image, 1),
            resource(ResourceKind::Video, 2),
        ];
        assert!(check_publishable(&item(MediaKind::Carousel, mixed)).is_ok());
    }

    #[test]
    fn rejects_ephemeral_and_malformed_items() {
        let mut story = item(MediaKind::Photo, vec![resource(ResourceKind::Image, 1)]);
        story.expires_at = Some(Utc::now());
        assert!(matches!(check_publishable(&story), Err(PlatformError::UnsupportedMedia(_))));

        let empty = item(MediaKind::Photo, vec![]);
        assert!(matches!(check_publishable(&empty), Err(PlatformError::UnsupportedMedia(_))));

        let wrong = item(MediaKind::Video, vec![resource(ResourceKind::Image, 1)]);
        assert!(matches!(check_publishable(&wrong), Err(PlatformError::UnsupportedMedia(_))));

        let huge = item(
            MediaKind::Carousel,
            (0..=MAX_CAROUSEL_ITEMS).map(|n| resource(ResourceKind::Image, n)).collect(),
        );
        assert!(matches!(check_publishable(&huge), Err(PlatformError::UnsupportedMedia(_))));
    }
}

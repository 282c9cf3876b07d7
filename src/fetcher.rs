//! Fetcher: recent media of a source account.
use crate::error::PlatformError;
use crate::instagram::model::MediaItem;
use crate::instagram::InstagramService;
use crate::model::Session;
use crate::retry::{with_retries, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct Fetcher {
    api: Arc<dyn InstagramService>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(api: Arc<dyn InstagramService>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Up to `limit` recent items of `source_account`, newest first.
    ///
    /// Only `Auth`, `RateLimited` and `Transient` come back from here; an
    /// unavailable source account is reported as transient.
    #[instrument(skip(self, session))]
    pub async fn list_recent(
        &self,
        session: &Session,
        source_account: &str,
        limit: usize,
    ) -> Result<Vec<MediaItem>, PlatformError> {
        let api = self.api.as_ref();
        let mut items = with_retries(self.retry, "list_recent", move || {
            api.list_recent(session, source_account, limit)
        })
        .await
        .map_err(|err| match err {
            PlatformError::UnsupportedMedia(msg) => {
                PlatformError::Transient(format!("source account unavailable: {}", msg))
            }
            other => other,
        })?;
        items.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        items.truncate(limit);
        debug!(count = items.len(), "fetched recent media");
        Ok(items)
    }
}

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ig_repostbot::config::{self, Config};
use ig_repostbot::db::{self, Pool};
use ig_repostbot::error::PlatformError;
use ig_repostbot::instagram::model::{MediaItem, MediaResource, ResourceKind, UploadPart};
use ig_repostbot::instagram::InstagramService;
use ig_repostbot::model::{AccountRole, Credentials, MediaKind, PairingOptions, Session};
use ig_repostbot::notify::{Notification, Notifier};
use ig_repostbot::scheduler::Scheduler;
use ig_repostbot::session::SessionStore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCall {
    pub destination: String,
    pub caption: String,
    pub kind: MediaKind,
    /// Source urls of the uploaded parts, recovered from the downloaded bytes.
    pub urls: Vec<String>,
}

/// Scripted platform that records every call.
#[derive(Clone, Default)]
pub struct RecordingInstagram {
    pub feeds: Arc<Mutex<HashMap<String, Vec<MediaItem>>>>,
    pub login_error: Arc<Mutex<Option<PlatformError>>>,
    pub list_errors: Arc<Mutex<VecDeque<PlatformError>>>,
    /// Scripted failures of part uploads, consumed one per attempt.
    pub part_errors: Arc<Mutex<VecDeque<PlatformError>>>,
    /// Scripted failures of the configure (publish) call.
    pub upload_errors: Arc<Mutex<VecDeque<PlatformError>>>,
    /// Publishes whose first part came from this url always fail.
    pub failing_uploads: Arc<Mutex<HashMap<String, PlatformError>>>,
    pub unsupported_urls: Arc<Mutex<Vec<String>>>,
    pub list_delay: Arc<Mutex<Duration>>,
    pub logins: Arc<Mutex<Vec<String>>>,
    pub list_calls: Arc<Mutex<Vec<String>>>,
    pub uploads: Arc<Mutex<Vec<UploadCall>>>,
    pub part_attempts: Arc<AtomicUsize>,
    pub configure_attempts: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl RecordingInstagram {
    pub async fn set_feed(&self, account: &str, items: Vec<MediaItem>) {
        self.feeds.lock().await.insert(account.to_string(), items);
    }

    pub async fn push_list_error(&self, err: PlatformError) {
        self.list_errors.lock().await.push_back(err);
    }

    pub async fn push_upload_error(&self, err: PlatformError) {
        self.upload_errors.lock().await.push_back(err);
    }

    pub async fn uploaded_urls(&self) -> Vec<String> {
        self.uploads
            .lock()
            .await
            .iter()
            .flat_map(|u| u.urls.clone())
            .collect()
    }
}

#[async_trait]
impl InstagramService for RecordingInstagram {
    async fn login(&self, credentials: &Credentials) -> Result<Session, PlatformError> {
        self.logins.lock().await.push(credentials.username.clone());
        if let Some(err) = self.login_error.lock().await.clone() {
            return Err(err);
        }
        let mut session = Session::new(
            credentials.username.clone(),
            format!("token-{}", credentials.username),
        );
        session.proxy = credentials.proxy.clone();
        Ok(session)
    }

    async fn list_recent(
        &self,
        _session: &Session,
        account: &str,
        limit: usize,
    ) -> Result<Vec<MediaItem>, PlatformError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.list_calls.lock().await.push(account.to_string());

        let delay = *self.list_delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.list_errors.lock().await.pop_front();
        let res = match scripted {
            Some(err) => Err(err),
            None => {
                let feeds = self.feeds.lock().await;
                let mut items = feeds.get(account).cloned().unwrap_or_default();
                items.truncate(limit);
                Ok(items)
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn download(
        &self,
        _session: &Session,
        resource: &MediaResource,
    ) -> Result<Vec<u8>, PlatformError> {
        if self.unsupported_urls.lock().await.contains(&resource.url) {
            return Err(PlatformError::UnsupportedMedia(format!(
                "{} cannot be repackaged",
                resource.url
            )));
        }
        Ok(resource.url.clone().into_bytes())
    }

    async fn upload_part(&self, _session: &Session, part: &UploadPart) -> Result<String, PlatformError> {
        self.part_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.part_errors.lock().await.pop_front() {
            return Err(err);
        }
        Ok(String::from_utf8_lossy(&part.data).into_owned())
    }

    async fn configure(
        &self,
        _session: &Session,
        destination: &str,
        kind: MediaKind,
        upload_ids: &[String],
        caption: &str,
    ) -> Result<Option<String>, PlatformError> {
        self.configure_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_errors.lock().await.pop_front() {
            return Err(err);
        }
        if let Some(first) = upload_ids.first() {
            if let Some(err) = self.failing_uploads.lock().await.get(first) {
                return Err(err.clone());
            }
        }
        let mut uploads = self.uploads.lock().await;
        uploads.push(UploadCall {
            destination: destination.to_string(),
            caption: caption.to_string(),
            kind,
            urls: upload_ids.to_vec(),
        });
        Ok(Some(format!("published-{}", uploads.len())))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<(i64, Notification)>>>,
}

impl RecordingNotifier {
    pub async fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().await.iter().map(|(_, n)| n.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, tg_user_id: i64, notification: Notification) -> Result<()> {
        self.sent.lock().await.push((tg_user_id, notification));
        Ok(())
    }
}

pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.scheduler.publish_delay_seconds = 0;
    cfg.scheduler.retry_delay_ms = 0;
    cfg
}

pub struct Harness {
    pub _dir: TempDir,
    pub cfg: Config,
    pub pool: Pool,
    pub api: RecordingInstagram,
    pub notifier: RecordingNotifier,
    pub scheduler: Scheduler,
}

pub async fn harness_with(cfg: Config) -> Harness {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/test.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let api = RecordingInstagram::default();
    let notifier = RecordingNotifier::default();
    let scheduler = Scheduler::new(
        pool.clone(),
        Arc::new(api.clone()),
        Arc::new(notifier.clone()),
        &cfg,
    );
    Harness {
        _dir: dir,
        cfg,
        pool,
        api,
        notifier,
        scheduler,
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

impl Harness {
    /// Create a user (if needed), a pairing with default options and valid
    /// sessions for both roles. The pairing is not activated.
    pub async fn add_pairing(&self, tg_user_id: i64, source: &str, destination: &str) -> i64 {
        let user_id = db::get_or_create_user(&self.pool, tg_user_id, None).await.unwrap();
        let options = PairingOptions::with_defaults(&self.cfg.scheduler);
        let id = db::insert_pairing(&self.pool, user_id, source, destination, &options)
            .await
            .unwrap();
        let sessions = SessionStore::new(self.pool.clone());
        let session = Session::new(destination, "token");
        sessions.put(user_id, AccountRole::Source, &session).await.unwrap();
        sessions.put(user_id, AccountRole::Destination, &session).await.unwrap();
        id
    }
}

pub fn resource_url(media_id: &str, n: usize) -> String {
    format!("https://cdn.example/{}/{}", media_id, n)
}

/// A post taken `minutes_ago` minutes before now.
pub fn item(id: &str, kind: MediaKind, minutes_ago: i64) -> MediaItem {
    let resources = match kind {
        MediaKind::Photo => vec![MediaResource {
            kind: ResourceKind::Image,
            url: resource_url(id, 0),
        }],
        MediaKind::Video => vec![MediaResource {
            kind: ResourceKind::Video,
            url: resource_url(id, 0),
        }],
        MediaKind::Carousel => (0..3)
            .map(|n| MediaResource {
                kind: ResourceKind::Image,
                url: resource_url(id, n),
            })
            .collect(),
    };
    MediaItem {
        id: id.to_string(),
        kind,
        caption: Some(format!("caption of {}", id)),
        taken_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        expires_at: None,
        resources,
    }
}

pub fn credentials(username: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: "hunter2".to_string(),
        proxy: None,
    }
}

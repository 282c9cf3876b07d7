use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Proxy, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::PlatformError;
use crate::model::{Credentials, MediaKind, Session};

pub mod model;

use model::{
    ConfigureResponse, LoginResponse, MediaItem, MediaListResponse, MediaResource, ResourceKind, UploadPart,
    UploadResponse,
};

/// Platform operations the core depends on. The scheduler and executor only
/// see this trait, so tests substitute a recording implementation.
#[async_trait]
pub trait InstagramService: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Session, PlatformError>;

    /// Recent media of `account`, newest first.
    async fn list_recent(
        &self,
        session: &Session,
        account: &str,
        limit: usize,
    ) -> Result<Vec<MediaItem>, PlatformError>;

    async fn download(
        &self,
        session: &Session,
        resource: &MediaResource,
    ) -> Result<Vec<u8>, PlatformError>;

    /// Upload one downloaded part and return its upload id. An upload that
    /// is never configured is never published, so this may be retried.
    async fn upload_part(&self, session: &Session, part: &UploadPart) -> Result<String, PlatformError>;

    /// Publish uploaded parts to `destination`, in `upload_ids` order.
    /// Not idempotent: callers send it at most once per item. `Ok(None)`
    /// means the post was accepted but the response carried no media id.
    async fn configure(
        &self,
        session: &Session,
        destination: &str,
        kind: MediaKind,
        upload_ids: &[String],
        caption: &str,
    ) -> Result<Option<String>, PlatformError>;
}

#[derive(Clone)]
pub struct InstagramClient {
    http: Client,
    base_url: Url,
    user_agent: String,
    timeout: Duration,
    /// Clients for per-user proxies, built on first use.
    proxied: Arc<Mutex<HashMap<String, Client>>>,
}

impl fmt::Debug for InstagramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstagramClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl InstagramClient {
    pub fn new(
        base_url: Url,
        user_agent: &str,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http(user_agent, timeout, proxy)?,
            base_url,
            user_agent: user_agent.to_string(),
            timeout,
            proxied: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url =
            Url::parse(&cfg.instagram.base_url).context("invalid instagram.base_url")?;
        Self::new(
            base_url,
            &cfg.instagram.user_agent,
            Duration::from_secs(cfg.instagram.request_timeout_seconds),
            cfg.instagram.proxy.as_deref(),
        )
    }

    /// The client for calls made through `proxy`. No proxy means the
    /// default client, which honours `instagram.proxy`.
    async fn http_for(&self, proxy: Option<&str>) -> Result<Client, PlatformError> {
        let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(self.http.clone());
        };
        let mut clients = self.proxied.lock().await;
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_http(&self.user_agent, self.timeout, Some(proxy))
            .map_err(|err| PlatformError::Transient(format!("{:#}", err)))?;
        debug!("built HTTP client for per-user proxy");
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {}", path))
    }

    pub fn build_login_request(&self, credentials: &Credentials) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint("accounts/login")?)
            .json(&json!({
                "username": credentials.username,
                "password": credentials.password,
            }))
            .build()
            .context("failed to build login request")
    }

    pub fn build_list_request(
        &self,
        session: &Session,
        account: &str,
        limit: usize,
    ) -> Result<reqwest::Request> {
        let mut url = self.endpoint(&format!("users/{}/media", account))?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        self.http
            .get(url)
            .bearer_auth(&session.token)
            .build()
            .context("failed to build media list request")
    }

    pub fn build_configure_request(
        &self,
        session: &Session,
        destination: &str,
        kind: &str,
        upload_ids: &[String],
        caption: &str,
    ) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint("media/configure")?)
            .bearer_auth(&session.token)
            .json(&build_configure_body(destination, kind, upload_ids, caption))
            .build()
            .context("failed to build configure request")
    }

    async fn execute(
        &self,
        proxy: Option<&str>,
        request: reqwest::Request,
    ) -> Result<Response, PlatformError> {
        debug!(method=%request.method(), url=%request.url(), "sending platform request");
        let http = self.http_for(proxy).await?;
        let res = http.execute(request).await.map_err(network_error)?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let retry_after = parse_retry_after(res.headers().get(RETRY_AFTER));
        let body = res.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        proxy: Option<&str>,
        request: reqwest::Request,
    ) -> Result<T, PlatformError> {
        let res = self.execute(proxy, request).await?;
        res.json::<T>()
            .await
            .map_err(|err| PlatformError::Transient(format!("invalid platform response: {}", err)))
    }

}

#[async_trait]
impl InstagramService for InstagramClient {
    async fn login(&self, credentials: &Credentials) -> Result<Session, PlatformError> {
        let request = self
            .build_login_request(credentials)
            .map_err(|err| PlatformError::Transient(err.to_string()))?;
        let proxy = credentials.proxy.as_deref();
        let res: LoginResponse = self.execute_json(proxy, request).await?;
        let mut session = Session::new(credentials.username.clone(), res.session_token);
        session.expires_at = res.expires_at;
        session.proxy = credentials.proxy.clone();
        Ok(session)
    }

    async fn list_recent(
        &self,
        session: &Session,
        account: &str,
        limit: usize,
    ) -> Result<Vec<MediaItem>, PlatformError> {
        let request = self
            .build_list_request(session, account, limit)
            .map_err(|err| PlatformError::Transient(err.to_string()))?;
        let res: MediaListResponse = self.execute_json(session.proxy.as_deref(), request).await?;
        Ok(res.items)
    }

    async fn download(
        &self,
        session: &Session,
        resource: &MediaResource,
    ) -> Result<Vec<u8>, PlatformError> {
        let url = Url::parse(&resource.url).map_err(|err| {
            PlatformError::UnsupportedMedia(format!("bad resource URL {}: {}", resource.url, err))
        })?;
        let request = self
            .http
            .get(url)
            .bearer_auth(&session.token)
            .build()
            .map_err(network_error)?;
        let res = self.execute(session.proxy.as_deref(), request).await?;
        let bytes = res.bytes().await.map_err(network_error)?;
        Ok(bytes.to_vec())
    }

    async fn upload_part(&self, session: &Session, part: &UploadPart) -> Result<String, PlatformError> {
        let (file_name, mime) = match part.kind {
            ResourceKind::Image => ("part.jpg", "image/jpeg"),
            ResourceKind::Video => ("part.mp4", "video/mp4"),
        };
        let form_part = Part::bytes(part.data.clone())
            .file_name(file_name)
            .mime_str(mime)
            .map_err(network_error)?;
        let url = self
            .endpoint(&format!("upload/{}", part.kind.as_str()))
            .map_err(|err| PlatformError::Transient(err.to_string()))?;
        let request = self
            .http
            .post(url)
            .bearer_auth(&session.token)
            .multipart(Form::new().part("file", form_part))
            .build()
            .map_err(network_error)?;
        let res: UploadResponse = self.execute_json(session.proxy.as_deref(), request).await?;
        Ok(res.upload_id)
    }

    async fn configure(
        &self,
        session: &Session,
        destination: &str,
        kind: MediaKind,
        upload_ids: &[String],
        caption: &str,
    ) -> Result<Option<String>, PlatformError> {
        let request = self
            .build_configure_request(session, destination, kind.as_str(), upload_ids, caption)
            .map_err(|err| PlatformError::Transient(err.to_string()))?;
        let res = self.execute(session.proxy.as_deref(), request).await?;
        // Past a 2xx the post is live; an unreadable body must not cause a resend.
        let body = match res.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(?err, destination, "configure accepted but body unreadable");
                return Ok(None);
            }
        };
        let media_id = parse_configure_response(&body);
        if media_id.is_none() {
            warn!(destination, "configure accepted without a media id");
        }
        Ok(media_id)
    }
}

fn build_http(user_agent: &str, timeout: Duration, proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder().user_agent(user_agent).timeout(timeout);
    if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
        builder = builder.proxy(Proxy::all(proxy).context("invalid proxy URL")?);
    }
    builder.build().context("failed to build HTTP client")
}

/// Body of the final publish call. `upload_ids` order is the carousel order.
pub fn build_configure_body(
    destination: &str,
    kind: &str,
    upload_ids: &[String],
    caption: &str,
) -> Value {
    json!({
        "destination": destination,
        "kind": kind,
        "upload_ids": upload_ids,
        "caption": caption,
    })
}

/// Media id from a successful configure response, if it carries one.
pub fn parse_configure_response(body: &str) -> Option<String> {
    serde_json::from_str::<ConfigureResponse>(body)
        .ok()
        .map(|res| res.media_id)
}

/// Map a non-success HTTP status onto the platform error taxonomy.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PlatformError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PlatformError::Auth(format!("{}: {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited { retry_after },
        StatusCode::NOT_FOUND
        | StatusCode::GONE
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY => {
            PlatformError::UnsupportedMedia(format!("{}: {}", status, body))
        }
        _ => PlatformError::Transient(format!("platform error {}: {}", status, body)),
    }
}

/// Retry-After in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn network_error(err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Transient(format!("timeout: {}", err))
    } else {
        PlatformError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn client() -> InstagramClient {
        InstagramClient::new(
            Url::parse("https://ig.example/api/v1/").unwrap(),
            "test-agent",
            Duration::from_secs(5),
            None,
        )
        .unwrap()
    }

    #[test]
    fn list_request_carries_session_and_limit() {
        let session = Session::new("reader", "tok-1");
        let request = client().build_list_request(&session, "nasa", 5).unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/api/v1/users/nasa/media");
        assert_eq!(request.url().query(), Some("limit=5"));
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer tok-1"
        );
    }

    #[test]
    fn login_request_posts_credentials() {
        let creds = Credentials {
            username: "me".into(),
            password: "secret".into(),
            proxy: None,
        };
        let request = client().build_login_request(&creds).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/api/v1/accounts/login");
        assert_eq!(
            request
                .headers()
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
        assert!(request.headers().get("Authorization").is_none());
    }

    #[tokio::test]
    async fn per_user_proxy_clients_are_cached() {
        let client = client();
        client.http_for(None).await.unwrap();
        client.http_for(Some("  ")).await.unwrap();
        assert!(client.proxied.lock().await.is_empty());

        client.http_for(Some("http://10.0.0.2:3128")).await.unwrap();
        client.http_for(Some("http://10.0.0.2:3128")).await.unwrap();
        client.http_for(Some("http://10.0.0.3:3128")).await.unwrap();
        assert_eq!(client.proxied.lock().await.len(), 2);
    }

    #[test]
    fn configure_body_preserves_upload_order() {
        let ids = vec!["u3".to_string(), "u1".to_string(), "u2".to_string()];
        let body = build_configure_body("dest", "carousel", &ids, "hi");
        assert_eq!(body["upload_ids"][0], "u3");
        assert_eq!(body["upload_ids"][2], "u2");
        assert_eq!(body["kind"], "carousel");
        assert_eq!(body["destination"], "dest");
    }

    #[test]
    fn configure_response_without_media_id_is_still_accepted() {
        assert_eq!(
            parse_configure_response(r#"{"media_id":"m-9"}"#),
            Some("m-9".to_string())
        );
        assert_eq!(parse_configure_response("<html>ok</html>"), None);
        assert_eq!(parse_configure_response(""), None);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            PlatformError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, "checkpoint"),
            PlatformError::Auth(_)
        ));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(30)), ""),
            PlatformError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
        assert!(matches!(
            classify_status(StatusCode::GONE, None, "expired"),
            PlatformError::UnsupportedMedia(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, "").is_transient());
        assert!(classify_status(StatusCode::BAD_REQUEST, None, "").is_transient());
    }

    #[test]
    fn retry_after_parsing() {
        let v = HeaderValue::from_static("120");
        assert_eq!(parse_retry_after(Some(&v)), Some(Duration::from_secs(120)));
        let v = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&v)), None);
        assert_eq!(parse_retry_after(None), None);
    }
}

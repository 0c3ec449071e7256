use std::{env, io, path::Path, sync::Arc, time::Duration};

use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::io::ReaderStream;
use url::Url;

use crate::auth::{Credentials, encoded_entry};
use crate::ticks::{now_millis, ticks_to_millis};

const DEFAULT_UPLOAD_HOST: &str = "https://up.qiniup.com";
const DEFAULT_RS_HOST: &str = "https://rs.qiniu.com";
const DEFAULT_API_HOST: &str = "https://api.qiniu.com";
/// Status the resource-management API uses for "no such file or directory".
const NO_SUCH_ENTRY: u16 = 612;
const UPLOAD_TOKEN_TTL_SECS: i64 = 3600;
const DOWNLOAD_URL_TTL_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("object not found")]
    NotFound,
    #[error("transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Backend { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("bucket domain could not be resolved: {0}")]
    DomainUnresolved(String),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    Missing,
    Transport,
    Backend,
    Local,
}

impl TransferError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            TransferError::Unauthorized { .. } => ErrorClass::Auth,
            TransferError::NotFound => ErrorClass::Missing,
            TransferError::Transport(_) | TransferError::ConcurrencyClosed => {
                ErrorClass::Transport
            }
            TransferError::Backend { .. } | TransferError::DomainUnresolved(_) => {
                ErrorClass::Backend
            }
            TransferError::Io(_) | TransferError::Url(_) => ErrorClass::Local,
        }
    }
}

/// Hosts the client talks to. Tests point all three at one mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub upload: Url,
    pub rs: Url,
    pub api: Url,
}

impl Endpoints {
    pub fn single(base_url: &str) -> Result<Self, TransferError> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            upload: base.clone(),
            rs: base.clone(),
            api: base,
        })
    }

    pub fn qiniu() -> Result<Self, TransferError> {
        Ok(Self {
            upload: Url::parse(DEFAULT_UPLOAD_HOST)?,
            rs: Url::parse(DEFAULT_RS_HOST)?,
            api: Url::parse(DEFAULT_API_HOST)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: read_limit("NOTESYNC_UPLOAD_CONCURRENCY", 4),
            download_concurrency: read_limit("NOTESYNC_DOWNLOAD_CONCURRENCY", 4),
            timeout: Duration::from_secs(read_limit("NOTESYNC_HTTP_TIMEOUT_SECS", 30) as u64),
        }
    }
}

#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    credentials: Credentials,
    endpoints: Endpoints,
    public_domain: Arc<OnceCell<String>>,
    upload_limit: Arc<Semaphore>,
    download_limit: Arc<Semaphore>,
}

impl StoreClient {
    pub fn new(credentials: Credentials) -> Result<Self, TransferError> {
        Self::with_config(credentials, Endpoints::qiniu()?, TransferConfig::default())
    }

    pub fn with_base_url(base_url: &str, credentials: Credentials) -> Result<Self, TransferError> {
        Self::with_config(
            credentials,
            Endpoints::single(base_url)?,
            TransferConfig::default(),
        )
    }

    pub fn with_config(
        credentials: Credentials,
        endpoints: Endpoints,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            credentials,
            endpoints,
            public_domain: Arc::new(OnceCell::new()),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
        })
    }

    /// Skips domain discovery by seeding the cached public domain.
    pub fn with_public_domain(mut self, domain: &str) -> Self {
        self.public_domain = Arc::new(OnceCell::new_with(Some(normalize_domain(domain))));
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Streams `local_path` to the store under `key` with a freshly minted, key-scoped token.
    pub async fn upload(&self, key: &str, local_path: &Path) -> Result<ObjectRef, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let token = self
            .credentials
            .upload_token(key, now_unix() + UPLOAD_TOKEN_TTL_SECS);
        let file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let form = multipart::Form::new()
            .text("token", token)
            .text("key", key.to_string())
            .part(
                "file",
                multipart::Part::stream_with_length(body, length).file_name(key.to_string()),
            );

        let response = self
            .http
            .post(self.endpoints.upload.clone())
            .multipart(form)
            .send()
            .await?;
        let object: ObjectRef = Self::handle_response(response).await?;
        tracing::debug!(key, hash = %object.hash, bytes = length, "object uploaded");
        Ok(object)
    }

    /// Streams the object behind `key` into `dest_path`.
    ///
    /// The file is written as bytes arrive, so on error the destination content is
    /// indeterminate and must not be treated as synced.
    pub async fn download(&self, key: &str, dest_path: &Path) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let mut url = Url::parse(&self.resolve_public_url(key).await?)?;
        url.query_pairs_mut()
            .append_pair("timestamp", &now_millis().to_string());
        self.credentials
            .sign_download_url(&mut url, now_unix() + DOWNLOAD_URL_TTL_SECS);

        let response = self
            .http
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;
        tracing::debug!(key, bytes = written, "object downloaded");
        Ok(())
    }

    /// Reports whether `key` exists and when it was last written.
    ///
    /// A missing object is a normal answer, not an error.
    pub async fn stat(&self, key: &str) -> Result<ObjectStat, TransferError> {
        let path = format!("/stat/{}", encoded_entry(&self.credentials.bucket, key));
        let url = self.endpoints.rs.join(&path)?;
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.credentials.management_token(&path, None))
            .send()
            .await?;
        match Self::handle_response::<StatResponse>(response).await {
            Ok(stat) => Ok(ObjectStat {
                key: key.to_string(),
                exists: true,
                remote_modified_at: ticks_to_millis(stat.put_time),
                size: stat.fsize,
                hash: stat.hash,
            }),
            Err(TransferError::NotFound) => Ok(ObjectStat::missing(key)),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_remote(&self, key: &str) -> Result<(), TransferError> {
        let path = format!("/delete/{}", encoded_entry(&self.credentials.bucket, key));
        let url = self.endpoints.rs.join(&path)?;
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.credentials.management_token(&path, None))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Public URL of `key`. The bucket domain is discovered once and then cached.
    pub async fn resolve_public_url(&self, key: &str) -> Result<String, TransferError> {
        let domain = self
            .public_domain
            .get_or_try_init(|| self.fetch_bucket_domain())
            .await?;
        Ok(public_url(domain, key)?.to_string())
    }

    async fn fetch_bucket_domain(&self) -> Result<String, TransferError> {
        let mut url = self.endpoints.api.join("/v6/domain/list")?;
        url.query_pairs_mut()
            .append_pair("tbl", &self.credentials.bucket);
        let signed = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let response = self
            .http
            .get(url)
            .header(
                AUTHORIZATION,
                self.credentials.management_token(&signed, None),
            )
            .send()
            .await
            .map_err(|err| TransferError::DomainUnresolved(err.to_string()))?;
        let domains: Vec<String> = Self::handle_response(response)
            .await
            .map_err(|err| TransferError::DomainUnresolved(err.to_string()))?;
        let domain = domains
            .into_iter()
            .find(|domain| !domain.trim().is_empty())
            .ok_or_else(|| {
                TransferError::DomainUnresolved(format!(
                    "bucket {} has no bound domain",
                    self.credentials.bucket
                ))
            })?;
        tracing::info!(bucket = %self.credentials.bucket, %domain, "bucket domain resolved");
        Ok(normalize_domain(&domain))
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, body))
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransferError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

fn classify_failure(status: StatusCode, body: String) -> TransferError {
    match status.as_u16() {
        401 | 403 => TransferError::Unauthorized { body },
        404 | NO_SUCH_ENTRY => TransferError::NotFound,
        _ => TransferError::Backend { status, body },
    }
}

fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("http://{domain}")
    }
}

fn public_url(domain: &str, key: &str) -> Result<Url, TransferError> {
    let mut url = Url::parse(domain)?;
    url.path_segments_mut()
        .map_err(|_| TransferError::DomainUnresolved(format!("{domain} cannot be a base url")))?
        .pop_if_empty()
        .push(key);
    Ok(url)
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObjectRef {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub key: String,
    pub exists: bool,
    /// Epoch milliseconds, already normalized from store ticks.
    pub remote_modified_at: i64,
    pub size: Option<u64>,
    pub hash: Option<String>,
}

impl ObjectStat {
    pub fn missing(key: &str) -> Self {
        Self {
            key: key.to_string(),
            exists: false,
            remote_modified_at: 0,
            size: None,
            hash: None,
        }
    }

    pub fn present(key: &str, remote_modified_at: i64) -> Self {
        Self {
            key: key.to_string(),
            exists: true,
            remote_modified_at,
            size: None,
            hash: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatResponse {
    #[serde(default)]
    fsize: Option<u64>,
    #[serde(default)]
    hash: Option<String>,
    put_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_domains_get_http_scheme() {
        assert_eq!(normalize_domain("cdn.example"), "http://cdn.example");
        assert_eq!(normalize_domain("https://cdn.example"), "https://cdn.example");
        assert_eq!(normalize_domain("  cdn.example "), "http://cdn.example");
    }

    #[test]
    fn public_url_encodes_key() {
        let url = public_url("http://cdn.example", "My Note.md").unwrap();
        assert_eq!(url.as_str(), "http://cdn.example/My%20Note.md");
        let url = public_url("http://cdn.example/", "A.md").unwrap();
        assert_eq!(url.as_str(), "http://cdn.example/A.md");
    }

    #[test]
    fn failures_are_classified_by_status() {
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, "bad token".into()),
            TransferError::Unauthorized { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::from_u16(612).unwrap(), String::new()),
            TransferError::NotFound
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, String::new()),
            TransferError::NotFound
        ));
        let err = classify_failure(StatusCode::from_u16(614).unwrap(), "exists".into());
        assert!(matches!(err, TransferError::Backend { .. }));
        assert_eq!(err.classification(), ErrorClass::Backend);
    }
}

//! Object storage for artifact archives.
//!
//! Archives are addressed by their content key (see [`crate::artifact`]) and
//! shared between the driver and the sandbox executor. The store is a narrow
//! capability trait so the concrete transport stays swappable: an HTTP
//! backend for bucket-style storage, and a directory backend for the local
//! emulator flow where driver and sandbox see the same filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::ProgressBar;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from object-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} storing {key}")]
    Status { key: String, status: u16 },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed blob storage with just the operations this system needs.
///
/// `put` is idempotent at the key level: keys are content hashes, so two
/// concurrent writers of the same key store identical bytes and either may
/// win.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Probe for an object; returns its size when present.
    async fn head(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Store the file at `path` under `key`. When a progress bar is given,
    /// it advances by bytes as the body streams out.
    async fn put(&self, key: &str, path: &Path, progress: Option<ProgressBar>) -> StoreResult<()>;

    /// Fetch the object into `dest`.
    async fn get(&self, key: &str, dest: &Path) -> StoreResult<()>;
}

/// Store speaking plain HTTP HEAD/PUT/GET against `{base_url}/{key}`, the
/// shape of a bucket gateway or presigning proxy. Request signing is the
/// endpoint's concern, not ours.
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{key}", self.base_url)
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn head(&self, key: &str) -> StoreResult<Option<u64>> {
        // Any failure here reads as "absent"; a real problem will surface
        // on the PUT that follows.
        match self.client.head(self.url(key)).send().await {
            Ok(resp) if resp.status().is_success() => Ok(Some(resp.content_length().unwrap_or(0))),
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, path: &Path, progress: Option<ProgressBar>) -> StoreResult<()> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();

        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let (Some(bar), Ok(chunk)) = (&progress, chunk) {
                bar.inc(chunk.len() as u64);
            }
        });

        let resp = self
            .client
            .put(self.url(key))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(StoreError::Status {
                key: key.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> StoreResult<()> {
        let resp = self.client.get(self.url(key)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(StoreError::Status {
                key: key.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Store backed by a shared directory. Objects live as `{key}.tar` files,
/// matching what the copying uploader writes and the sandbox's local
/// downloader reads.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.tar"))
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn head(&self, key: &str) -> StoreResult<Option<u64>> {
        match tokio::fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, path: &Path, progress: Option<ProgressBar>) -> StoreResult<()> {
        let copied = tokio::fs::copy(path, self.object_path(key)).await?;
        if let Some(bar) = progress {
            bar.inc(copied);
        }
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> StoreResult<()> {
        match tokio::fs::copy(self.object_path(key), dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

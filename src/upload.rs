//! Artifact upload.
//!
//! Two uploaders exist behind one interface: a copying uploader that drops
//! the archives into a directory the emulator sandbox reads from, and an
//! object-store uploader that probes each key first and only pushes what is
//! missing. Keys are content hashes, so a probe hit means the exact bytes
//! are already there and concurrent driver runs share uploads for free.

use std::time::Duration;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::artifact::{key_from_path, ArtifactBundle};
use crate::store::{DirStore, ObjectStore, StoreResult};

/// Uploads a built artifact bundle to wherever the sandbox can reach it.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, bundle: &ArtifactBundle) -> StoreResult<()>;
}

/// Uploader that copies archives into a shared directory.
pub struct CopyingUploader {
    store: DirStore,
}

impl CopyingUploader {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store: DirStore::new(dir),
        }
    }
}

#[async_trait]
impl Uploader for CopyingUploader {
    async fn upload(&self, bundle: &ArtifactBundle) -> StoreResult<()> {
        for path in [&bundle.dolt_tar, &bundle.bin_tar, &bundle.bats_tar] {
            self.store.put(&key_from_path(path), path, None).await?;
        }

        // Settle delay for FUSE-backed shared directories.
        tokio::time::sleep(Duration::from_secs(1)).await;

        Ok(())
    }
}

/// Uploader that pushes the three archives to an object store concurrently,
/// skipping keys that already exist. One bytes-style progress bar spans the
/// whole bundle; a skipped archive credits its full size at once.
pub struct StoreUploader<S> {
    store: S,
}

impl<S: ObjectStore> StoreUploader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn upload_one(&self, path: &std::path::Path, bar: &ProgressBar) -> StoreResult<()> {
        let key = key_from_path(path);
        let size = tokio::fs::metadata(path).await?.len();

        if self.store.head(&key).await?.is_some() {
            // Already uploaded by this or another driver run.
            debug!(%key, "archive already present, skipping upload");
            bar.inc(size);
            return Ok(());
        }

        self.store.put(&key, path, Some(bar.clone())).await
    }
}

#[async_trait]
impl<S: ObjectStore> Uploader for StoreUploader<S> {
    async fn upload(&self, bundle: &ArtifactBundle) -> StoreResult<()> {
        let mut total = 0u64;
        for path in [&bundle.dolt_tar, &bundle.bin_tar, &bundle.bats_tar] {
            total += tokio::fs::metadata(path).await?.len();
        }

        let bar = ProgressBar::new(total).with_message("uploading tests");
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} {bar:40} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let res = futures::try_join!(
            self.upload_one(&bundle.dolt_tar, &bar),
            self.upload_one(&bundle.bin_tar, &bar),
            self.upload_one(&bundle.bats_tar, &bar),
        )
        .map(|_| ());

        bar.finish();
        res
    }
}

//! Artifact materialization on the sandbox filesystem.
//!
//! Each archive key maps to a directory that is populated exactly once per
//! sandbox instance and treated as immutable afterwards. A zero-byte
//! `.downloaded` sentinel inside the directory is the single atomic
//! "fully materialized" signal: it is created only after download and
//! unpack both succeeded, so a crashed attempt leaves no sentinel and the
//! next request retries from scratch.
//!
//! Within one process, a per-key lock table serializes concurrent first-use
//! fetches of the same key. The sentinel alone would keep the tree
//! consistent either way; the lock just stops two requests from downloading
//! the same archive twice.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::store::{ObjectStore, StoreError};

/// Name of the sentinel file marking a fully materialized cache entry.
pub const SENTINEL: &str = ".downloaded";

/// Errors from cache materialization.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("could not fetch artifact: {0}")]
    Store(#[from] StoreError),

    #[error("could not unpack {key}: {source}")]
    Unpack {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads and unpacks archives on first use, keyed by content key.
pub struct ArtifactCache {
    store: Arc<dyn ObjectStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Ensure the archive named `key` is unpacked beneath `dest`.
    ///
    /// Idempotent: once the sentinel exists the call returns immediately
    /// and the store is never consulted again for that key on this
    /// instance. On a miss, only `dest` itself is wiped before the fetch,
    /// so sibling cache entries are untouched.
    pub async fn ensure_unpacked(&self, dest: &Path, key: &str) -> Result<(), CacheError> {
        let lock = self.key_lock(key).await;
        let _guard = lock.lock().await;

        let sentinel = dest.join(SENTINEL);
        if sentinel.exists() {
            debug!(%key, "cache hit");
            return Ok(());
        }

        info!(%key, dest = %dest.display(), "materializing artifact");

        // A previous partial attempt may have left debris behind.
        match tokio::fs::remove_dir_all(dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(dest).await?;

        let tar_path = dest.join(format!("{key}.tar"));
        self.store.get(key, &tar_path).await?;

        let unpack_dest = dest.to_path_buf();
        let unpack_tar = tar_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&unpack_tar)?;
            tar::Archive::new(file).unpack(&unpack_dest)
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
        .map_err(|source| CacheError::Unpack {
            key: key.to_string(),
            source,
        })?;

        // Touch the sentinel last; its existence is the commit point.
        std::fs::File::create(&sentinel)?;
        Ok(())
    }
}

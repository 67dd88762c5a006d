//! Poll-based config file watcher.
//!
//! Change detection is by SHA-256 content digest rather than mtime so that
//! atomic-rename writes (and editors that rewrite in place) are both picked
//! up exactly once. Any failure along read → parse → validate keeps the
//! last-known-good snapshot active.

use crate::model::ConfigDocument;
use crate::snapshot::{ConfigError, ConfigSource, Snapshot};
use crate::store::ConfigStore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reads and validates the initial config. A missing or invalid file here is
/// fatal to bootstrap; later failures are not.
pub async fn load_initial(path: &Path) -> Result<(Snapshot, String), BootstrapError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| BootstrapError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = content_digest(&bytes);
    let document: ConfigDocument = serde_json::from_slice(&bytes).map_err(ConfigError::Parse)?;
    let snapshot = Snapshot::from_document(document, ConfigSource::File)?;
    Ok((snapshot, digest))
}

pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct FileWatcher {
    path: PathBuf,
    interval: Duration,
    store: Arc<ConfigStore>,
    last_digest: String,
}

impl FileWatcher {
    /// `last_digest` is the digest of the content the store was seeded with,
    /// so an unchanged file does not trigger a reload on the first poll.
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        store: Arc<ConfigStore>,
        last_digest: String,
    ) -> Self {
        Self {
            path: path.into(),
            interval,
            store,
            last_digest,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; the digest is unchanged then.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(path = %self.path.display(), "file watcher stopped");
                    return;
                }
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    async fn poll_once(&mut self) {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "could not read config file, keeping last-known-good snapshot"
                );
                return;
            }
        };

        let digest = content_digest(&bytes);
        if digest == self.last_digest {
            return;
        }

        let document: ConfigDocument = match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "config reload failed to parse, keeping last-known-good snapshot"
                );
                return;
            }
        };

        match self.store.try_replace(document, ConfigSource::File) {
            Ok(event) => {
                self.last_digest = digest;
                tracing::info!(
                    path = %self.path.display(),
                    version = %event.new_version,
                    "config reloaded from file"
                );
            }
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "config reload rejected, keeping last-known-good snapshot"
                );
            }
        }
    }
}

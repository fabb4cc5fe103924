//! On-disk layout: `<root>/<key[0:2]>/<key>/<artifact>`
//!
//! Payloads are received into a temp file inside the cache root and only
//! become visible at their final path through a single rename.

use crate::error::{Result, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Prefix of in-flight upload files in the cache root
const UPLOAD_PREFIX: &str = ".incoming-";

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Check that a cache key can be used as a directory name and shard prefix
pub fn validate_key(key: &str) -> Result<()> {
    if key.chars().count() < 2 {
        return Err(StoreError::InvalidName(format!(
            "key {:?} is shorter than two characters",
            key
        )));
    }
    if key.starts_with('.') {
        return Err(StoreError::InvalidName(format!(
            "key {:?} starts with a dot",
            key
        )));
    }
    validate_component("key", key)
}

/// Check that an artifact name is a plain file name
pub fn validate_artifact_name(name: &str) -> Result<()> {
    validate_component("artifact", name)
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidName(format!("empty {}", what)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(StoreError::InvalidName(format!(
            "{} {:?} contains forbidden characters",
            what, value
        )));
    }
    if value.chars().all(|c| c == '.') {
        return Err(StoreError::InvalidName(format!(
            "{} {:?} is a relative path",
            what, value
        )));
    }
    Ok(())
}

/// Maps keys and artifacts to paths under the cache root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache root if it does not exist
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Shard directory holding every key that shares the first two characters
    pub fn shard_dir(&self, key: &str) -> PathBuf {
        let shard: String = key.chars().take(2).collect();
        self.root.join(shard)
    }

    pub fn key_dir(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(key)
    }

    pub fn path_for(&self, key: &str, artifact: &str) -> PathBuf {
        self.key_dir(key).join(artifact)
    }

    /// Sum of file lengths directly inside the key directory
    pub async fn directory_size(&self, key: &str) -> Result<u64> {
        let (_, bytes) = scan_dir(&self.key_dir(key)).await?;
        Ok(bytes)
    }

    /// Recursively delete the key directory, then the shard if it became empty
    pub async fn remove_key(&self, key: &str) -> Result<()> {
        match fs::remove_dir_all(self.key_dir(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Fails harmlessly while other keys remain in the shard
        let _ = fs::remove_dir(self.shard_dir(key)).await;
        Ok(())
    }

    /// Open a fresh temp file in the cache root to receive a payload
    pub async fn begin_upload(&self) -> Result<PendingUpload> {
        loop {
            let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
            let path = self
                .root
                .join(format!("{}{}-{}", UPLOAD_PREFIX, std::process::id(), seq));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return Ok(PendingUpload {
                        path,
                        file,
                        received: 0,
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Move a completed upload to its final path with an atomic rename
    pub async fn publish(
        &self,
        upload: PendingUpload,
        key: &str,
        artifact: &str,
    ) -> Result<PathBuf> {
        let dest = self.path_for(key, artifact);

        if let Err(e) = fs::create_dir_all(self.key_dir(key)).await {
            upload.discard().await;
            return Err(StoreError::placement(dest, e));
        }

        let PendingUpload { path, file, .. } = upload;
        drop(file);

        if let Err(e) = fs::rename(&path, &dest).await {
            remove_temp(&path).await;
            return Err(StoreError::placement(dest, e));
        }

        debug!(key, artifact, path = ?dest, "Published artifact");
        Ok(dest)
    }

    /// Delete upload temp files left behind by an earlier process
    pub async fn sweep_stale_uploads(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(UPLOAD_PREFIX) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to remove stale upload"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed stale uploads");
        }
        Ok(removed)
    }
}

/// A payload being received into a temp file in the cache root
#[derive(Debug)]
pub struct PendingUpload {
    path: PathBuf,
    file: File,
    received: u64,
}

impl PendingUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Copy exactly `declared_size` bytes from the reader into the temp file.
    ///
    /// If the stream ends early this fails with
    /// [`StoreError::TruncatedTransfer`]; the temp file stays on disk until
    /// the caller calls [`PendingUpload::discard`].
    pub async fn receive<R>(
        &mut self,
        reader: &mut R,
        declared_size: u64,
        buffer_size: usize,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; buffer_size.max(1)];
        while self.received < declared_size {
            let remaining = declared_size - self.received;
            let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(StoreError::TruncatedTransfer {
                    expected: declared_size,
                    received: self.received,
                });
            }
            self.file.write_all(&buf[..n]).await?;
            self.received += n as u64;
        }
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(self.received)
    }

    /// Close and delete the temp file
    pub async fn discard(self) {
        let PendingUpload { path, file, .. } = self;
        drop(file);
        remove_temp(&path).await;
    }
}

async fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove temp upload");
        }
    }
}

/// Count the regular files directly inside `dir` and sum their lengths.
/// A missing directory counts as empty.
pub(crate) async fn scan_dir(dir: &Path) -> Result<(usize, u64)> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut files = 0;
    let mut bytes = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

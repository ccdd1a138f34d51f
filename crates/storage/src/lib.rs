//! Destination storage for incoming transfers.
//!
//! Incoming bytes are written to `<final>.part` while a running SHA-256 is
//! kept alongside. The part file is renamed onto its final path only after
//! the caller has verified the digest; otherwise it is deleted. A `PartFile`
//! that is dropped without being committed or discarded removes itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Suffix appended to the final path while a transfer is in flight.
pub const PART_SUFFIX: &str = ".part";

/// Highest numeric suffix tried by [`unique_path`] before falling back to a timestamp.
pub const MAX_NUMBERED_SUFFIX: u32 = 9999;

/// How many fresh names `LocalStorage::begin` tries when another session
/// claims the chosen one first.
const BEGIN_ATTEMPTS: usize = 8;

/// Storage trait for incoming file persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Resolve a free destination for `name` and open its part file.
    ///
    /// `name` must already be sanitized to a single path component.
    async fn begin(&self, name: &str) -> io::Result<PartFile>;
}

/// Local directory-backed storage implementation.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    dest_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dest_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dest_dir)
            .with_context(|| {
                format!("Failed to create destination directory {}", dest_dir.display())
            })?;

        Ok(Self { dest_dir })
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn begin(&self, name: &str) -> io::Result<PartFile> {
        let candidate = self.dest_dir.join(name);
        let mut attempt = 1;
        loop {
            match PartFile::create(unique_path(&candidate)).await {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < BEGIN_ATTEMPTS => {
                    tracing::debug!("Part file for {} taken, retrying", name);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Return `path` if nothing occupies it, otherwise the first free
/// `<stem> (<i>)<.ext>` sibling, falling back to a Unix timestamp suffix.
///
/// Advisory only: nothing is reserved, so a concurrent creator can still win
/// the race between this check and the caller's open.
pub fn unique_path(path: &Path) -> PathBuf {
    unique_path_bounded(path, MAX_NUMBERED_SUFFIX)
}

fn unique_path_bounded(path: &Path, max_suffix: u32) -> PathBuf {
    if !is_occupied(path) {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for i in 1..=max_suffix {
        let candidate = dir.join(format!("{} ({}){}", stem, i, ext));
        if !is_occupied(&candidate) {
            return candidate;
        }
    }

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    dir.join(format!("{} ({}){}", stem, stamp, ext))
}

/// `<final>.part`
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut raw = final_path.as_os_str().to_os_string();
    raw.push(PART_SUFFIX);
    PathBuf::from(raw)
}

// Symlinks count as occupied even when dangling. An in-flight part file
// also claims its final name.
fn is_occupied(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
        || std::fs::symlink_metadata(part_path_for(path)).is_ok()
}

/// An in-flight destination file plus the digest of everything written to it.
#[derive(Debug)]
pub struct PartFile {
    file: Option<File>,
    hasher: Sha256,
    written: u64,
    part_path: PathBuf,
    final_path: PathBuf,
    settled: bool,
}

impl PartFile {
    /// Create `<final_path>.part`. Fails with `AlreadyExists` rather than
    /// opening a part file some other session owns.
    pub async fn create(final_path: PathBuf) -> io::Result<Self> {
        let part_path = part_path_for(&final_path);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await?;

        tracing::debug!("Opened part file {}", part_path.display());
        Ok(Self {
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            part_path,
            final_path,
            settled: false,
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `data` to the part file and the running digest.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush and fsync the part file, returning the lowercase hex digest of
    /// its contents. No further writes are accepted afterwards.
    pub async fn finish(&mut self) -> io::Result<String> {
        let mut file = self.file.take().ok_or_else(closed)?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(hex::encode(self.hasher.finalize_reset()))
    }

    /// Rename the part file onto its final path.
    ///
    /// On failure the part file is removed when `self` drops.
    pub async fn commit(mut self) -> io::Result<PathBuf> {
        drop(self.file.take());
        fs::rename(&self.part_path, &self.final_path).await?;
        self.settled = true;

        tracing::debug!("Committed {}", self.final_path.display());
        Ok(self.final_path.clone())
    }

    /// Delete the part file.
    pub async fn discard(mut self) {
        drop(self.file.take());
        match fs::remove_file(&self.part_path).await {
            Ok(()) => tracing::debug!("Discarded {}", self.part_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.part_path.display(), e),
        }
        self.settled = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        drop(self.file.take());
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => tracing::debug!("Removed abandoned {}", self.part_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.part_path.display(), e),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "part file already finished")
}

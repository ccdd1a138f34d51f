use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{SendError, ValidationError};
use crate::format::format_bytes;

/// Header describing the file a sender is offering.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    #[serde(alias = "filename")]
    pub name: String,
    pub size: i64,
    pub sha256: String,
}

impl FileMetadata {
    /// Hash a file from disk, recording its byte length and base name.
    pub async fn from_file(path: &Path) -> Result<Self, SendError> {
        let open_err = |source| SendError::Open { path: path.to_path_buf(), source };

        let mut f = File::open(path).await.map_err(open_err)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size: u64 = 0;

        loop {
            let n = f.read(&mut buf).await.map_err(open_err)?;
            if n == 0 { break; }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        // Extract just the filename, not the full path
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        Ok(Self {
            name,
            size: size as i64,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Check every field against the receiver's limits, first failure wins.
    pub fn validate(&self, max_size: i64) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.size <= 0 {
            return Err(ValidationError::NonPositiveSize(self.size));
        }
        if self.size > max_size {
            return Err(ValidationError::TooLarge { size: self.size, max: max_size });
        }
        if self.sha256.len() != 64 {
            return Err(ValidationError::DigestLength(self.sha256.len()));
        }
        if hex::decode(&self.sha256).is_err() {
            return Err(ValidationError::DigestNotHex);
        }
        Ok(())
    }

    /// Rewrite `name` into a safe single path component.
    pub fn sanitize(&mut self) {
        self.name = sanitize_filename(&self.name);
    }

    /// Declared size as an unsigned byte count. Only meaningful after `validate`.
    pub fn byte_len(&self) -> u64 {
        self.size.max(0) as u64
    }

    /// Case-insensitive comparison against a computed hex digest.
    pub fn digest_matches(&self, actual_hex: &str) -> bool {
        self.sha256.eq_ignore_ascii_case(actual_hex)
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        format!("{} ({})", self.name, format_bytes(self.byte_len()))
    }
}

/// Strip everything from an untrusted name that could make it more than one
/// path component. Idempotent; never returns `/`, `\`, `..` or NUL.
pub fn sanitize_filename(name: &str) -> String {
    let name = name.trim().replace('\0', "");
    let mut name = name.trim().replace(['/', '\\'], "_");

    while name.contains("..") {
        name = name.replace("..", "_");
    }

    if name.is_empty() || name == "." {
        return "file".to_string();
    }
    name
}

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Port used by both the listener and, by default, the sender's target.
pub const DEFAULT_PORT: u16 = 8989;

/// 2 GiB
pub const DEFAULT_MAX_FILE_SIZE: i64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory received files are committed into
    pub dest_dir: PathBuf,

    /// Port to listen on for incoming connections
    pub listen_port: u16,

    /// Largest `size` a header may declare
    pub max_file_size: i64,

    /// Deadline for the header line and for the sender's wait on ACCEPT/REJECT
    pub handshake_timeout_secs: u64,

    /// Read buffer used while streaming the file body (64 KiB)
    pub copy_buffer_size: usize,

    /// Answer every offer without prompting: `Some(true)` accepts, `Some(false)` rejects
    pub auto_accept: Option<bool>,

    /// Handle each connection on its own task instead of one at a time
    pub concurrent: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            dest_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("OpenAir"),
            listen_port: DEFAULT_PORT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            handshake_timeout_secs: 30,
            copy_buffer_size: 64 * 1024,
            auto_accept: None,
            concurrent: false,
        }
    }
}

impl TransferConfig {
    pub fn with_dest_dir(mut self, dest_dir: PathBuf) -> Self {
        self.dest_dir = dest_dir;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: i64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ensure_dest_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dest_dir)
            .with_context(|| format!("creating {}", self.dest_dir.display()))?;
        Ok(())
    }

    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = serde_json::from_str(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}

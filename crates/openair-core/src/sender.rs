//! Sender side of a transfer.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::SendError;
use crate::header;
use crate::metadata::FileMetadata;

/// A source file whose digest and length have been computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFile {
    pub path: PathBuf,
    pub meta: FileMetadata,
}

impl PreparedFile {
    /// Hash pass: read the whole file once.
    pub async fn from_path(path: &Path) -> Result<Self, SendError> {
        let meta = FileMetadata::from_file(path).await?;
        Ok(Self { path: path.to_path_buf(), meta })
    }
}

/// Connect to `peer` (host:port) and send `file`.
pub async fn send_to(
    peer: &str,
    file: &PreparedFile,
    timeout: Duration,
) -> Result<u64, SendError> {
    tracing::info!("Connecting to {}...", peer);
    let stream = TcpStream::connect(peer)
        .await
        .map_err(|source| SendError::Connect { peer: peer.to_string(), source })?;
    tracing::debug!("Connected to {}", peer);

    send_file(stream, file, timeout).await
}

/// Send pass over an already connected transport. Returns the number of
/// body bytes written, always `file.meta.size` on success.
pub async fn send_file<T>(
    transport: T,
    file: &PreparedFile,
    timeout: Duration,
) -> Result<u64, SendError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let open_err = |source| SendError::Open { path: file.path.clone(), source };
    let expected = file.meta.byte_len();

    let source = File::open(&file.path).await.map_err(open_err)?;
    let actual = source.metadata().await.map_err(open_err)?.len();
    if actual != expected {
        return Err(SendError::SourceChanged { expected, actual });
    }

    let mut conn = BufReader::new(transport);

    tracing::debug!("Sending header for {}", file.meta.name);
    header::write_header(&mut conn, &file.meta)
        .await
        .map_err(SendError::HeaderWriteFailed)?;

    let response = match header::read_response(&mut conn, timeout).await {
        Ok(line) => line,
        Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(SendError::ResponseTimeout),
        Err(e) => return Err(SendError::ResponseReadFailed(e)),
    };
    if response != header::ACCEPT {
        return Err(SendError::Rejected(response));
    }
    tracing::info!("Receiver accepted. Sending {}...", file.meta.summary());

    let mut body = source.take(expected);
    let sent = tokio::io::copy(&mut body, &mut conn)
        .await
        .map_err(SendError::SendFailed)?;
    if sent != expected {
        return Err(SendError::SourceChanged { expected, actual: sent });
    }

    conn.shutdown().await.map_err(SendError::SendFailed)?;
    tracing::info!("Sent {} bytes", sent);
    Ok(sent)
}

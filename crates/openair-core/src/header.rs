//! Line framing for the two control messages of a transfer.
//!
//! - Sender → receiver: one line of compact JSON `FileMetadata`.
//! - Receiver → sender: one line, `ACCEPT` or `REJECT`.
//!
//! Everything after the response line is raw file content.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;
use crate::metadata::FileMetadata;

/// Upper bound on a header line, newline included.
pub const MAX_HEADER_LEN: u64 = 64 * 1024;

pub const ACCEPT: &str = "ACCEPT";
pub const REJECT: &str = "REJECT";

/// Serialize metadata as one newline-terminated JSON line.
pub fn encode_header(meta: &FileMetadata) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(meta)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse a header line; surrounding whitespace is ignored.
pub fn decode_header(line: &str) -> serde_json::Result<FileMetadata> {
    serde_json::from_str(line.trim())
}

/// Write the header in a single `write_all` and flush it.
pub async fn write_header<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    meta: &FileMetadata,
) -> io::Result<()> {
    let line = encode_header(meta).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    transport.write_all(&line).await?;
    transport.flush().await?;
    Ok(())
}

/// Read and decode the header line, giving up after `timeout`.
pub async fn read_header<R: AsyncBufRead + Unpin + Send>(
    reader: &mut R,
    timeout: Duration,
) -> Result<FileMetadata, TransferError> {
    let line = read_line_within(reader, timeout)
        .await
        .map_err(TransferError::HeaderReadFailed)?;
    Ok(decode_header(&line)?)
}

/// Write the one-line handshake answer.
pub async fn write_response<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    accept: bool,
) -> io::Result<()> {
    let line = if accept { "ACCEPT\n" } else { "REJECT\n" };
    transport.write_all(line.as_bytes()).await?;
    transport.flush().await?;
    Ok(())
}

/// Read the handshake answer, trimmed. Interpretation is up to the caller.
pub async fn read_response<R: AsyncBufRead + Unpin + Send>(
    reader: &mut R,
    timeout: Duration,
) -> io::Result<String> {
    let line = read_line_within(reader, timeout).await?;
    Ok(line.trim().to_string())
}

/// Read one `\n`-terminated line of at most `MAX_HEADER_LEN` bytes.
async fn read_line_within<R: AsyncBufRead + Unpin + Send>(
    reader: &mut R,
    timeout: Duration,
) -> io::Result<String> {
    let mut line = String::new();
    let mut limited = (&mut *reader).take(MAX_HEADER_LEN);

    let n = tokio::time::timeout(timeout, limited.read_line(&mut line))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for line"))??;

    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before line"));
    }
    if !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes or is unterminated", MAX_HEADER_LEN),
        ));
    }
    Ok(line)
}

//! Receiver side of a transfer.
//!
//! One session per connection, moving through
//! `AwaitingHeader → Validating → AwaitingDecision → Rejected | Receiving →
//! Verifying → Committed | Discarded`. Nothing touches the filesystem before
//! the offer is accepted, and once it is, every failure removes the part file
//! before the error is returned.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use storage::{PartFile, Storage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;

use crate::config::TransferConfig;
use crate::decision::DecisionSource;
use crate::error::TransferError;
use crate::format::format_bytes;
use crate::header;
use crate::metadata::FileMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingHeader,
    Validating,
    AwaitingDecision,
    Rejected,
    Receiving,
    Verifying,
    Committed,
    Discarded,
}

struct Session<'a> {
    peer: &'a str,
    state: SessionState,
}

impl<'a> Session<'a> {
    fn new(peer: &'a str) -> Self {
        Self { peer, state: SessionState::AwaitingHeader }
    }

    fn advance(&mut self, next: SessionState) {
        tracing::debug!("[{}] {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }
}

/// A file that was received, verified and renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// What the accept loop has to tell whoever is watching it.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    Incoming { peer: &'a str },
    Finished { peer: &'a str, result: &'a Result<Committed, TransferError> },
}

pub type Reporter = Arc<dyn Fn(&SessionEvent<'_>) + Send + Sync>;

pub struct Receiver<S, D> {
    pub storage: Arc<S>,
    pub decision: Arc<D>,
    pub cfg: TransferConfig,
    reporter: Option<Reporter>,
}

impl<S, D> Clone for Receiver<S, D> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            decision: Arc::clone(&self.decision),
            cfg: self.cfg.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

impl<S, D> Receiver<S, D>
where
    S: Storage + 'static,
    D: DecisionSource + 'static,
{
    pub fn new(storage: S, decision: D, cfg: TransferConfig) -> Self {
        Self {
            storage: Arc::new(storage),
            decision: Arc::new(decision),
            cfg,
            reporter: None,
        }
    }

    /// Call `reporter` when a connection arrives and when its session ends.
    pub fn with_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&SessionEvent<'_>) + Send + Sync + 'static,
    {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Accept TCP connections until `accept` itself fails.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let listener = &listener;
        self.serve_with(move || async move {
            let (stream, addr) = listener.accept().await?;
            Ok::<_, io::Error>((stream, addr.to_string()))
        })
        .await
    }

    /// Run sessions over whatever `accept` yields. Per-connection failures
    /// are logged and reported, an accept failure ends the loop.
    pub async fn serve_with<A, F, T>(&self, mut accept: A) -> io::Result<()>
    where
        A: FnMut() -> F,
        F: Future<Output = io::Result<(T, String)>>,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let (transport, peer) = match accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    return Err(e);
                }
            };
            tracing::info!("Incoming connection from {}", peer);
            self.report(&SessionEvent::Incoming { peer: &peer });

            if self.cfg.concurrent {
                let this = self.clone();
                tokio::spawn(async move { this.handle(transport, &peer).await });
            } else {
                self.handle(transport, &peer).await;
            }
        }
    }

    async fn handle<T>(&self, transport: T, peer: &str)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.receive(transport, peer).await;
        match &result {
            Ok(done) => tracing::info!("Transfer complete! Saved to: {}", done.path.display()),
            Err(TransferError::DecisionRejected) => tracing::info!("Rejected offer from {}", peer),
            Err(e) => tracing::error!("Transfer from {} failed: {}", peer, e),
        }
        self.report(&SessionEvent::Finished { peer, result: &result });
    }

    fn report(&self, event: &SessionEvent<'_>) {
        if let Some(reporter) = &self.reporter {
            reporter(event);
        }
    }

    /// Run the full receiver protocol over a connected transport.
    pub async fn receive<T>(&self, transport: T, peer: &str) -> Result<Committed, TransferError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = Session::new(peer);
        let mut reader = BufReader::new(transport);

        let mut meta = header::read_header(&mut reader, self.cfg.handshake_timeout()).await?;
        session.advance(SessionState::Validating);
        tracing::debug!("[{}] Header: {:?}", peer, meta);

        if let Err(e) = meta.validate(self.cfg.max_file_size) {
            tracing::warn!("[{}] Invalid metadata: {}", peer, e);
            return Err(e.into());
        }
        meta.sanitize();

        session.advance(SessionState::AwaitingDecision);
        tracing::info!("Incoming file request from {}: {}", peer, meta.summary());
        let accepted = self.decision.decide(&meta, peer).await;

        header::write_response(&mut reader, accepted)
            .await
            .map_err(TransferError::ResponseWriteFailed)?;
        if !accepted {
            session.advance(SessionState::Rejected);
            return Err(TransferError::DecisionRejected);
        }

        session.advance(SessionState::Receiving);
        tracing::info!("Accepted. Receiving {}...", format_bytes(meta.byte_len()));

        let mut part = self
            .storage
            .begin(&meta.name)
            .await
            .map_err(TransferError::OutputCreateFailed)?;

        let sha256 = match self.stream_body(&mut session, &mut reader, &mut part, &meta).await {
            Ok(digest) => digest,
            Err(e) => {
                session.advance(SessionState::Discarded);
                part.discard().await;
                return Err(e);
            }
        };

        let final_path = part.final_path().to_path_buf();
        match part.commit().await {
            Ok(path) => {
                session.advance(SessionState::Committed);
                Ok(Committed { path, size: meta.byte_len(), sha256 })
            }
            Err(source) => {
                session.advance(SessionState::Discarded);
                Err(TransferError::CommitFailed { path: final_path, source })
            }
        }
    }

    /// Copy exactly `meta.size` bytes into `part`, then check the digest.
    async fn stream_body<R>(
        &self,
        session: &mut Session<'_>,
        reader: &mut R,
        part: &mut PartFile,
        meta: &FileMetadata,
    ) -> Result<String, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let expected = meta.byte_len();
        let mut body = (&mut *reader).take(expected);
        let mut buf = vec![0u8; self.cfg.copy_buffer_size.max(1)];
        let step = (expected / 10).max(1);
        let mut next_report = step;

        loop {
            let n = body.read(&mut buf).await.map_err(TransferError::TransferFailed)?;
            if n == 0 {
                break;
            }
            part.write_chunk(&buf[..n]).await.map_err(TransferError::TransferFailed)?;

            if part.written() >= next_report {
                tracing::debug!(
                    "[{}] Received {}/{}",
                    session.peer,
                    format_bytes(part.written()),
                    format_bytes(expected)
                );
                next_report = part.written() + step;
            }
        }

        let received = part.written();
        if received < expected {
            tracing::warn!(
                "[{}] Transfer incomplete: got {} bytes, expected {}",
                session.peer,
                received,
                expected
            );
            return Err(TransferError::TransferIncomplete { expected, received });
        }

        session.advance(SessionState::Verifying);
        let actual = part.finish().await.map_err(TransferError::TransferFailed)?;
        if !meta.digest_matches(&actual) {
            tracing::warn!(
                "[{}] SHA-256 mismatch! expected {}, got {}",
                session.peer,
                meta.sha256,
                actual
            );
            return Err(TransferError::HashMismatch {
                expected: meta.sha256.clone(),
                actual,
            });
        }
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AutoDecision;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use storage::LocalStorage;
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    const HELLO: &[u8] = b"Hello, World!";
    const HELLO_SHA256: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    fn offer(name: &str, size: i64) -> Vec<u8> {
        format!("{{\"name\":\"{}\",\"size\":{},\"sha256\":\"{}\"}}\n", name, size, HELLO_SHA256)
            .into_bytes()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Feed `input` to a receiver, then return its result and everything it wrote back.
    async fn run<S, D>(
        storage: S,
        decision: D,
        input: &[u8],
    ) -> anyhow::Result<(Result<Committed, TransferError>, Vec<u8>)>
    where
        S: Storage + 'static,
        D: DecisionSource + 'static,
    {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        client.write_all(input).await?;
        client.shutdown().await?;

        let receiver = Receiver::new(storage, decision, TransferConfig::default());
        let result = receiver.receive(server, "test-peer").await;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await?;
        Ok((result, response))
    }

    #[tokio::test]
    async fn test_receive_commits_verified_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(HELLO);

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, response) = run(storage, AutoDecision::Accept, &input).await?;

        let done = result?;
        assert_eq!(response, b"ACCEPT\n");
        assert_eq!(done.path, temp.path().join("report.pdf"));
        assert_eq!(done.size, 13);
        assert_eq!(done.sha256, HELLO_SHA256);
        assert_eq!(std::fs::read(&done.path)?, HELLO);
        assert_eq!(entries(temp.path()), vec!["report.pdf"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_reject_creates_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(HELLO);

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, response) = run(storage, AutoDecision::Reject, &input).await?;

        assert!(matches!(result, Err(TransferError::DecisionRejected)));
        assert_eq!(response, b"REJECT\n");
        assert!(entries(temp.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_negative_size_fails_before_handshake() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, response) = run(storage, AutoDecision::Accept, &offer("a.txt", -5)).await?;

        let err = result.unwrap_err();
        assert!(err.is_pre_accept());
        assert!(matches!(err, TransferError::ValidationFailed(_)));
        assert!(response.is_empty());
        assert!(entries(temp.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_header_gets_no_response() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, response) = run(storage, AutoDecision::Accept, b"{\"name\":\"a\"\n").await?;

        assert!(matches!(result, Err(TransferError::HeaderDecodeFailed(_))));
        assert!(response.is_empty());
        Ok(())
    }

    /// Hands out `data`, then fails every further read with a reset.
    struct ResetAfter {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos >= self.data.len() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            let start = self.pos;
            let n = buf.remaining().min(self.data.len() - start);
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_reset_mid_body_is_transfer_failure() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut data = offer("report.pdf", 13);
        data.extend_from_slice(b"Hello");

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let receiver = Receiver::new(storage, AutoDecision::Accept, TransferConfig::default());
        let result = receiver.receive(ResetAfter { data, pos: 0 }, "test-peer").await;

        match result {
            Err(TransferError::TransferFailed(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(entries(temp.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_mismatch_discards() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(b"Hello, World?");

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, response) = run(storage, AutoDecision::Accept, &input).await?;

        match result {
            Err(TransferError::HashMismatch { expected, actual }) => {
                assert_eq!(expected, HELLO_SHA256);
                assert_ne!(actual, HELLO_SHA256);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(response, b"ACCEPT\n");
        assert!(entries(temp.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_early_close_is_incomplete() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(b"Hello");

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, _) = run(storage, AutoDecision::Accept, &input).await?;

        assert!(matches!(
            result,
            Err(TransferError::TransferIncomplete { expected: 13, received: 5 })
        ));
        assert!(entries(temp.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_bytes_past_size_are_not_consumed() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(HELLO);
        input.extend_from_slice(b"TRAILING GARBAGE");

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, _) = run(storage, AutoDecision::Accept, &input).await?;

        assert_eq!(std::fs::read(result?.path)?, HELLO);
        Ok(())
    }

    #[tokio::test]
    async fn test_traversal_name_stays_in_dest() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().join("dest");
        let mut input = offer("../../evil.txt", 13);
        input.extend_from_slice(HELLO);

        let storage = LocalStorage::new(dest.clone())?;
        let (result, _) = run(storage, AutoDecision::Accept, &input).await?;

        assert_eq!(result?.path, dest.join("____evil.txt"));
        assert_eq!(entries(temp.path()), vec!["dest"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_name_is_uniquified() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        std::fs::write(temp.path().join("report.pdf"), b"older")?;
        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(HELLO);

        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, _) = run(storage, AutoDecision::Accept, &input).await?;

        assert_eq!(result?.path, temp.path().join("report (1).pdf"));
        assert_eq!(std::fs::read(temp.path().join("report.pdf"))?, b"older");
        Ok(())
    }

    #[tokio::test]
    async fn test_policy_callback_sees_sanitized_name() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut input = offer("a/b.txt", 13);
        input.extend_from_slice(HELLO);

        let policy = |meta: &FileMetadata| meta.name == "a_b.txt" && meta.size < 100;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let (result, response) = run(storage, policy, &input).await?;

        assert!(result.is_ok());
        assert_eq!(response, b"ACCEPT\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_output_create_failure() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().join("gone");
        let storage = LocalStorage::new(dest.clone())?;
        std::fs::remove_dir(&dest)?;

        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(HELLO);
        let (result, _) = run(storage, AutoDecision::Accept, &input).await?;

        let err = result.unwrap_err();
        assert!(matches!(err, TransferError::OutputCreateFailed(_)));
        assert!(!err.is_pre_accept());
        Ok(())
    }

    /// Always targets one fixed path, bypassing uniquification.
    struct FixedTarget(PathBuf);

    #[async_trait]
    impl Storage for FixedTarget {
        async fn begin(&self, _name: &str) -> io::Result<PartFile> {
            PartFile::create(self.0.clone()).await
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_commit_failure_discards() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("occupied");
        std::fs::create_dir(&target)?;
        std::fs::write(target.join("keep"), b"x")?;

        let mut input = offer("report.pdf", 13);
        input.extend_from_slice(HELLO);
        let (result, _) = run(FixedTarget(target.clone()), AutoDecision::Accept, &input).await?;

        assert!(matches!(result, Err(TransferError::CommitFailed { .. })));
        assert_eq!(entries(temp.path()), vec!["occupied"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_session_leaves_no_part() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dest = temp.path().to_path_buf();
        let (mut client, server) = tokio::io::duplex(1 << 16);

        let storage = LocalStorage::new(dest.clone())?;
        let receiver = Receiver::new(storage, AutoDecision::Accept, TransferConfig::default());
        let task = tokio::spawn(async move { receiver.receive(server, "test-peer").await });

        client.write_all(&offer("report.pdf", 13)).await?;
        client.write_all(b"Hello").await?;

        let part = dest.join("report.pdf.part");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !part.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(entries(&dest).is_empty());
        Ok(())
    }

    fn describe(event: &SessionEvent<'_>) -> String {
        match event {
            SessionEvent::Incoming { peer } => format!("incoming {}", peer),
            SessionEvent::Finished { peer, result: Ok(_) } => format!("received {}", peer),
            SessionEvent::Finished { peer, result: Err(_) } => format!("failed {}", peer),
        }
    }

    #[tokio::test]
    async fn test_serve_reports_sessions_and_stops_on_accept_error() -> anyhow::Result<()> {
        let temp = TempDir::new()?;

        let (mut bad, bad_server) = tokio::io::duplex(1 << 16);
        bad.write_all(b"this is not json\n").await?;
        bad.shutdown().await?;

        let (mut good, good_server) = tokio::io::duplex(1 << 16);
        good.write_all(&offer("report.pdf", 13)).await?;
        good.write_all(HELLO).await?;
        good.shutdown().await?;

        let mut queue = VecDeque::from(vec![
            Ok((bad_server, "bad-peer".to_string())),
            Ok((good_server, "good-peer".to_string())),
            Err(io::Error::new(io::ErrorKind::Other, "too many open files")),
        ]);

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        let receiver = Receiver::new(storage, AutoDecision::Accept, TransferConfig::default())
            .with_reporter(move |event| seen.lock().unwrap().push(describe(event)));

        let err = receiver
            .serve_with(|| std::future::ready(queue.pop_front().unwrap()))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "too many open files");
        assert_eq!(
            *events.lock().unwrap(),
            vec!["incoming bad-peer", "failed bad-peer", "incoming good-peer", "received good-peer"]
        );
        assert_eq!(entries(temp.path()), vec!["report.pdf"]);
        Ok(())
    }
}

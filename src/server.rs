//! Accept loop of the collector.
//!
//! One [`ConnectionDecoder`] task per client, tracked in a `JoinSet` so
//! shutdown can wait for every connection to emit its `Detach`.

use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::connection::{Clock, ConnectionDecoder, ConnectionEnd, EventSender, SystemClock};
use crate::error::{Result, TracerError};
use crate::protocol::{FrameReader, DEFAULT_MAX_STRING_LEN};
use crate::transport::{is_transient_accept_error, ClientIdentity, PipeListener, PipeStream};
use crate::Pid;

type ConnectionResult = (Pid, Result<ConnectionEnd>);

/// Listener that feeds every accepted connection into the aggregator queue.
pub struct LogServer {
    listener: PipeListener,
    events: EventSender,
    clock: Arc<dyn Clock>,
    strict_protocol: bool,
    max_string_len: u64,
}

impl LogServer {
    /// Bind the listener at `path`.
    pub async fn bind(path: &str, events: EventSender) -> Result<Self> {
        let listener = PipeListener::bind(path).await?;
        tracing::info!("Listening on {}", listener.path());
        Ok(Self::new(listener, events))
    }

    /// Serve an already bound listener.
    pub fn new(listener: PipeListener, events: EventSender) -> Self {
        Self {
            listener,
            events,
            clock: Arc::new(SystemClock),
            strict_protocol: false,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    /// Clock for `Attach`/`Detach` timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stop the whole server when a client sends an unknown message kind.
    pub fn strict_protocol(mut self, strict: bool) -> Self {
        self.strict_protocol = strict;
        self
    }

    /// Maximum accepted string length in bytes.
    pub fn max_string_len(mut self, len: u64) -> Self {
        self.max_string_len = len;
        self
    }

    pub fn path(&self) -> &str {
        self.listener.path()
    }

    /// Accept connections until `cancel` fires or a fatal error occurs.
    ///
    /// Returns `Ok(())` on cancellation. In both cases every connection is
    /// cancelled and awaited before returning, so each one has emitted its
    /// `Detach` by then.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let connections_cancel = cancel.child_token();
        let mut connections = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("Shutting down, {} connections open", connections.len());
                    break Ok(());
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Some(fatal) = self.reap(joined) {
                        break Err(fatal);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => self.spawn_connection(&mut connections, stream, connections_cancel.child_token()),
                    Err(e) => {
                        if let Err(fatal) = self.on_accept_error(e) {
                            break Err(fatal);
                        }
                    }
                },
            }
        };

        connections_cancel.cancel();
        while let Some(joined) = connections.join_next().await {
            // the outcome is already decided, only log
            let _ = self.reap(joined);
        }
        outcome
    }

    /// Recover from a transient accept failure, or hand back a fatal one.
    fn on_accept_error(&mut self, e: TracerError) -> Result<()> {
        if !is_transient_accept_error(&e) {
            tracing::error!("Accept failed: {}", e);
            return Err(e);
        }
        tracing::warn!("Transient accept failure, retrying: {}", e);
        self.listener.recover()
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<ConnectionResult>,
        stream: PipeStream,
        cancel: CancellationToken,
    ) {
        let pid = match stream.client_process_id() {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!("Dropping connection with unknown client process: {}", e);
                return;
            }
        };
        tracing::debug!("[{}] connected", pid);

        let events = self.events.clone();
        let clock = Arc::clone(&self.clock);
        let reader = FrameReader::with_max_string_len(stream, self.max_string_len);
        connections.spawn(async move {
            let result = ConnectionDecoder::with_reader(reader, pid)
                .run(&events, clock.as_ref(), cancel)
                .await;
            (pid, result)
        });
    }

    /// Log a finished connection. Returns an error that must stop the server.
    fn reap(&self, joined: std::result::Result<ConnectionResult, JoinError>) -> Option<TracerError> {
        match joined {
            Ok((pid, Ok(end))) => {
                tracing::debug!("[{}] disconnected ({:?})", pid, end);
                None
            }
            Ok((pid, Err(e @ TracerError::UnknownMessageKind(_)))) if self.strict_protocol => {
                tracing::error!("[{}] {}", pid, e);
                Some(e)
            }
            Ok((pid, Err(TracerError::ChannelClosed))) => {
                tracing::error!("[{}] aggregator is gone", pid);
                Some(TracerError::ChannelClosed)
            }
            Ok((pid, Err(e))) if e.is_protocol_error() => {
                tracing::warn!("[{}] dropped after protocol violation: {}", pid, e);
                None
            }
            Ok((pid, Err(e))) => {
                tracing::error!("[{}] connection aborted: {}", pid, e);
                None
            }
            Err(e) => {
                tracing::error!("Connection task failed: {}", e);
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event::ProcessEvent;
    use crate::protocol::TERMINATOR;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;

    async fn bound(strict: bool) -> (
        tempfile::TempDir,
        String,
        LogServer,
        mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock").to_string_lossy().into_owned();
        let (tx, rx) = mpsc::unbounded_channel();
        let server = LogServer::bind(&path, tx).await.unwrap().strict_protocol(strict);
        (dir, path, server, rx)
    }

    fn io_error(kind: std::io::ErrorKind) -> TracerError {
        TracerError::Io(std::io::Error::from(kind))
    }

    fn unknown_kind_message() -> Vec<u8> {
        let mut bytes = 0u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&42u16.to_le_bytes());
        bytes.extend_from_slice(&TERMINATOR.to_le_bytes());
        bytes
    }

    #[tokio::test]
    async fn test_cancel_detaches_open_connections() {
        let (_dir, path, server, mut rx) = bound(false).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let _client = UnixStream::connect(&path).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Attach { .. })));

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Detach { .. })));
    }

    #[tokio::test]
    async fn test_unknown_kind_isolated_by_default() {
        let (_dir, path, server, mut rx) = bound(false).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let mut bad = UnixStream::connect(&path).await.unwrap();
        bad.write_all(&unknown_kind_message()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Attach { .. })));
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Detach { .. })));

        // still accepting
        let _good = UnixStream::connect(&path).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Attach { .. })));
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_kind_stops_strict_server() {
        let (_dir, path, server, _rx) = bound(true).await;
        let task = tokio::spawn(server.run(CancellationToken::new()));

        let mut bad = UnixStream::connect(&path).await.unwrap();
        bad.write_all(&unknown_kind_message()).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(TracerError::UnknownMessageKind(42))
        ));
    }

    #[tokio::test]
    async fn test_transient_accept_error_keeps_serving() {
        let (_dir, path, mut server, mut rx) = bound(false).await;
        server
            .on_accept_error(io_error(std::io::ErrorKind::ConnectionAborted))
            .unwrap();
        server
            .on_accept_error(io_error(std::io::ErrorKind::Interrupted))
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));
        let _client = UnixStream::connect(&path).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Attach { .. })));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_accept_error_is_returned() {
        let (_dir, _path, mut server, _rx) = bound(false).await;
        let result = server.on_accept_error(io_error(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(
            result,
            Err(TracerError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied
        ));
    }

    #[tokio::test]
    async fn test_reap_only_stops_on_fatal_errors() {
        let (_dir, _path, lenient, _rx) = bound(false).await;
        assert!(lenient.reap(Ok((7, Ok(ConnectionEnd::Closed)))).is_none());
        assert!(lenient
            .reap(Ok((7, Err(TracerError::ProtocolDesync { found: 0 }))))
            .is_none());
        assert!(lenient
            .reap(Ok((7, Err(TracerError::UnknownMessageKind(9)))))
            .is_none());
        assert!(lenient
            .reap(Ok((7, Err(io_error(std::io::ErrorKind::ConnectionReset)))))
            .is_none());
        assert!(matches!(
            lenient.reap(Ok((7, Err(TracerError::ChannelClosed)))),
            Some(TracerError::ChannelClosed)
        ));

        let (_dir, _path, strict, _rx) = bound(true).await;
        assert!(matches!(
            strict.reap(Ok((7, Err(TracerError::UnknownMessageKind(9))))),
            Some(TracerError::UnknownMessageKind(9))
        ));
        assert!(strict
            .reap(Ok((7, Err(TracerError::ProtocolDesync { found: 0 }))))
            .is_none());
    }
}

//! Per-connection decoding of client messages into [`ProcessEvent`]s.
//!
//! A connection yields an implicit `Attach` before its first message and a
//! `Detach` once the stream ends, breaks, or the collector is cancelled.
//! Decode failures end only this connection.
//!
//! # Example
//!
//! ```ignore
//! use spawn_tracer::connection::{ConnectionDecoder, SystemClock};
//!
//! let decoder = ConnectionDecoder::new(stream, client_pid);
//! let end = decoder.run(&events_tx, &SystemClock, cancel.child_token()).await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TracerError};
use crate::event::{ProcessEvent, ProcessInfo};
use crate::protocol::{FrameReader, MessageKind};
use crate::Pid;

/// Sending side of the aggregator queue.
pub type EventSender = mpsc::UnboundedSender<ProcessEvent>;

/// Source of "now" for synthesized `Attach`/`Detach` timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How a connection finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The client closed the stream.
    Closed,
    /// The collector is shutting down.
    Cancelled,
}

/// Decoder for one client connection.
pub struct ConnectionDecoder<R> {
    reader: FrameReader<R>,
    pid: Pid,
}

impl<R: AsyncRead + Unpin> ConnectionDecoder<R> {
    /// Create a decoder for a stream whose client identity is already resolved.
    pub fn new(stream: R, pid: Pid) -> Self {
        Self::with_reader(FrameReader::new(stream), pid)
    }

    /// Create a decoder over a configured [`FrameReader`].
    pub fn with_reader(reader: FrameReader<R>, pid: Pid) -> Self {
        Self { reader, pid }
    }

    /// Client process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Decode the next message.
    ///
    /// Returns `Ok(None)` when the client closed the stream, including in
    /// the middle of a message.
    pub async fn next(&mut self) -> Result<Option<ProcessEvent>> {
        let timestamp = match self.reader.read_timestamp().await {
            Ok(timestamp) => timestamp,
            Err(TracerError::EndOfStream) => {
                if self.reader.buffered() > 0 {
                    tracing::debug!(
                        "[{}] stream ended inside a message header ({} bytes)",
                        self.pid,
                        self.reader.buffered()
                    );
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.read_body(timestamp).await {
            Ok(event) => Ok(Some(event)),
            Err(TracerError::EndOfStream) => {
                tracing::debug!("[{}] stream ended inside a message", self.pid);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read kind, payload and terminator of a message.
    async fn read_body(&mut self, timestamp: DateTime<Utc>) -> Result<ProcessEvent> {
        let kind = MessageKind::try_from(self.reader.read_u16().await?)?;
        let pid = self.pid;

        let event = match kind {
            MessageKind::Exit => ProcessEvent::Exit {
                pid,
                timestamp,
                exit_code: self.reader.read_i32().await?,
            },
            MessageKind::CreateFailure => {
                // the code page may be set per process
                let encoding = self.reader.read_encoding().await?;
                let exe_path = self.reader.read_string(encoding).await?;
                let command_line = self.reader.read_string(encoding).await?;
                ProcessEvent::CreateFailure {
                    pid,
                    timestamp,
                    exe_path,
                    command_line,
                }
            }
            MessageKind::Info => {
                let parent_pid = self.reader.read_u32().await?;
                let exe_path = self.read_required_string("exePath").await?;
                let command_line = self.read_required_string("commandLine").await?;
                let working_directory = self.read_required_string("workingDirectory").await?;
                let environment = self.reader.read_environment_block(UTF_16LE).await?;
                ProcessEvent::Info(ProcessInfo {
                    pid,
                    timestamp,
                    parent_pid,
                    exe_path,
                    command_line,
                    working_directory,
                    environment: Arc::new(environment),
                })
            }
        };

        self.reader.verify_terminator().await?;
        Ok(event)
    }

    async fn read_required_string(&mut self, field: &str) -> Result<String> {
        self.reader
            .read_string(UTF_16LE)
            .await?
            .ok_or_else(|| TracerError::Protocol(format!("{field} must not be null")))
    }

    /// Drive the connection to completion, forwarding events to `events`.
    ///
    /// Always emits `Attach` first and `Detach` last, also when decoding
    /// fails or `cancel` fires. Cancellation is reported as
    /// [`ConnectionEnd::Cancelled`], not as an error.
    pub async fn run(
        mut self,
        events: &EventSender,
        clock: &dyn Clock,
        cancel: CancellationToken,
    ) -> Result<ConnectionEnd> {
        let pid = self.pid;
        // a closed queue means the aggregator is gone, nothing left to report to
        let _ = events.send(ProcessEvent::Attach {
            pid,
            timestamp: clock.now(),
        });

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(ConnectionEnd::Cancelled),
                next = self.next() => match next {
                    Ok(Some(event)) => {
                        tracing::trace!("[{}] {}", pid, event.name());
                        if events.send(event).is_err() {
                            break Err(TracerError::ChannelClosed);
                        }
                    }
                    Ok(None) => break Ok(ConnectionEnd::Closed),
                    Err(e) => break Err(e),
                },
            }
        };

        let _ = events.send(ProcessEvent::Detach {
            pid,
            timestamp: clock.now(),
        });
        outcome
    }
}

//! Collector wiring: listener, connections and aggregator.
//!
//! # Example
//!
//! ```ignore
//! use spawn_tracer::{CollectorBuilder, JsonLinesSink};
//!
//! let (sink, output) = JsonLinesSink::spawn(tokio::io::stdout());
//! let collector = CollectorBuilder::new()
//!     .pipe_name("SpawnCamper")
//!     .observer(sink)
//!     .start()
//!     .await?;
//!
//! let token = collector.cancellation_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     token.cancel();
//! });
//! let tree = collector.wait().await?;
//! output.await??;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{start_aggregator, AggregatorHandle, EventObserver};
use crate::connection::{Clock, SystemClock};
use crate::error::{Result, TracerError};
use crate::protocol::DEFAULT_MAX_STRING_LEN;
use crate::server::LogServer;
use crate::transport::pipe_path;
use crate::tree::ProcessTree;

/// Channel name clients connect to unless configured otherwise.
pub const DEFAULT_PIPE_NAME: &str = "SpawnCamper";

/// Default capacity of the tree change broadcast.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Channel name or full path, see [`pipe_path`].
    pub pipe_name: String,
    /// Stop everything on an unknown message kind instead of dropping the connection.
    pub strict_protocol: bool,
    /// Buffered tree changes per subscriber.
    pub notification_capacity: usize,
    /// Maximum string length accepted from clients.
    pub max_string_len: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            strict_protocol: false,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

impl CollectorConfig {
    /// Platform path the listener binds to.
    pub fn pipe_path(&self) -> String {
        pipe_path(&self.pipe_name)
    }
}

/// Builder for creating a [`Collector`].
pub struct CollectorBuilder {
    config: CollectorConfig,
    observers: Vec<Box<dyn EventObserver>>,
    clock: Arc<dyn Clock>,
}

impl Default for CollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: CollectorConfig::default(),
            observers: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace all settings at once.
    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipe_name(mut self, name: impl Into<String>) -> Self {
        self.config.pipe_name = name.into();
        self
    }

    pub fn strict_protocol(mut self, strict: bool) -> Self {
        self.config.strict_protocol = strict;
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_capacity = capacity;
        self
    }

    pub fn max_string_len(mut self, len: u64) -> Self {
        self.config.max_string_len = len;
        self
    }

    /// Register a raw event observer. Observers run in registration order.
    pub fn observer(mut self, observer: impl EventObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Clock used for `Attach`/`Detach` timestamps.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Bind the listener and start serving.
    ///
    /// # Errors
    ///
    /// Fails if the listener cannot be bound.
    pub async fn start(self) -> Result<Collector> {
        let path = self.config.pipe_path();
        let (events, handle, aggregator) =
            start_aggregator(self.observers, self.config.notification_capacity);

        let server = match LogServer::bind(&path, events).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!("Failed to bind {}: {}", path, e);
                return Err(e);
            }
        };
        let server = server
            .with_clock(self.clock)
            .strict_protocol(self.config.strict_protocol)
            .max_string_len(self.config.max_string_len);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(server.run(cancel.clone()));

        Ok(Collector {
            handle,
            cancel,
            server,
            aggregator,
            pipe_path: path,
        })
    }
}

/// A running collector.
pub struct Collector {
    handle: AggregatorHandle,
    cancel: CancellationToken,
    server: JoinHandle<Result<()>>,
    aggregator: JoinHandle<ProcessTree>,
    pipe_path: String,
}

impl Collector {
    /// Query and subscription access to the tree.
    pub fn handle(&self) -> &AggregatorHandle {
        &self.handle
    }

    /// Path clients connect to.
    pub fn pipe_path(&self) -> &str {
        &self.pipe_path
    }

    /// Token that shuts the collector down when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown. [`Collector::wait`] returns once it completed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the collector stopped and return the final tree.
    ///
    /// Returns `Ok` after a requested shutdown and the fatal error otherwise.
    pub async fn wait(self) -> Result<ProcessTree> {
        let served = self.server.await.map_err(join_error)?;
        // the server dropped the last event sender, so the aggregator drains and ends
        let tree = self.aggregator.await.map_err(join_error)?;
        served.map(|()| tree)
    }
}

fn join_error(e: tokio::task::JoinError) -> TracerError {
    TracerError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CollectorConfig::default();
        assert_eq!(config.pipe_name, "SpawnCamper");
        assert!(!config.strict_protocol);
        assert_eq!(config.notification_capacity, 1024);
        assert!(config.pipe_path().contains("SpawnCamper"));
    }

    #[test]
    fn test_builder_overrides() {
        let builder = CollectorBuilder::new()
            .pipe_name("custom")
            .strict_protocol(true)
            .notification_capacity(8)
            .max_string_len(128);
        assert_eq!(builder.config.pipe_name, "custom");
        assert!(builder.config.strict_protocol);
        assert_eq!(builder.config.notification_capacity, 8);
        assert_eq!(builder.config.max_string_len, 128);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");

        let collector = CollectorBuilder::new()
            .pipe_name(path.to_string_lossy())
            .start()
            .await
            .unwrap();
        assert!(path.exists());
        assert!(collector.handle().roots().await.unwrap().is_empty());

        collector.shutdown();
        let tree = collector.wait().await.unwrap();
        assert!(tree.is_empty());
        assert!(!path.exists());
    }
}

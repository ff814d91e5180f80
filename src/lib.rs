//! # spawn-tracer
//!
//! Collector for process-spawn traces.
//!
//! Instrumented processes connect to a named local channel and report their
//! start (parent, command line, working directory, environment), failed
//! spawn attempts and exit. The collector rebuilds a live tree of process
//! invocations from these reports.
//!
//! ## Architecture
//!
//! - **Transport** ([`transport`]): named pipe on Windows, Unix domain socket elsewhere
//! - **Decoding** ([`connection`], [`protocol`], [`codec`]): one task per client
//!   turning the binary protocol into [`ProcessEvent`]s
//! - **Aggregation** ([`aggregator`], [`tree`]): a single task applying all
//!   events to the [`ProcessTree`]
//! - **Sinks**: [`EventObserver`]s and [`TreeChange`] subscriptions
//!
//! ## Example
//!
//! ```ignore
//! use spawn_tracer::{CollectorBuilder, JsonLinesSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (sink, _output) = JsonLinesSink::spawn(tokio::io::stdout());
//!     let collector = CollectorBuilder::new()
//!         .observer(sink)
//!         .start()
//!         .await
//!         .unwrap();
//!
//!     let mut changes = collector.handle().subscribe();
//!     while let Ok(change) = changes.recv().await {
//!         println!("{change:?}");
//!     }
//! }
//! ```

pub mod aggregator;
pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod server;
pub mod sink;
pub mod transport;
pub mod tree;

mod collector;

/// OS process id as reported on the wire.
pub type Pid = u32;

pub use aggregator::{AggregatorHandle, EventObserver};
pub use collector::{
    Collector, CollectorBuilder, CollectorConfig, DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_PIPE_NAME,
};
pub use error::{Result, TracerError};
pub use event::{ProcessEvent, ProcessInfo};
pub use sink::JsonLinesSink;
pub use tree::{ProcessStatus, ProcessTree, TracedProcess, TreeChange};

//! JSON-lines output of finished invocations.
//!
//! Each `Detach` of a recorded process produces one line:
//!
//! ```text
//! {"processId":200,"parentProcessId":100,"exePath":"C:\\b.exe",...,"exitCode":0}
//! ```
//!
//! `parentProcessId` is the traced parent in the tree, `null` for roots.
//! Lines are serialized on the aggregator and written by a separate task,
//! so a slow output never stalls event processing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregator::EventObserver;
use crate::codec::Environment;
use crate::event::ProcessEvent;
use crate::tree::{NodeId, ProcessTree, TracedProcess};
use crate::Pid;

/// Maximum number of lines written per flush.
const MAX_BATCH_LINES: usize = 64;

/// Serialized form of a finished process.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord<'a> {
    pub process_id: Pid,
    pub parent_process_id: Option<Pid>,
    pub exe_path: &'a str,
    pub command_line: &'a str,
    pub working_directory: &'a str,
    pub environment: &'a Environment,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl<'a> InvocationRecord<'a> {
    /// Record for `process`, attached under the traced parent `parent_pid`.
    pub fn new(process: &'a TracedProcess, parent_pid: Option<Pid>) -> Self {
        Self {
            process_id: process.pid(),
            parent_process_id: parent_pid,
            exe_path: process.exe_path(),
            command_line: process.command_line(),
            working_directory: process.working_directory(),
            environment: process.environment(),
            start_time: process.start_time(),
            end_time: process.end_time(),
            exit_code: process.exit_code(),
        }
    }

    /// Record for the node `id`, with the parent taken from the tree.
    pub fn from_tree(tree: &'a ProcessTree, id: NodeId) -> Option<Self> {
        let node = tree.get_node(id)?;
        let parent_pid = node
            .parent()
            .and_then(|parent| tree.get_node(parent))
            .map(|parent| parent.process().pid());
        Some(Self::new(node.process(), parent_pid))
    }
}

/// Observer emitting one JSON object per line.
///
/// Created with [`JsonLinesSink::spawn`], which also starts the task owning
/// the output. That task ends once the sink is dropped and hands the writer
/// back.
pub struct JsonLinesSink {
    lines: mpsc::UnboundedSender<String>,
}

impl JsonLinesSink {
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<std::io::Result<W>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_lines(rx, writer));
        (Self { lines: tx }, task)
    }
}

impl EventObserver for JsonLinesSink {
    fn on_event(&mut self, event: &ProcessEvent, tree: &ProcessTree) {
        let ProcessEvent::Detach { pid, .. } = event else {
            return;
        };
        // connections without Info never reached the tree
        let Some(record) = tree
            .node_for_pid(*pid)
            .and_then(|id| InvocationRecord::from_tree(tree, id))
        else {
            return;
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("[{}] failed to serialize record: {}", pid, e);
                return;
            }
        };
        if self.lines.send(line).is_err() {
            tracing::error!("[{}] output closed, record dropped", pid);
        }
    }
}

async fn write_lines<W>(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut writer: W,
) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::new();
    while let Some(first) = rx.recv().await {
        batch.clear();
        batch.extend_from_slice(first.as_bytes());
        batch.push(b'\n');

        let mut count = 1;
        while count < MAX_BATCH_LINES {
            let Ok(line) = rx.try_recv() else { break };
            batch.extend_from_slice(line.as_bytes());
            batch.push(b'\n');
            count += 1;
        }

        if let Err(e) = async {
            writer.write_all(&batch).await?;
            writer.flush().await
        }
        .await
        {
            tracing::error!("Failed to write records: {}", e);
            return Err(e);
        }
    }
    Ok(writer)
}

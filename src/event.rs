//! Typed events produced by connection decoders.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::codec::Environment;
use crate::Pid;

/// A process announcing itself after a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub timestamp: DateTime<Utc>,
    pub parent_pid: Pid,
    pub exe_path: String,
    pub command_line: String,
    pub working_directory: String,
    pub environment: Arc<Environment>,
}

/// One lifecycle event reported for a client process.
///
/// `Attach` and `Detach` are connection-level signals synthesized by the
/// decoder, the rest are decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A client connected. May be a mere existence check.
    Attach { pid: Pid, timestamp: DateTime<Utc> },
    /// A client connection ended.
    Detach { pid: Pid, timestamp: DateTime<Utc> },
    /// The traced process terminated normally.
    Exit {
        pid: Pid,
        timestamp: DateTime<Utc>,
        exit_code: i32,
    },
    /// `pid` tried to spawn a child and failed.
    CreateFailure {
        pid: Pid,
        timestamp: DateTime<Utc>,
        exe_path: Option<String>,
        command_line: Option<String>,
    },
    /// A traced process started.
    Info(ProcessInfo),
}

impl ProcessEvent {
    /// Process id of the client that produced the event.
    pub fn pid(&self) -> Pid {
        match self {
            ProcessEvent::Attach { pid, .. }
            | ProcessEvent::Detach { pid, .. }
            | ProcessEvent::Exit { pid, .. }
            | ProcessEvent::CreateFailure { pid, .. } => *pid,
            ProcessEvent::Info(info) => info.pid,
        }
    }

    /// When the event happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ProcessEvent::Attach { timestamp, .. }
            | ProcessEvent::Detach { timestamp, .. }
            | ProcessEvent::Exit { timestamp, .. }
            | ProcessEvent::CreateFailure { timestamp, .. } => *timestamp,
            ProcessEvent::Info(info) => info.timestamp,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProcessEvent::Attach { .. } => "attach",
            ProcessEvent::Detach { .. } => "detach",
            ProcessEvent::Exit { .. } => "exit",
            ProcessEvent::CreateFailure { .. } => "create-failure",
            ProcessEvent::Info(_) => "info",
        }
    }
}

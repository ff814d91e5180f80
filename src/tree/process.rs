//! A single traced process.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::env_diff::EnvironmentDiff;
use crate::codec::Environment;
use crate::event::ProcessInfo;
use crate::Pid;

/// A field that is written at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SetOnce<T>(Option<T>);

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T: PartialEq + fmt::Debug> SetOnce<T> {
    fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }

    /// Store `value`. Repeating the stored value is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if a different value is already stored.
    fn set(&mut self, field: &str, value: T) {
        match &self.0 {
            Some(current) if *current != value => {
                panic!("{field} already set to {current:?}, refusing to overwrite with {value:?}")
            }
            Some(_) => {}
            None => self.0 = Some(value),
        }
    }

    fn set_if_absent(&mut self, value: T) -> bool {
        if self.0.is_some() {
            return false;
        }
        self.0 = Some(value);
        true
    }
}

/// Lifecycle state derived from the set-once fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
    /// Disconnected without reporting an exit code.
    Terminated,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => f.write_str("running"),
            ProcessStatus::Exited(code) => write!(f, "exited with code {code}"),
            ProcessStatus::Terminated => f.write_str("terminated, exit code unknown"),
        }
    }
}

/// A process recorded from its `Info` message.
///
/// Everything except the exit code and end time is frozen at creation.
#[derive(Debug, Clone)]
pub struct TracedProcess {
    pid: Pid,
    parent_pid: Pid,
    start_time: DateTime<Utc>,
    exe_path: String,
    command_line: String,
    working_directory: String,
    environment: Arc<Environment>,
    environment_diff: Option<EnvironmentDiff>,
    exit_code: SetOnce<i32>,
    end_time: SetOnce<DateTime<Utc>>,
}

impl TracedProcess {
    /// Record a started process.
    ///
    /// `parent_environment` is the environment of the resolved parent; the
    /// diff is only computed when there is one.
    pub fn new(info: ProcessInfo, parent_environment: Option<&Environment>) -> Self {
        let environment_diff =
            parent_environment.map(|parent| EnvironmentDiff::compute(parent, &info.environment));
        Self {
            pid: info.pid,
            parent_pid: info.parent_pid,
            start_time: info.timestamp,
            exe_path: info.exe_path,
            command_line: info.command_line,
            working_directory: info.working_directory,
            environment: info.environment,
            environment_diff,
            exit_code: SetOnce::default(),
            end_time: SetOnce::default(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent id as reported by the process. The parent may not be traced.
    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn exe_path(&self) -> &str {
        &self.exe_path
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Changes relative to the parent. `None` for root processes.
    pub fn environment_diff(&self) -> Option<&EnvironmentDiff> {
        self.environment_diff.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time.get().copied()
    }

    /// Record the exit code.
    ///
    /// # Panics
    ///
    /// Panics if a different exit code was recorded before.
    pub fn set_exit_code(&mut self, exit_code: i32) {
        self.exit_code.set("exit code", exit_code);
    }

    /// Record the end time.
    ///
    /// # Panics
    ///
    /// Panics if a different end time was recorded before.
    pub fn set_end_time(&mut self, end_time: DateTime<Utc>) {
        self.end_time.set("end time", end_time);
    }

    /// Record the end time unless one is already set. Returns whether it was stored.
    pub fn set_end_time_if_absent(&mut self, end_time: DateTime<Utc>) -> bool {
        self.end_time.set_if_absent(end_time)
    }

    pub fn status(&self) -> ProcessStatus {
        match (self.exit_code(), self.end_time()) {
            (Some(code), _) => ProcessStatus::Exited(code),
            (None, Some(_)) => ProcessStatus::Terminated,
            (None, None) => ProcessStatus::Running,
        }
    }
}

//! Tree module - traced processes and their hierarchy.
//!
//! - [`TracedProcess`] - one recorded process with set-once exit fields
//! - [`EnvironmentDiff`] - environment changes relative to the parent
//! - [`ProcessTree`] - arena of nodes fed by [`ProcessEvent`](crate::event::ProcessEvent)s

mod env_diff;
mod process;
#[allow(clippy::module_inception)]
mod tree;

pub use env_diff::{EnvChange, EnvironmentDiff};
pub use process::{ProcessStatus, TracedProcess};
pub use tree::{FailedInvocation, Invocation, Node, NodeId, ProcessTree, TreeChange};

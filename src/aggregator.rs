//! Single-writer event aggregator.
//!
//! All connections push [`ProcessEvent`]s into one unbounded queue. A single
//! task drains it and applies each event to the [`ProcessTree`], so events
//! are never applied concurrently and events of one connection keep their
//! order. Readers go through [`AggregatorHandle`]; queries are answered
//! between events, after everything already queued. Under a sustained
//! backlog a pending query waits for at most [`MAX_EVENTS_PER_TURN`] events.
//!
//! # Example
//!
//! ```ignore
//! use spawn_tracer::aggregator::start_aggregator;
//!
//! let (events, handle, task) = start_aggregator(Vec::new(), 1024);
//! let mut changes = handle.subscribe();
//! // hand `events` to the listener, then
//! let roots = handle.query(|tree| tree.roots().len()).await?;
//! ```

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::EventSender;
use crate::error::{Result, TracerError};
use crate::event::ProcessEvent;
use crate::tree::{ProcessTree, TracedProcess, TreeChange};
use crate::Pid;

/// Sink receiving every raw event after it was applied to the tree.
pub trait EventObserver: Send {
    fn on_event(&mut self, event: &ProcessEvent, tree: &ProcessTree);
}

impl<F> EventObserver for F
where
    F: FnMut(&ProcessEvent, &ProcessTree) + Send,
{
    fn on_event(&mut self, event: &ProcessEvent, tree: &ProcessTree) {
        self(event, tree)
    }
}

type Query = Box<dyn FnOnce(&ProcessTree) + Send>;

/// Events applied in a row before pending queries get a turn.
pub const MAX_EVENTS_PER_TURN: usize = 64;

/// Read access to the aggregator from other tasks.
#[derive(Clone)]
pub struct AggregatorHandle {
    queries: mpsc::UnboundedSender<Query>,
    changes: broadcast::Sender<TreeChange>,
}

impl AggregatorHandle {
    /// Run `f` against the tree and return its result.
    ///
    /// # Errors
    ///
    /// Returns [`TracerError::ChannelClosed`] once the aggregator stopped.
    pub async fn query<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProcessTree) -> T + Send + 'static,
    {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.queries
            .send(Box::new(move |tree: &ProcessTree| {
                let _ = tx_reply.send(f(tree));
            }))
            .map_err(|_| TracerError::ChannelClosed)?;
        rx_reply.await.map_err(|_| TracerError::ChannelClosed)
    }

    /// Most recently started process with this pid.
    pub async fn get_process(&self, pid: Pid) -> Result<Option<TracedProcess>> {
        self.query(move |tree| tree.get_process(pid).cloned()).await
    }

    /// Root processes in start order.
    pub async fn roots(&self) -> Result<Vec<TracedProcess>> {
        self.query(|tree| {
            tree.roots()
                .iter()
                .filter_map(|id| tree.get_node(*id))
                .map(|node| node.process().clone())
                .collect()
        })
        .await
    }

    /// Copy of the whole tree.
    pub async fn snapshot(&self) -> Result<ProcessTree> {
        self.query(ProcessTree::clone).await
    }

    /// Receive tree changes from now on.
    ///
    /// A receiver that falls more than the notification capacity behind
    /// gets `RecvError::Lagged` and should re-read the tree.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeChange> {
        self.changes.subscribe()
    }
}

/// Owner of the process tree.
pub struct Aggregator {
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    queries: mpsc::UnboundedReceiver<Query>,
    changes: broadcast::Sender<TreeChange>,
    observers: Vec<Box<dyn EventObserver>>,
    tree: ProcessTree,
}

impl Aggregator {
    /// Create an aggregator with its event queue and handle.
    pub fn new(
        observers: Vec<Box<dyn EventObserver>>,
        notification_capacity: usize,
    ) -> (Self, EventSender, AggregatorHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (queries_tx, queries) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(notification_capacity.max(1));

        let handle = AggregatorHandle {
            queries: queries_tx,
            changes: changes.clone(),
        };
        let aggregator = Self {
            events,
            queries,
            changes,
            observers,
            tree: ProcessTree::new(),
        };
        (aggregator, events_tx, handle)
    }

    /// Apply events until every [`EventSender`] is dropped, then return the tree.
    pub async fn run(mut self) -> ProcessTree {
        let mut applied = 0;
        loop {
            if applied >= MAX_EVENTS_PER_TURN {
                applied = 0;
                while let Ok(query) = self.queries.try_recv() {
                    query(&self.tree);
                }
            }
            tokio::select! {
                // drain queued events before answering queries
                biased;
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.apply(event);
                        applied += 1;
                    }
                    None => break,
                },
                Some(query) = self.queries.recv() => {
                    query(&self.tree);
                    applied = 0;
                }
            }
        }
        tracing::debug!("Aggregator stopped with {} processes", self.tree.len());
        self.tree
    }

    fn apply(&mut self, event: ProcessEvent) {
        tracing::debug!("[{}] {} at {}", event.pid(), event.name(), event.timestamp());

        for change in self.tree.handle_event(&event) {
            // no subscribers is fine
            let _ = self.changes.send(change);
        }
        for observer in &mut self.observers {
            observer.on_event(&event, &self.tree);
        }
    }
}

/// Spawn an [`Aggregator`] task.
pub fn start_aggregator(
    observers: Vec<Box<dyn EventObserver>>,
    notification_capacity: usize,
) -> (EventSender, AggregatorHandle, JoinHandle<ProcessTree>) {
    let (aggregator, events, handle) = Aggregator::new(observers, notification_capacity);
    let task = tokio::spawn(aggregator.run());
    (events, handle, task)
}

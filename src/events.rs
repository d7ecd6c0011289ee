//! Discovery events and the debounced event queue
//!
//! Providers and idle watchers receive raw events from their source (file
//! watcher, docker event stream). An [`EventQueue`] collapses a burst of them
//! into one batch so a flurry of changes becomes a single reconciliation.

use crate::error::EventQueueError;
use crate::task::{panic_message, FinishReason, Task};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Source of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    File,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    // file
    Create,
    Modify,
    Remove,
    // container
    Start,
    Stop,
    Die,
    Kill,
    Pause,
    Unpause,
    Destroy,
    Other,
}

impl EventAction {
    /// Map a docker engine action name
    pub fn from_docker(action: &str) -> Self {
        match action {
            "create" => EventAction::Create,
            "start" | "restart" => EventAction::Start,
            "stop" => EventAction::Stop,
            "die" => EventAction::Die,
            "kill" => EventAction::Kill,
            "pause" => EventAction::Pause,
            "unpause" => EventAction::Unpause,
            "destroy" => EventAction::Destroy,
            _ => EventAction::Other,
        }
    }

    /// The container went down or was suspended
    pub fn is_container_down(self) -> bool {
        matches!(
            self,
            EventAction::Stop | EventAction::Die | EventAction::Kill | EventAction::Pause | EventAction::Destroy
        )
    }

    /// The container came back without our involvement
    pub fn is_container_up(self) -> bool {
        matches!(self, EventAction::Start | EventAction::Unpause)
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventAction::Create => "create",
            EventAction::Modify => "modify",
            EventAction::Remove => "remove",
            EventAction::Start => "start",
            EventAction::Stop => "stop",
            EventAction::Die => "die",
            EventAction::Kill => "kill",
            EventAction::Pause => "pause",
            EventAction::Unpause => "unpause",
            EventAction::Destroy => "destroy",
            EventAction::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub action: EventAction,
    pub actor_name: String,
    pub actor_id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl Event {
    pub fn file(action: EventAction, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            kind: EventKind::File,
            action,
            actor_name: path.clone(),
            actor_id: path,
            attributes: HashMap::new(),
        }
    }

    pub fn docker(action: EventAction, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Docker,
            action,
            actor_name: name.into(),
            actor_id: id.into(),
            attributes: HashMap::new(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.kind, self.action, self.actor_name)
    }
}

type FlushFn = Arc<dyn Fn(Vec<Event>) -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorFn = Arc<dyn Fn(EventQueueError) + Send + Sync>;

/// Debounces events into batches delivered to a single handler.
///
/// Each event re-arms the flush timer; a batch is never held longer than
/// `max_delay` after its first event. The handler runs inline, so batches are
/// processed one at a time in arrival order.
pub struct EventQueue {
    task: Task,
    flush_interval: Duration,
    max_delay: Duration,
    on_flush: FlushFn,
    on_error: ErrorFn,
}

impl EventQueue {
    pub fn new<F, Fut, E>(task: Task, flush_interval: Duration, on_flush: F, on_error: E) -> Self
    where
        F: Fn(Vec<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        E: Fn(EventQueueError) + Send + Sync + 'static,
    {
        Self {
            task,
            flush_interval,
            max_delay: flush_interval * 4,
            on_flush: Arc::new(move |events| on_flush(events).boxed()),
            on_error: Arc::new(on_error),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.flush_interval);
        self
    }

    /// Attach to a producer and run until it closes or the task is cancelled
    pub fn start<Err>(
        self,
        events: mpsc::UnboundedReceiver<Event>,
        errors: mpsc::UnboundedReceiver<Err>,
    ) -> JoinHandle<()>
    where
        Err: fmt::Display + Send + 'static,
    {
        let task = self.task.clone();
        task.spawn(self.run(events, errors))
    }

    async fn run<Err: fmt::Display>(
        self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut errors: mpsc::UnboundedReceiver<Err>,
    ) {
        let token = self.task.token();
        let mut batch: Vec<Event> = Vec::new();
        let mut flush_at: Option<Instant> = None;
        let mut hard_deadline: Option<Instant> = None;
        let mut errors_open = true;

        loop {
            let deadline = flush_at
                .zip(hard_deadline)
                .map(|(soft, hard)| soft.min(hard));
            let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if !batch.is_empty() {
                        debug!(task = %self.task, dropped = batch.len(), "Event queue cancelled with pending events");
                    }
                    return;
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    flush_at = None;
                    hard_deadline = None;
                    self.flush(std::mem::take(&mut batch)).await;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        trace!(task = %self.task, event = %event, "Event queued");
                        let now = Instant::now();
                        if batch.is_empty() {
                            hard_deadline = Some(now + self.max_delay);
                        }
                        batch.push(event);
                        flush_at = Some(now + self.flush_interval);
                    }
                    None => {
                        if !batch.is_empty() {
                            self.flush(std::mem::take(&mut batch)).await;
                        }
                        debug!(task = %self.task, "Event source closed");
                        break;
                    }
                },
                err = errors.recv(), if errors_open => match err {
                    Some(err) => (self.on_error)(EventQueueError::Producer(err.to_string())),
                    None => errors_open = false,
                },
            }
        }

        self.task.finish(FinishReason::Done).await;
    }

    async fn flush(&self, batch: Vec<Event>) {
        debug!(task = %self.task, count = batch.len(), "Flushing events");
        let handler = (self.on_flush)(batch);
        if let Err(panic) = AssertUnwindSafe(handler).catch_unwind().await {
            (self.on_error)(EventQueueError::HandlerPanic(panic_message(panic.as_ref())));
        }
    }
}

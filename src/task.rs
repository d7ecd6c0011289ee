//! Hierarchical task tree
//!
//! Every long-running unit of work (providers, routes, health monitors, idle
//! watchers, event queues) hangs off a [`Task`]. The tree gives three
//! guarantees:
//!
//! - cancelling a task cancels its whole subtree,
//! - a task is only marked finished after all of its children finished,
//! - finish callbacks run exactly once, however many callers race to finish.
//!
//! Children are owned by their parent; a child only keeps a weak reference
//! back up the tree. Children created with `cancellable = false` are bound to
//! the parent's *finish* rather than its cancellation: they keep running until
//! every cancellable sibling has drained, which gives a deterministic teardown
//! order (e.g. a provider stops its event queue before its routes).

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Why a task finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// The task completed its work
    Done,
    /// The task was cancelled (shutdown, parent finished, route removed)
    Cancelled(String),
    /// The task stopped because of a real failure
    Error(String),
    /// The task body panicked
    Panic(String),
}

impl FinishReason {
    pub fn cancelled(cause: impl Into<String>) -> Self {
        FinishReason::Cancelled(cause.into())
    }

    pub fn error(err: impl fmt::Display) -> Self {
        FinishReason::Error(err.to_string())
    }

    /// True for reasons that should be reported as failures
    pub fn is_failure(&self) -> bool {
        matches!(self, FinishReason::Error(_) | FinishReason::Panic(_))
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Done => write!(f, "done"),
            FinishReason::Cancelled(cause) => write!(f, "cancelled: {}", cause),
            FinishReason::Error(e) => write!(f, "error: {}", e),
            FinishReason::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct ChildEntry {
    inner: Arc<Inner>,
    cancellable: bool,
}

#[derive(Default)]
struct State {
    children: HashMap<u64, ChildEntry>,
    on_cancel: Vec<JoinHandle<()>>,
    on_finished: Vec<(String, Callback)>,
    callbacks_ran: bool,
    cancel_cause: Option<String>,
    reason: Option<FinishReason>,
    finishing: bool,
}

struct Inner {
    id: u64,
    name: String,
    parent: Option<Weak<Inner>>,
    token: CancellationToken,
    state: Mutex<State>,
    finished_tx: watch::Sender<bool>,
}

/// A node in the task tree.
///
/// `Task` is a cheap handle; clones refer to the same node.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

impl Task {
    /// Create a root task representing a process-lifetime scope
    pub fn root(name: impl Into<String>) -> Task {
        Self::new_node(name.into(), None, CancellationToken::new())
    }

    fn new_node(name: String, parent: Option<Weak<Inner>>, token: CancellationToken) -> Task {
        let (finished_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            parent,
            token,
            state: Mutex::new(State::default()),
            finished_tx,
        });

        // Cancellation always ends in a finish, whoever triggered it.
        let weak = Arc::downgrade(&inner);
        let token = inner.token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                let reason = inner.cancel_reason();
                finish_node(inner, reason).await;
            }
        });

        Task { inner }
    }

    /// Create a child task.
    ///
    /// A `cancellable` child sees the parent's cancellation immediately. A
    /// non-cancellable child is cancelled only once the parent has drained
    /// its cancellable children during finish.
    pub fn subtask(&self, name: impl AsRef<str>, cancellable: bool) -> Task {
        let token = if cancellable {
            self.inner.token.child_token()
        } else {
            CancellationToken::new()
        };
        let name = format!("{}/{}", self.inner.name, name.as_ref());
        let child = Self::new_node(name, Some(Arc::downgrade(&self.inner)), token);

        let mut state = self.inner.state.lock();
        if state.finishing {
            // The parent already snapshotted its children; unwind on our own.
            drop(state);
            child.cancel("parent already finished");
        } else {
            state.children.insert(
                child.inner.id,
                ChildEntry {
                    inner: Arc::clone(&child.inner),
                    cancellable,
                },
            );
        }
        child
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Cancellation token observed by everything running under this task
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Resolves once the task is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cancel the task and its subtree. The task then finishes on its own.
    pub fn cancel(&self, cause: impl Into<String>) {
        {
            let mut state = self.inner.state.lock();
            if state.cancel_cause.is_none() {
                state.cancel_cause = Some(cause.into());
            }
        }
        self.inner.token.cancel();
    }

    /// Finish the task: cancel it, drain children, run finish callbacks.
    ///
    /// Idempotent. The first reason wins; later callers wait for the first
    /// finish to complete.
    pub fn finish(&self, reason: FinishReason) -> BoxFuture<'static, ()> {
        finish_node(Arc::clone(&self.inner), reason)
    }

    /// Wait until the task is finished
    pub async fn wait_finished(&self) {
        wait_finished(&self.inner).await
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.finished_tx.borrow()
    }

    /// Reason passed to the first `finish` call, if any
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Number of children not yet finished
    pub fn num_children(&self) -> usize {
        self.inner.state.lock().children.len()
    }

    /// Run `f` once this task is cancelled, on its own unit of work.
    pub fn on_cancel<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let task_name = self.inner.name.clone();
        let token = self.inner.token.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!(task = %task_name, callback = %name, "Cancel callback panicked");
            }
        });

        let mut state = self.inner.state.lock();
        if !state.finishing {
            state.on_cancel.push(handle);
        }
    }

    /// Run `f` when the task finishes, after all children have finished.
    pub fn on_finished<F>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let mut state = self.inner.state.lock();
        if state.callbacks_ran {
            drop(state);
            debug!(task = %self.inner.name, callback = %name, "Task already finished, running callback now");
            run_callback(&self.inner.name, &name, Box::new(f));
        } else {
            state.on_finished.push((name, Box::new(f)));
        }
    }

    /// Spawn a body bound to this task.
    ///
    /// A panic inside the body is caught and finishes the task with
    /// [`FinishReason::Panic`]; it never takes the process down.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.clone();
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let msg = panic_message(panic.as_ref());
                error!(task = %task.name(), panic = %msg, "Task body panicked");
                task.finish(FinishReason::Panic(msg)).await;
            }
        })
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

impl Inner {
    fn cancel_reason(&self) -> FinishReason {
        if let Some(cause) = self.state.lock().cancel_cause.clone() {
            return FinishReason::Cancelled(cause);
        }
        let cause = self
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|p| format!("parent {} cancelled", p.name))
            .unwrap_or_else(|| "cancelled".to_string());
        FinishReason::Cancelled(cause)
    }
}

async fn wait_finished(inner: &Inner) {
    let mut rx = inner.finished_tx.subscribe();
    let _ = rx.wait_for(|finished| *finished).await;
}

fn finish_node(inner: Arc<Inner>, reason: FinishReason) -> BoxFuture<'static, ()> {
    async move {
        // Decide under the lock; await only once it is released.
        let drained = {
            let mut state = inner.state.lock();
            if state.finishing {
                None
            } else {
                state.finishing = true;
                state.reason = Some(reason.clone());

                let mut cancellable = Vec::new();
                let mut bound = Vec::new();
                for child in state.children.values() {
                    if child.cancellable {
                        cancellable.push(Arc::clone(&child.inner));
                    } else {
                        bound.push(Arc::clone(&child.inner));
                    }
                }
                Some((cancellable, bound, std::mem::take(&mut state.on_cancel)))
            }
        };
        let Some((cancellable, bound, on_cancel)) = drained else {
            wait_finished(&inner).await;
            return;
        };

        inner.token.cancel();

        let cause = FinishReason::cancelled(format!("parent {} finished", inner.name));
        join_all(cancellable.into_iter().map(|c| finish_node(c, cause.clone()))).await;
        join_all(bound.into_iter().map(|c| finish_node(c, cause.clone()))).await;

        for handle in on_cancel {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(task = %inner.name, "Cancel callback task panicked");
                }
            }
        }

        let callbacks = {
            let mut state = inner.state.lock();
            state.callbacks_ran = true;
            std::mem::take(&mut state.on_finished)
        };
        for (name, cb) in callbacks {
            run_callback(&inner.name, &name, cb);
        }

        match &reason {
            FinishReason::Error(e) => warn!(task = %inner.name, error = %e, "Task finished with error"),
            FinishReason::Panic(msg) => error!(task = %inner.name, panic = %msg, "Task finished after panic"),
            other => debug!(task = %inner.name, reason = %other, "Task finished"),
        }

        inner.finished_tx.send_replace(true);

        if let Some(parent) = inner.parent.as_ref().and_then(Weak::upgrade) {
            parent.state.lock().children.remove(&inner.id);
        }
    }
    .boxed()
}

fn run_callback(task: &str, name: &str, cb: Callback) {
    if std::panic::catch_unwind(AssertUnwindSafe(cb)).is_err() {
        error!(task, callback = name, "Finish callback panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_finish_runs_callbacks_once() {
        let root = Task::root("root");
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        root.on_finished("count", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let a = root.finish(FinishReason::Done);
        let b = root.finish(FinishReason::error("late"));
        tokio::time::timeout(WAIT, futures::future::join(a, b))
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(root.is_finished());
        assert_eq!(root.finish_reason(), Some(FinishReason::Done));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finish_from_many_threads() {
        let root = Task::root("root");
        for i in 0..8 {
            root.subtask(format!("child{}", i), i % 2 == 0);
        }

        let handles: Vec<_> = (0..8)
            .map(|_| tokio::spawn(root.finish(FinishReason::Done)))
            .collect();
        for handle in handles {
            tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        }

        assert!(root.is_finished());
        assert_eq!(root.num_children(), 0);
    }

    #[tokio::test]
    async fn test_cancel_finishes_whole_subtree() {
        let root = Task::root("root");
        let child = root.subtask("child", true);
        let grandchild = child.subtask("grandchild", true);
        let bound = root.subtask("bound", false);

        root.cancel("shutdown");

        tokio::time::timeout(WAIT, root.wait_finished()).await.unwrap();
        assert!(child.is_finished());
        assert!(grandchild.is_finished());
        assert!(bound.is_finished());
        assert_eq!(
            root.finish_reason(),
            Some(FinishReason::cancelled("shutdown"))
        );
        assert_eq!(root.num_children(), 0);
    }

    #[tokio::test]
    async fn test_cancelling_a_child_leaves_parent_running() {
        let root = Task::root("root");
        let child = root.subtask("child", true);
        let sibling = root.subtask("sibling", true);

        child.cancel("removed");
        tokio::time::timeout(WAIT, child.wait_finished()).await.unwrap();

        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert_eq!(root.num_children(), 1);

        root.finish(FinishReason::Done).await;
    }

    #[tokio::test]
    async fn test_children_finish_before_parent_callbacks() {
        let root = Task::root("root");
        let order = Arc::new(Mutex::new(Vec::new()));

        let child = root.subtask("child", true);
        let o = Arc::clone(&order);
        child.on_finished("child", move || o.lock().push("child"));
        let o = Arc::clone(&order);
        root.on_finished("root", move || o.lock().push("root"));

        root.finish(FinishReason::Done).await;
        assert_eq!(*order.lock(), vec!["child", "root"]);
    }

    #[tokio::test]
    async fn test_bound_children_drain_after_cancellable_siblings() {
        let root = Task::root("root");
        let order = Arc::new(Mutex::new(Vec::new()));

        let bound = root.subtask("routes", false);
        let queue = root.subtask("event_queue", true);

        let o = Arc::clone(&order);
        bound.on_finished("bound", move || o.lock().push("routes"));
        let o = Arc::clone(&order);
        queue.on_finished("queue", move || o.lock().push("event_queue"));

        root.finish(FinishReason::Done).await;
        assert_eq!(*order.lock(), vec!["event_queue", "routes"]);
    }

    #[tokio::test]
    async fn test_on_cancel_runs_before_finish_completes() {
        let root = Task::root("root");
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        root.on_cancel("close_listener", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        root.finish(FinishReason::Done).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_in_body_becomes_finish_reason() {
        let root = Task::root("root");
        let task = root.subtask("worker", true);

        task.spawn(async {
            panic!("boom");
        });

        tokio::time::timeout(WAIT, task.wait_finished()).await.unwrap();
        assert_eq!(task.finish_reason(), Some(FinishReason::Panic("boom".to_string())));
        assert!(task.finish_reason().unwrap().is_failure());
        assert!(!root.is_cancelled());

        root.finish(FinishReason::Done).await;
    }

    #[tokio::test]
    async fn test_subtask_of_finished_parent_is_cancelled() {
        let root = Task::root("root");
        root.finish(FinishReason::Done).await;

        let late = root.subtask("late", true);
        tokio::time::timeout(WAIT, late.wait_finished()).await.unwrap();
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn test_on_finished_after_finish_runs_immediately() {
        let root = Task::root("root");
        root.finish(FinishReason::Done).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        root.on_finished("late", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_block_others() {
        let root = Task::root("root");
        let fired = Arc::new(AtomicUsize::new(0));

        root.on_finished("bad", || panic!("callback"));
        let f = Arc::clone(&fired);
        root.on_finished("good", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        root.finish(FinishReason::Done).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deep_tree_cancellation_terminates() {
        let root = Task::root("root");
        let mut leaves = Vec::new();
        for i in 0..8 {
            let mid = root.subtask(format!("mid{}", i), i % 2 == 0);
            for j in 0..8 {
                leaves.push(mid.subtask(format!("leaf{}", j), j % 3 != 0));
            }
        }

        root.cancel("shutdown");
        tokio::time::timeout(WAIT, root.wait_finished()).await.unwrap();
        assert!(leaves.iter().all(Task::is_finished));
    }

    #[test]
    fn test_finish_reason_classification() {
        assert!(!FinishReason::Done.is_failure());
        assert!(!FinishReason::cancelled("shutdown").is_failure());
        assert!(FinishReason::error("accept failed").is_failure());
        assert!(FinishReason::Panic("x".into()).is_failure());
        assert_eq!(
            FinishReason::cancelled("shutdown").to_string(),
            "cancelled: shutdown"
        );
    }
}

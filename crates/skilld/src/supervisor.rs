//! Supervised background work for one skill instance.
//!
//! Every unit runs on a shared [`TaskTracker`] under a child of one root
//! [`CancellationToken`]. Cancelling the root cancels every unit exactly
//! once; [`Supervisor::join`] waits for all of them to finish. A unit
//! spawned with [`Supervisor::spawn_critical`] that stops on its own cancels
//! the root.

use crate::metrics::{MetricsCollector, TaskEvent};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Bookkeeping for a running unit.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub active: usize,
    pub total_created: u64,
    pub tasks: Vec<TaskAge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskAge {
    pub id: u64,
    pub name: String,
    pub age_secs: f64,
}

/// Handle to one spawned unit; cancelling it leaves siblings running.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    name: String,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct Inner {
    tracker: TaskTracker,
    root: CancellationToken,
    cancelled: AtomicBool,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, TaskInfo>>,
    metrics: Arc<MetricsCollector>,
}

impl Inner {
    fn cancel_all(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(active = self.active.lock().len(), "cancelling supervised tasks");
            self.root.cancel();
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tracker: TaskTracker::new(),
                root: CancellationToken::new(),
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    pub fn spawn<F, E>(&self, name: impl Into<String>, work: F) -> TaskHandle
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.spawn_with_metadata(name, HashMap::new(), work)
    }

    /// Run `work` until it finishes or the unit is cancelled.
    ///
    /// Errors and panics are logged and counted; they never propagate to
    /// the caller or to sibling units.
    pub fn spawn_with_metadata<F, E>(
        &self,
        name: impl Into<String>,
        metadata: HashMap<String, String>,
        work: F,
    ) -> TaskHandle
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let token = self.inner.root.child_token();
        self.launch(name.into(), metadata, token, work, true, false)
    }

    /// Like [`spawn`](Self::spawn), but `work` receives its cancellation
    /// token and is left to observe it, so it can clean up before returning.
    pub fn spawn_cooperative<W, F, E>(&self, name: impl Into<String>, work: W) -> TaskHandle
    where
        W: FnOnce(CancellationToken) -> F,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let token = self.inner.root.child_token();
        let work = work(token.clone());
        self.launch(name.into(), HashMap::new(), token, work, false, false)
    }

    /// Cooperative unit the others depend on. If it returns, fails or panics
    /// without having been cancelled, every other unit is cancelled too.
    pub fn spawn_critical<W, F, E>(&self, name: impl Into<String>, work: W) -> TaskHandle
    where
        W: FnOnce(CancellationToken) -> F,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let token = self.inner.root.child_token();
        let work = work(token.clone());
        self.launch(name.into(), HashMap::new(), token, work, false, true)
    }

    fn launch<F, E>(
        &self,
        name: String,
        metadata: HashMap<String, String>,
        token: CancellationToken,
        work: F,
        preempt: bool,
        critical: bool,
    ) -> TaskHandle
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active.lock().insert(
            id,
            TaskInfo {
                id,
                name: name.clone(),
                created_at: Utc::now(),
                metadata,
            },
        );
        self.inner.metrics.record_task(TaskEvent::Created);
        debug!(task_id = id, task = %name, "spawned task");

        let inner = Arc::clone(&self.inner);
        let task_token = token.clone();
        let task_name = name.clone();
        self.inner.tracker.spawn(async move {
            let started = Instant::now();
            let work = AssertUnwindSafe(work).catch_unwind();
            let outcome = if preempt {
                tokio::select! {
                    () = task_token.cancelled() => None,
                    result = work => Some(result),
                }
            } else {
                match work.await {
                    Ok(Ok(())) if task_token.is_cancelled() => None,
                    result => Some(result),
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            inner.active.lock().remove(&id);
            let stopped_on_its_own = outcome.is_some();

            match outcome {
                None => {
                    inner.metrics.record_task(TaskEvent::Cancelled);
                    debug!(task_id = id, task = %task_name, elapsed_ms, "task cancelled");
                }
                Some(Ok(Ok(()))) => {
                    inner.metrics.record_task(TaskEvent::Completed);
                    debug!(task_id = id, task = %task_name, elapsed_ms, "task completed");
                }
                Some(Ok(Err(e))) => {
                    inner.metrics.record_task(TaskEvent::Failed);
                    error!(task_id = id, task = %task_name, elapsed_ms, error = %e, "task failed");
                }
                Some(Err(_)) => {
                    inner.metrics.record_task(TaskEvent::Failed);
                    error!(task_id = id, task = %task_name, elapsed_ms, "task panicked");
                }
            }

            if critical && stopped_on_its_own {
                error!(
                    task_id = id,
                    task = %task_name,
                    "critical task stopped, cancelling all tasks"
                );
                inner.cancel_all();
            }
        });

        TaskHandle { id, name, token }
    }

    /// Root token; cancelled by [`cancel_all`](Self::cancel_all).
    pub fn token(&self) -> CancellationToken {
        self.inner.root.clone()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn active_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.inner.active.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn stats(&self) -> TaskStats {
        let now = Utc::now();
        let tasks: Vec<TaskAge> = self
            .active_tasks()
            .into_iter()
            .map(|t| TaskAge {
                id: t.id,
                name: t.name,
                age_secs: (now - t.created_at).num_milliseconds().max(0) as f64 / 1000.0,
            })
            .collect();
        TaskStats {
            active: tasks.len(),
            total_created: self.inner.next_id.load(Ordering::Relaxed) - 1,
            tasks,
        }
    }

    /// Cancel every outstanding unit. Later calls are no-ops.
    pub fn cancel_all(&self) {
        self.inner.cancel_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for every spawned unit to finish.
    pub async fn join(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Cancel everything, then wait for it to unwind.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn supervisor() -> Supervisor {
        Supervisor::new(Arc::new(MetricsCollector::new("test")))
    }

    #[tokio::test]
    async fn join_waits_for_all_work() {
        let supervisor = supervisor();
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let done = Arc::clone(&done);
            supervisor.spawn(format!("worker-{i}"), async move {
                tokio::time::sleep(Duration::from_millis(5 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Infallible>(())
            });
        }
        supervisor.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.stats().total_created, 5);
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_work() {
        let supervisor = supervisor();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        supervisor.spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), Infallible>(())
        });
        assert_eq!(supervisor.active_count(), 1);

        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(supervisor.is_cancelled());
        let metrics = supervisor.inner.metrics.snapshot();
        assert_eq!(metrics.tasks.cancelled, 1);
    }

    #[tokio::test]
    async fn handle_cancels_only_its_unit() {
        let supervisor = supervisor();
        let sleeper = supervisor.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), Infallible>(())
        });
        let quick = supervisor.spawn("quick", async { Ok::<(), Infallible>(()) });
        sleeper.cancel();
        supervisor.join().await;
        assert!(sleeper.is_cancelled());
        assert!(!quick.is_cancelled());
        assert!(!supervisor.is_cancelled());
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let supervisor = supervisor();
        supervisor.spawn("fails", async { Err::<(), _>("boom") });
        supervisor.spawn("panics", async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), Infallible>(())
        });
        supervisor.spawn("works", async { Ok::<(), Infallible>(()) });
        supervisor.join().await;

        let metrics = supervisor.inner.metrics.snapshot();
        assert_eq!(metrics.tasks.failed, 2);
        assert_eq!(metrics.tasks.completed, 1);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn cooperative_work_finishes_its_cleanup() {
        let supervisor = supervisor();
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        supervisor.spawn_cooperative("loop", move |token| async move {
            token.cancelled().await;
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), Infallible>(())
        });

        supervisor.shutdown().await;
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(supervisor.inner.metrics.snapshot().tasks.cancelled, 1);
    }

    #[tokio::test]
    async fn failed_critical_unit_cancels_siblings() {
        let supervisor = supervisor();
        let sibling = supervisor.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), Infallible>(())
        });
        supervisor.spawn_critical("loop", |_token| async { Err::<(), _>("connection refused") });

        tokio::time::timeout(Duration::from_secs(5), supervisor.token().cancelled())
            .await
            .unwrap();
        supervisor.join().await;
        assert!(supervisor.is_cancelled());
        assert!(sibling.is_cancelled());
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_critical_unit_is_not_a_failure() {
        let supervisor = supervisor();
        let sibling = supervisor.spawn("quick", async { Ok::<(), Infallible>(()) });
        let critical = supervisor.spawn_critical("loop", |token| async move {
            token.cancelled().await;
            Ok::<(), Infallible>(())
        });
        critical.cancel();
        supervisor.join().await;

        assert!(!supervisor.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert_eq!(supervisor.inner.metrics.snapshot().tasks.failed, 0);
    }

    #[tokio::test]
    async fn stats_report_metadata_and_age() {
        let supervisor = supervisor();
        let mut metadata = HashMap::new();
        metadata.insert("device".to_string(), "lamp".to_string());
        let handle = supervisor.spawn_with_metadata("timer", metadata, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), Infallible>(())
        });

        let active = supervisor.active_tasks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "timer");
        assert_eq!(active[0].metadata["device"], "lamp");
        assert_eq!(supervisor.stats().tasks[0].id, handle.id());

        supervisor.shutdown().await;
    }
}
